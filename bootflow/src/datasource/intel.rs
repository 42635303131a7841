//! # Intel Boot Guard / CBnT Sources
//!
//! `PCR0_DATA`, the structure the ACM measures into PCR0, is laid out as:
//!
//! ```text
//! ACM_POLICY_STATUS (8) || ACM SVN || ACM signature || KM signature || BPM signature || IBB digest
//! ```
//!
//! Every piece is a reference into an artifact, so a corrupted byte can be
//! traced back to where it came from.

use super::{firmware, firmware_ref, physical_ref, registers, DataSource, SourceError};
use crate::artifact::{ArtifactKind, Range, Ranges};
use crate::data::{Data, Reference};
use crate::firmware::{BootPolicyInfo, RegisterId};
use crate::hash::HashAlgorithm;
use crate::state::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IbbFilter {
    Hashed,
    DmaProtected,
    All,
}

fn boot_policy(state: &State) -> Result<&BootPolicyInfo, SourceError> {
    firmware(state)?
        .layout()
        .boot_policy
        .as_ref()
        .ok_or_else(|| SourceError::NotFound("boot policy manifest".into()))
}

/// IBB segments listed in the Boot Policy Manifest, in manifest order
#[derive(Debug, Clone)]
pub struct IbbSegments(pub IbbFilter);

impl DataSource for IbbSegments {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let bpm = boot_policy(state)?;
        let references: Vec<Reference> = bpm
            .ibb_segments
            .iter()
            .filter(|s| match self.0 {
                IbbFilter::Hashed => s.hashed,
                IbbFilter::DmaProtected => s.dma_protected,
                IbbFilter::All => true,
            })
            .map(|s| physical_ref(Ranges::single(s.physical_range())))
            .collect();
        // no DMA-protected segments is a legal policy
        if references.is_empty() && self.0 != IbbFilter::DmaProtected {
            return Err(SourceError::NotFound(self.describe()));
        }
        Ok(Data::references(references))
    }

    fn describe(&self) -> String {
        match self.0 {
            IbbFilter::Hashed => "hashed IBB segments".into(),
            IbbFilter::DmaProtected => "DMA-protected IBB segments".into(),
            IbbFilter::All => "IBB segments".into(),
        }
    }
}

/// The startup ACM binary
#[derive(Debug, Clone)]
pub struct AcmCode;

impl DataSource for AcmCode {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let acm = firmware(state)?
            .layout()
            .acm
            .ok_or_else(|| SourceError::NotFound(self.describe()))?;
        Ok(Data::references(vec![firmware_ref(acm.range)]))
    }

    fn describe(&self) -> String {
        "startup ACM".into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifest {
    Acm,
    KeyManifest,
    BootPolicy,
}

/// Whole manifest byte range
#[derive(Debug, Clone)]
pub struct ManifestRange(pub Manifest);

impl DataSource for ManifestRange {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let layout = firmware(state)?.layout();
        let range = match self.0 {
            Manifest::Acm => layout.acm.map(|a| a.range),
            Manifest::KeyManifest => layout.key_manifest.as_ref().map(|k| k.range),
            Manifest::BootPolicy => layout.boot_policy.as_ref().map(|b| b.range),
        };
        let range = range.ok_or_else(|| SourceError::NotFound(self.describe()))?;
        Ok(Data::references(vec![firmware_ref(range)]))
    }

    fn describe(&self) -> String {
        format!("{:?} manifest", self.0)
    }
}

/// Vendor version string (measured as S-CRTM version on OCP platforms)
#[derive(Debug, Clone)]
pub struct VendorVersion;

impl DataSource for VendorVersion {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let range = firmware(state)?
            .layout()
            .vendor_version
            .ok_or_else(|| SourceError::NotFound(self.describe()))?;
        Ok(Data::references(vec![firmware_ref(range)]))
    }

    fn describe(&self) -> String {
        "vendor version".into()
    }
}

/// The `PCR0_DATA` structure for one PCR bank
#[derive(Debug, Clone)]
pub struct Pcr0Data {
    pub algorithm: HashAlgorithm,
}

impl DataSource for Pcr0Data {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let missing = |what: &str| SourceError::NotFound(format!("PCR0_DATA: {}", what));

        let policy_status = registers(state)?
            .range_of(RegisterId::AcmPolicyStatus)
            .ok_or_else(|| missing("ACM_POLICY_STATUS register"))?;
        let layout = firmware(state)?.layout();
        let acm = layout.acm.ok_or_else(|| missing("ACM"))?;
        let km = layout.key_manifest.as_ref().ok_or_else(|| missing("key manifest"))?;
        let bpm = layout.boot_policy.as_ref().ok_or_else(|| missing("boot policy manifest"))?;
        let ibb_digest = bpm
            .ibb_digest(self.algorithm)
            .ok_or_else(|| missing(&format!("{} IBB digest", self.algorithm)))?;

        let firmware_ranges: [Range; 5] = [
            acm.svn_range,
            acm.signature_range,
            km.signature_range,
            bpm.signature_range,
            ibb_digest.range,
        ];
        let mut references = vec![Reference::native(
            ArtifactKind::Registers,
            Ranges::single(policy_status),
        )];
        references.extend(firmware_ranges.into_iter().map(firmware_ref));
        Ok(Data::references(references))
    }

    fn describe(&self) -> String {
        format!("PCR0_DATA ({})", self.algorithm)
    }
}
