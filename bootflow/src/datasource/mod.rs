//! # Data Sources
//!
//! A data source computes a [`Data`] value from the current [`State`]. Flows
//! compose them freely, so they are open trait objects shared via
//! [`SharedSource`].
//!
//! A source that matches nothing fails with [`SourceError::NotFound`]; empty
//! data is only returned where it is a documented valid result.

pub mod amd;
pub mod intel;
pub mod uefi;

pub use amd::{BiosEntry, PspEntry};
pub use intel::{AcmCode, IbbFilter, IbbSegments, Manifest, ManifestRange, Pcr0Data, VendorVersion};
pub use uefi::{UefiFileByGuid, UefiFiles};

use crate::artifact::{ArtifactError, ArtifactKind, IdentityMapper, PhysMemMapper, Range, Ranges};
use crate::data::{Data, DataConverter, DataError, HashConverter, Reference};
use crate::firmware::{FirmwareImage, FitEntryType, RegionKind, RegisterId, RegisterSnapshot};
use crate::hash::HashAlgorithm;
use crate::state::State;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("ambiguous match: {0}")]
    Ambiguous(String),
    #[error("unsupported composition: {0}")]
    UnsupportedComposition(String),
    #[error("artifact {0} is not available")]
    MissingArtifact(ArtifactKind),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub trait DataSource: fmt::Debug + Send + Sync {
    fn resolve(&self, state: &State) -> Result<Data, SourceError>;

    /// Human readable description used in logs
    fn describe(&self) -> String;
}

pub type SharedSource = Arc<dyn DataSource>;

pub(crate) fn firmware(state: &State) -> Result<&FirmwareImage, SourceError> {
    state
        .firmware()
        .ok_or(SourceError::MissingArtifact(ArtifactKind::Firmware))
}

pub(crate) fn registers(state: &State) -> Result<&RegisterSnapshot, SourceError> {
    state
        .registers()
        .ok_or(SourceError::MissingArtifact(ArtifactKind::Registers))
}

pub(crate) fn firmware_ref(range: Range) -> Reference {
    Reference::native(ArtifactKind::Firmware, Ranges::single(range))
}

pub(crate) fn physical_ref(ranges: impl Into<Ranges>) -> Reference {
    Reference::mapped(ArtifactKind::Firmware, Arc::new(PhysMemMapper), ranges)
}

/// Plain references without a converter, or an error naming `who`
fn plain_references(data: Data, who: &str) -> Result<Vec<Reference>, SourceError> {
    match data {
        Data::References {
            references,
            converter: None,
        } => Ok(references),
        Data::References { converter: Some(c), .. } => Err(SourceError::UnsupportedComposition(format!(
            "{} cannot take data already converted by {}",
            who,
            c.name()
        ))),
        Data::Bytes(_) => Err(SourceError::UnsupportedComposition(format!(
            "{} cannot take literal bytes",
            who
        ))),
    }
}

// ============================================================================
// GENERIC SOURCES
// ============================================================================

/// Literal bytes
#[derive(Debug, Clone)]
pub struct Bytes(pub Vec<u8>);

impl DataSource for Bytes {
    fn resolve(&self, _state: &State) -> Result<Data, SourceError> {
        Ok(Data::Bytes(self.0.clone()))
    }

    fn describe(&self) -> String {
        format!("bytes {}", hex::encode(&self.0))
    }
}

/// Hash of the bytes another source references
#[derive(Debug, Clone)]
pub struct Hashed {
    pub inner: SharedSource,
    pub algorithm: HashAlgorithm,
}

impl DataSource for Hashed {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let references = plain_references(self.inner.resolve(state)?, "hashed")?;
        let converter: Arc<dyn DataConverter> = Arc::new(HashConverter(self.algorithm));
        Ok(Data::References {
            references,
            converter: Some(converter),
        })
    }

    fn describe(&self) -> String {
        format!("{}({})", self.algorithm, self.inner.describe())
    }
}

/// Concatenation of several reference-only sources, in order
#[derive(Debug, Clone)]
pub struct Concat(pub Vec<SharedSource>);

impl DataSource for Concat {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let mut references = Vec::new();
        for part in &self.0 {
            references.extend(plain_references(part.resolve(state)?, "concat")?);
        }
        if references.is_empty() {
            return Err(SourceError::NotFound("concat of nothing".into()));
        }
        Ok(Data::references(references))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|p| p.describe()).collect();
        format!("concat({})", parts.join(", "))
    }
}

/// Normalises the references of another source into sorted, merged native ranges
#[derive(Debug, Clone)]
pub struct SortAndMerge(pub SharedSource);

impl DataSource for SortAndMerge {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        use crate::data::ArtifactProvider;

        let references = plain_references(self.0.resolve(state)?, "sort-and-merge")?;
        let mut by_artifact: BTreeMap<ArtifactKind, Ranges> = BTreeMap::new();
        for reference in &references {
            let artifact = state
                .artifact(reference.artifact)
                .ok_or(SourceError::MissingArtifact(reference.artifact))?;
            let native = reference.resolve(artifact)?;
            by_artifact
                .entry(reference.artifact)
                .or_default()
                .0
                .extend(native.0);
        }
        Ok(Data::references(
            by_artifact
                .into_iter()
                .map(|(kind, ranges)| Reference::native(kind, ranges.merged()))
                .collect(),
        ))
    }

    fn describe(&self) -> String {
        format!("sorted({})", self.0.describe())
    }
}

/// The smallest firmware volume enclosing everything another source references
#[derive(Debug, Clone)]
pub struct VolumeContaining(pub SharedSource);

impl DataSource for VolumeContaining {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let image = firmware(state)?;
        let references = plain_references(self.0.resolve(state)?, "volume-containing")?;
        let mut wanted = Ranges::new();
        for reference in &references {
            if reference.artifact != ArtifactKind::Firmware {
                return Err(SourceError::UnsupportedComposition(
                    "volume-containing only works on firmware references".into(),
                ));
            }
            wanted.0.extend(reference.resolve(image)?.0);
        }

        let mut candidates: Vec<Range> = image
            .layout()
            .volumes
            .iter()
            .map(|v| v.range)
            .filter(|r| wanted.is_subset_of(&Ranges::single(*r)))
            .collect();
        candidates.sort_by_key(|r| (r.length, r.offset));
        candidates.dedup();
        match candidates.as_slice() {
            [] => Err(SourceError::NotFound(format!(
                "no firmware volume contains {}",
                self.0.describe()
            ))),
            [first, second, ..] if first.length == second.length => Err(SourceError::Ambiguous(format!(
                "volumes {} and {} both contain {}",
                first,
                second,
                self.0.describe()
            ))),
            [smallest, ..] => Ok(Data::references(vec![firmware_ref(*smallest)])),
        }
    }

    fn describe(&self) -> String {
        format!("volume containing {}", self.0.describe())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    First,
    All,
}

/// Intel FIT entries of one type, addressed through physical memory
#[derive(Debug, Clone)]
pub struct FitEntries {
    pub entry_type: FitEntryType,
    pub selection: Selection,
}

impl DataSource for FitEntries {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let image = firmware(state)?;
        let mut entries = image.layout().fit_entries(self.entry_type);
        let references: Vec<Reference> = match self.selection {
            Selection::First => entries
                .next()
                .map(|e| vec![physical_ref(Ranges::single(e.physical_range()))])
                .unwrap_or_default(),
            Selection::All => entries
                .map(|e| physical_ref(Ranges::single(e.physical_range())))
                .collect(),
        };
        if references.is_empty() {
            return Err(SourceError::NotFound(self.describe()));
        }
        Ok(Data::references(references))
    }

    fn describe(&self) -> String {
        let which = match self.selection {
            Selection::First => "first",
            Selection::All => "all",
        };
        format!("{} FIT entries of type {:#04x}", which, self.entry_type.code())
    }
}

/// A flash region by kind
#[derive(Debug, Clone)]
pub struct FlashRegionOf(pub RegionKind);

impl DataSource for FlashRegionOf {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let image = firmware(state)?;
        let region = image
            .layout()
            .regions
            .iter()
            .find(|r| r.kind == self.0)
            .ok_or_else(|| SourceError::NotFound(self.describe()))?;
        Ok(Data::References {
            references: vec![Reference::mapped(
                ArtifactKind::Firmware,
                Arc::new(IdentityMapper),
                Ranges::single(region.range),
            )],
            converter: None,
        })
    }

    fn describe(&self) -> String {
        format!("{:?} flash region", self.0)
    }
}

/// Raw value of one register
#[derive(Debug, Clone)]
pub struct RegisterValue(pub RegisterId);

impl DataSource for RegisterValue {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let range = registers(state)?
            .range_of(self.0)
            .ok_or_else(|| SourceError::NotFound(format!("register {}", self.0)))?;
        Ok(Data::references(vec![Reference::native(
            ArtifactKind::Registers,
            Ranges::single(range),
        )]))
    }

    fn describe(&self) -> String {
        format!("register {}", self.0)
    }
}
