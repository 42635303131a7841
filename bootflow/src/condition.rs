//! Pure predicates over [`State`] used to branch flows
//!
//! A condition whose inputs are missing (no firmware, no manifest, unreadable
//! bytes) evaluates to `false`; it never errors.

use crate::datasource::{DataSource, IbbFilter, IbbSegments, VendorVersion};
use crate::firmware::{DirectoryEntry, FirmwareLayout};
use crate::hash::constant_time_compare;
use crate::artifact::{read_range, Range};
use crate::state::State;
use std::fmt;
use std::sync::Arc;

/// Prefix of the vendor version string on OCP firmware
pub const OCP_VENDOR_VERSION_MAGIC: &[u8] = b"OCP";

pub trait Condition: fmt::Debug + Send + Sync {
    fn check(&self, state: &State) -> bool;
    fn describe(&self) -> String;
}

pub type SharedCondition = Arc<dyn Condition>;

fn layout(state: &State) -> Option<&FirmwareLayout> {
    state.firmware().map(|f| f.layout())
}

fn read_firmware(state: &State, range: Range) -> Option<Vec<u8>> {
    read_range(state.firmware()?, range).ok()
}

/// Bytes a source references, or `None` if anything along the way fails
fn read_source(state: &State, source: &dyn DataSource) -> Option<Vec<u8>> {
    let data = source.resolve(state).ok()?;
    data.resolve(state).ok().map(|r| r.value().to_vec())
}

// ============================================================================
// COMBINATORS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Not(pub SharedCondition);

impl Condition for Not {
    fn check(&self, state: &State) -> bool {
        !self.0.check(state)
    }

    fn describe(&self) -> String {
        format!("not {}", self.0.describe())
    }
}

#[derive(Debug, Clone)]
pub struct AllOf(pub Vec<SharedCondition>);

impl Condition for AllOf {
    fn check(&self, state: &State) -> bool {
        self.0.iter().all(|c| c.check(state))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|c| c.describe()).collect();
        format!("all of [{}]", parts.join(", "))
    }
}

#[derive(Debug, Clone)]
pub struct AnyOf(pub Vec<SharedCondition>);

impl Condition for AnyOf {
    fn check(&self, state: &State) -> bool {
        self.0.iter().any(|c| c.check(state))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|c| c.describe()).collect();
        format!("any of [{}]", parts.join(", "))
    }
}

// ============================================================================
// PRESENCE
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct FitPresent;

impl Condition for FitPresent {
    fn check(&self, state: &State) -> bool {
        layout(state).is_some_and(|l| l.has_fit())
    }

    fn describe(&self) -> String {
        "FIT present".into()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BootPolicyManifestPresent;

impl Condition for BootPolicyManifestPresent {
    fn check(&self, state: &State) -> bool {
        layout(state).is_some_and(|l| l.boot_policy.is_some())
    }

    fn describe(&self) -> String {
        "boot policy manifest present".into()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AmdManifestPresent;

impl Condition for AmdManifestPresent {
    fn check(&self, state: &State) -> bool {
        layout(state)
            .and_then(|l| l.amd.as_ref())
            .is_some_and(|a| !a.psp_entries.is_empty())
    }

    fn describe(&self) -> String {
        "AMD PSP directory present".into()
    }
}

// ============================================================================
// INTEL VERIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct AcmSignatureValid;

impl Condition for AcmSignatureValid {
    fn check(&self, state: &State) -> bool {
        layout(state)
            .and_then(|l| l.acm)
            .is_some_and(|a| a.signature_valid)
    }

    fn describe(&self) -> String {
        "ACM signature valid".into()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyManifestValid;

impl Condition for KeyManifestValid {
    fn check(&self, state: &State) -> bool {
        layout(state)
            .and_then(|l| l.key_manifest.as_ref())
            .is_some_and(|k| k.signature_valid)
    }

    fn describe(&self) -> String {
        "key manifest valid".into()
    }
}

/// BPM signature is valid and its key is authorised by the Key Manifest
#[derive(Debug, Clone, Copy)]
pub struct BootPolicyManifestValid;

impl Condition for BootPolicyManifestValid {
    fn check(&self, state: &State) -> bool {
        let Some(layout) = layout(state) else {
            return false;
        };
        let (Some(km), Some(bpm)) = (layout.key_manifest.as_ref(), layout.boot_policy.as_ref()) else {
            return false;
        };
        if !bpm.signature_valid {
            return false;
        }
        let Some(public_key) = read_firmware(state, bpm.public_key_range) else {
            return false;
        };
        km.bpm_key_hashes
            .iter()
            .any(|k| constant_time_compare(k.algorithm.hash(&public_key).as_bytes(), k.digest.as_bytes()))
    }

    fn describe(&self) -> String {
        "boot policy manifest valid".into()
    }
}

/// Hashed IBB segments match every digest stored in the BPM
#[derive(Debug, Clone, Copy)]
pub struct IbbDigestValid;

impl Condition for IbbDigestValid {
    fn check(&self, state: &State) -> bool {
        let Some(bpm) = layout(state).and_then(|l| l.boot_policy.as_ref()) else {
            return false;
        };
        if bpm.ibb_digests.is_empty() {
            return false;
        }
        let Some(ibb) = read_source(state, &IbbSegments(IbbFilter::Hashed)) else {
            return false;
        };
        bpm.ibb_digests.iter().all(|d| {
            read_firmware(state, d.range)
                .is_some_and(|stored| constant_time_compare(d.algorithm.hash(&ibb).as_bytes(), &stored))
        })
    }

    fn describe(&self) -> String {
        "IBB digest valid".into()
    }
}

/// Vendor version string starts with the OCP magic
#[derive(Debug, Clone, Copy)]
pub struct OcpVendorVersion;

impl Condition for OcpVendorVersion {
    fn check(&self, state: &State) -> bool {
        read_source(state, &VendorVersion).is_some_and(|v| v.starts_with(OCP_VENDOR_VERSION_MAGIC))
    }

    fn describe(&self) -> String {
        "OCP vendor version".into()
    }
}

// ============================================================================
// AMD VERIFICATION
// ============================================================================

fn entry_verified(entries: &[DirectoryEntry], entry_type: u32) -> bool {
    entries
        .iter()
        .find(|e| e.entry_type == entry_type)
        .is_some_and(|e| e.verified)
}

#[derive(Debug, Clone, Copy)]
pub struct PspEntryVerified(pub u32);

impl Condition for PspEntryVerified {
    fn check(&self, state: &State) -> bool {
        layout(state)
            .and_then(|l| l.amd.as_ref())
            .is_some_and(|a| entry_verified(&a.psp_entries, self.0))
    }

    fn describe(&self) -> String {
        format!("PSP entry {:#04x} verified", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BiosEntryVerified(pub u32);

impl Condition for BiosEntryVerified {
    fn check(&self, state: &State) -> bool {
        layout(state)
            .and_then(|l| l.amd.as_ref())
            .is_some_and(|a| entry_verified(&a.bios_entries, self.0))
    }

    fn describe(&self) -> String {
        format!("BIOS entry {:#04x} verified", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::state_with;
    use crate::firmware::{BootPolicyInfo, FirmwareImage, FitEntry, FitEntryType, IbbDigest, IbbSegment, KeyHash, KeyManifestInfo};
    use crate::flow::FlowRegistry;
    use crate::hash::HashAlgorithm;

    fn empty_state() -> State {
        State::new(Arc::new(FlowRegistry::builtin().unwrap()))
    }

    #[test]
    fn test_missing_firmware_is_false() {
        let state = empty_state();
        let all: Vec<SharedCondition> = vec![
            Arc::new(FitPresent),
            Arc::new(BootPolicyManifestPresent),
            Arc::new(AmdManifestPresent),
            Arc::new(AcmSignatureValid),
            Arc::new(KeyManifestValid),
            Arc::new(BootPolicyManifestValid),
            Arc::new(IbbDigestValid),
            Arc::new(OcpVendorVersion),
            Arc::new(PspEntryVerified(1)),
        ];
        for condition in &all {
            assert!(!condition.check(&state), "{}", condition.describe());
        }
        assert!(Not(Arc::new(FitPresent)).check(&state));
        assert!(!AnyOf(all.clone()).check(&state));
        assert!(AllOf(vec![]).check(&state));
    }

    #[test]
    fn test_fit_present() {
        let layout = FirmwareLayout {
            fit: vec![FitEntry { entry_type: FitEntryType::StartupAcm, address: 0, size: 0 }],
            ..Default::default()
        };
        assert!(FitPresent.check(&state_with(layout, 0x10)));
    }

    fn bpm_layout(key_hash_ok: bool, digest_ok: bool) -> FirmwareLayout {
        // image bytes are i % 251, so the public key at 0x10..0x14 is [16, 17, 18, 19]
        let key_digest = HashAlgorithm::Sha256.hash(&[16, 17, 18, 19]);
        let key_digest = if key_hash_ok { key_digest } else { HashAlgorithm::Sha256.hash(b"other") };
        let ibb_range = if digest_ok { Range::new(0x20, 0x20) } else { Range::new(0x40, 0x20) };
        FirmwareLayout {
            key_manifest: Some(KeyManifestInfo {
                range: Range::new(0, 0x10),
                signature_range: Range::new(0, 4),
                signature_valid: true,
                bpm_key_hashes: vec![KeyHash { algorithm: HashAlgorithm::Sha256, digest: key_digest }],
            }),
            boot_policy: Some(BootPolicyInfo {
                range: Range::new(0x10, 0x40),
                signature_range: Range::new(0x14, 4),
                signature_valid: true,
                public_key_range: Range::new(0x10, 4),
                ibb_segments: vec![IbbSegment { base: 0xFFFF_FF80, size: 0x80, hashed: true, dma_protected: true }],
                ibb_digests: vec![IbbDigest { algorithm: HashAlgorithm::Sha256, range: ibb_range }],
            }),
            ..Default::default()
        }
    }

    fn with_ibb_digest(layout: FirmwareLayout) -> State {
        // the real IBB digest lives at 0x20
        let mut bytes: Vec<u8> = (0..0x100usize).map(|i| (i % 251) as u8).collect();
        let digest = HashAlgorithm::Sha256.hash(&bytes[0x80..0x100]);
        bytes[0x20..0x40].copy_from_slice(digest.as_bytes());
        let mut state = empty_state();
        state.add_firmware(FirmwareImage::from_bytes(bytes, layout)).unwrap();
        state
    }

    #[test]
    fn test_bpm_key_must_be_authorised() {
        assert!(BootPolicyManifestValid.check(&state_with(bpm_layout(true, true), 0x100)));
        assert!(!BootPolicyManifestValid.check(&state_with(bpm_layout(false, true), 0x100)));
    }

    #[test]
    fn test_ibb_digest() {
        assert!(IbbDigestValid.check(&with_ibb_digest(bpm_layout(true, true))));
        assert!(!IbbDigestValid.check(&with_ibb_digest(bpm_layout(true, false))));
    }

    #[test]
    fn test_ocp_vendor_version() {
        let mut bytes = vec![0u8; 0x20];
        bytes[0x10..0x16].copy_from_slice(b"OCP1.0");
        let layout = FirmwareLayout {
            vendor_version: Some(Range::new(0x10, 6)),
            ..Default::default()
        };
        let mut state = empty_state();
        state.add_firmware(FirmwareImage::from_bytes(bytes, layout)).unwrap();
        assert!(OcpVendorVersion.check(&state));

        let layout = FirmwareLayout {
            vendor_version: Some(Range::new(0x00, 6)),
            ..Default::default()
        };
        assert!(!OcpVendorVersion.check(&state_with(layout, 0x20)));
    }
}
