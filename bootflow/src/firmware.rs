//! # Firmware Image and Register Snapshot
//!
//! Structured descriptions handed in by firmware parsers. Nothing here decodes
//! a binary format: a [`FirmwareLayout`] only says where things are.
//!
//! ## Coordinate Systems
//!
//! | Field                      | Coordinates       |
//! |----------------------------|-------------------|
//! | FIT entry addresses        | physical memory   |
//! | IBB segment bases          | physical memory   |
//! | everything else            | file offsets      |

use crate::artifact::{BytesArtifact, FileArtifact, Range, SystemArtifact};
use crate::config::ConfigError;
use crate::hash::HashAlgorithm;
use crate::Digest;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// FLASH REGIONS
// ============================================================================

/// Intel flash descriptor region kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Descriptor,
    Bios,
    Me,
    Gbe,
    Pdr,
    Ec,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRegion {
    pub kind: RegionKind,
    pub range: Range,
}

// ============================================================================
// INTEL FIT
// ============================================================================

/// Firmware Interface Table entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitEntryType {
    Header,
    MicrocodeUpdate,
    StartupAcm,
    DiagnosticAcm,
    BiosStartupModule,
    TpmPolicy,
    BiosPolicy,
    TxtPolicy,
    KeyManifest,
    BootPolicyManifest,
    CseSecureBoot,
    Other(u8),
}

impl FitEntryType {
    pub const fn code(self) -> u8 {
        match self {
            FitEntryType::Header => 0x00,
            FitEntryType::MicrocodeUpdate => 0x01,
            FitEntryType::StartupAcm => 0x02,
            FitEntryType::DiagnosticAcm => 0x03,
            FitEntryType::BiosStartupModule => 0x07,
            FitEntryType::TpmPolicy => 0x08,
            FitEntryType::BiosPolicy => 0x09,
            FitEntryType::TxtPolicy => 0x0A,
            FitEntryType::KeyManifest => 0x0B,
            FitEntryType::BootPolicyManifest => 0x0C,
            FitEntryType::CseSecureBoot => 0x10,
            FitEntryType::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => FitEntryType::Header,
            0x01 => FitEntryType::MicrocodeUpdate,
            0x02 => FitEntryType::StartupAcm,
            0x03 => FitEntryType::DiagnosticAcm,
            0x07 => FitEntryType::BiosStartupModule,
            0x08 => FitEntryType::TpmPolicy,
            0x09 => FitEntryType::BiosPolicy,
            0x0A => FitEntryType::TxtPolicy,
            0x0B => FitEntryType::KeyManifest,
            0x0C => FitEntryType::BootPolicyManifest,
            0x10 => FitEntryType::CseSecureBoot,
            other => FitEntryType::Other(other),
        }
    }
}

/// One FIT entry; `address` is a physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitEntry {
    pub entry_type: FitEntryType,
    pub address: u64,
    pub size: u64,
}

impl FitEntry {
    pub const fn physical_range(&self) -> Range {
        Range::new(self.address, self.size)
    }
}

// ============================================================================
// UEFI
// ============================================================================

/// EFI_FV_FILETYPE values used by the built-in flows
pub mod file_type {
    pub const SECURITY_CORE: u8 = 0x03;
    pub const PEI_CORE: u8 = 0x04;
    pub const DXE_CORE: u8 = 0x05;
    pub const PEIM: u8 = 0x06;
    pub const DRIVER: u8 = 0x07;
    pub const FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
}

/// A UEFI GUID in its on-disk byte order
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid(pub [u8; 16]);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            LittleEndian::read_u32(&b[0..4]),
            LittleEndian::read_u16(&b[4..6]),
            LittleEndian::read_u16(&b[6..8]),
            b[8],
            b[9]
        )?;
        for byte in &b[10..] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

impl FromStr for Guid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        let lens = [8, 4, 4, 4, 12];
        if parts.len() != 5 || parts.iter().zip(lens).any(|(p, l)| p.len() != l) {
            return Err(format!("malformed GUID: {}", s));
        }
        let bad = |_| format!("malformed GUID: {}", s);
        let mut out = [0u8; 16];
        LittleEndian::write_u32(&mut out[0..4], u32::from_str_radix(parts[0], 16).map_err(bad)?);
        LittleEndian::write_u16(&mut out[4..6], u16::from_str_radix(parts[1], 16).map_err(bad)?);
        LittleEndian::write_u16(&mut out[6..8], u16::from_str_radix(parts[2], 16).map_err(bad)?);
        let tail = hex::decode(format!("{}{}", parts[3], parts[4])).map_err(|_| format!("malformed GUID: {}", s))?;
        out[8..].copy_from_slice(&tail);
        Ok(Guid(out))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVolume {
    pub guid: Guid,
    pub range: Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareFile {
    pub guid: Guid,
    pub file_type: u8,
    pub range: Range,
}

// ============================================================================
// INTEL BOOT GUARD / CBnT MANIFESTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmInfo {
    pub range: Range,
    pub svn_range: Range,
    pub signature_range: Range,
    pub signature_valid: bool,
}

/// A key hash authorised by the Key Manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHash {
    pub algorithm: HashAlgorithm,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyManifestInfo {
    pub range: Range,
    pub signature_range: Range,
    pub signature_valid: bool,
    #[serde(default)]
    pub bpm_key_hashes: Vec<KeyHash>,
}

/// IBB segment; `base` is a physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbbSegment {
    pub base: u64,
    pub size: u64,
    #[serde(default = "default_true")]
    pub hashed: bool,
    #[serde(default)]
    pub dma_protected: bool,
}

impl IbbSegment {
    pub const fn physical_range(&self) -> Range {
        Range::new(self.base, self.size)
    }
}

fn default_true() -> bool {
    true
}

/// Location of a stored IBB digest inside the Boot Policy Manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbbDigest {
    pub algorithm: HashAlgorithm,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootPolicyInfo {
    pub range: Range,
    pub signature_range: Range,
    pub signature_valid: bool,
    pub public_key_range: Range,
    #[serde(default)]
    pub ibb_segments: Vec<IbbSegment>,
    #[serde(default)]
    pub ibb_digests: Vec<IbbDigest>,
}

impl BootPolicyInfo {
    pub fn ibb_digest(&self, algorithm: HashAlgorithm) -> Option<&IbbDigest> {
        self.ibb_digests.iter().find(|d| d.algorithm == algorithm)
    }
}

// ============================================================================
// AMD PSP / BIOS DIRECTORIES
// ============================================================================

/// PSP directory entry type of the off-chip bootloader
pub const PSP_ENTRY_BOOTLOADER: u32 = 0x01;

/// BIOS directory entry type of the BIOS reset image
pub const BIOS_ENTRY_RESET_IMAGE: u32 = 0x62;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub entry_type: u32,
    pub range: Range,
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmdFirmware {
    pub psp_entries: Vec<DirectoryEntry>,
    pub bios_entries: Vec<DirectoryEntry>,
}

// ============================================================================
// LAYOUT & IMAGE
// ============================================================================

/// Everything a firmware parser located inside an image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareLayout {
    pub regions: Vec<FlashRegion>,
    pub fit: Vec<FitEntry>,
    pub volumes: Vec<FirmwareVolume>,
    pub files: Vec<FirmwareFile>,
    pub acm: Option<AcmInfo>,
    pub key_manifest: Option<KeyManifestInfo>,
    pub boot_policy: Option<BootPolicyInfo>,
    pub amd: Option<AmdFirmware>,
    pub vendor_version: Option<Range>,
}

impl FirmwareLayout {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn fit_entries(&self, entry_type: FitEntryType) -> impl Iterator<Item = &FitEntry> {
        self.fit.iter().filter(move |e| e.entry_type == entry_type)
    }

    pub fn has_fit(&self) -> bool {
        !self.fit.is_empty()
    }
}

/// A firmware byte artifact together with its parsed layout
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    artifact: Arc<dyn SystemArtifact>,
    layout: FirmwareLayout,
}

impl FirmwareImage {
    pub fn new(artifact: Arc<dyn SystemArtifact>, layout: FirmwareLayout) -> Self {
        Self { artifact, layout }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>, layout: FirmwareLayout) -> Self {
        Self::new(Arc::new(BytesArtifact::new(bytes)), layout)
    }

    pub fn open(path: &Path, layout: FirmwareLayout) -> io::Result<Self> {
        Ok(Self::new(Arc::new(FileArtifact::open(path)?), layout))
    }

    pub fn layout(&self) -> &FirmwareLayout {
        &self.layout
    }
}

impl SystemArtifact for FirmwareImage {
    fn size(&self) -> u64 {
        self.artifact.size()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.artifact.read_at(buf, offset)
    }

    fn flash_regions(&self) -> &[FlashRegion] {
        &self.layout.regions
    }
}

// ============================================================================
// REGISTERS
// ============================================================================

/// Registers the built-in flows know about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegisterId {
    /// TXT public space 0x378
    AcmPolicyStatus,
    /// TXT public space 0x0A0
    TxtBootStatus,
    /// TXT public space 0x328
    AcmStatus,
    /// AMD MP0 C2P mailbox 37
    Mp0C2pMsg37,
}

impl RegisterId {
    /// Architectural width in bytes
    pub const fn size(self) -> usize {
        match self {
            RegisterId::AcmPolicyStatus | RegisterId::TxtBootStatus | RegisterId::AcmStatus => 8,
            RegisterId::Mp0C2pMsg37 => 4,
        }
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterId::AcmPolicyStatus => "ACM_POLICY_STATUS",
            RegisterId::TxtBootStatus => "TXT_BOOT_STATUS",
            RegisterId::AcmStatus => "ACM_STATUS",
            RegisterId::Mp0C2pMsg37 => "MP0_C2P_MSG_37",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub id: RegisterId,
    #[serde(with = "crate::hex_bytes")]
    pub value: Vec<u8>,
}

impl Register {
    pub fn new(id: RegisterId, value: impl Into<Vec<u8>>) -> Self {
        Self { id, value: value.into() }
    }

    /// Register from an integer value, little-endian at the register's width
    pub fn from_u64(id: RegisterId, value: u64) -> Self {
        let bytes = value.to_le_bytes();
        Self::new(id, &bytes[..id.size().min(8)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("register {0} given more than once")]
    Duplicate(RegisterId),
    #[error("register {id} must be {expected} bytes, got {actual}")]
    Size {
        id: RegisterId,
        expected: usize,
        actual: usize,
    },
}

/// Register values exposed as one artifact (values concatenated in order)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    registers: Vec<(Register, Range)>,
    bytes: Vec<u8>,
}

impl RegisterSnapshot {
    pub fn from_registers(registers: impl IntoIterator<Item = Register>) -> Result<Self, RegisterError> {
        let mut laid_out: Vec<(Register, Range)> = Vec::new();
        let mut bytes = Vec::new();
        for reg in registers {
            if laid_out.iter().any(|(r, _)| r.id == reg.id) {
                return Err(RegisterError::Duplicate(reg.id));
            }
            if reg.value.len() != reg.id.size() {
                return Err(RegisterError::Size {
                    id: reg.id,
                    expected: reg.id.size(),
                    actual: reg.value.len(),
                });
            }
            let range = Range::new(bytes.len() as u64, reg.value.len() as u64);
            bytes.extend_from_slice(&reg.value);
            laid_out.push((reg, range));
        }
        Ok(Self { registers: laid_out, bytes })
    }

    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.registers.iter().map(|(r, _)| r)
    }

    pub fn value(&self, id: RegisterId) -> Option<&[u8]> {
        self.registers
            .iter()
            .find(|(r, _)| r.id == id)
            .map(|(r, _)| r.value.as_slice())
    }

    /// Native range of a register inside the snapshot artifact
    pub fn range_of(&self, id: RegisterId) -> Option<Range> {
        self.registers.iter().find(|(r, _)| r.id == id).map(|(_, range)| *range)
    }

    pub fn acm_policy_status(&self) -> Option<u64> {
        self.value(RegisterId::AcmPolicyStatus).map(LittleEndian::read_u64)
    }
}

impl SystemArtifact for RegisterSnapshot {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = offset as usize;
        if start >= self.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::read_range;

    #[test]
    fn test_fit_type_codes() {
        for code in 0u8..=0x20 {
            assert_eq!(FitEntryType::from_code(code).code(), code);
        }
        assert_eq!(FitEntryType::from_code(0x0C), FitEntryType::BootPolicyManifest);
    }

    #[test]
    fn test_guid_text_form() {
        let text = "8C8CE578-8A3D-4F1C-9935-896185C32DD3";
        let guid: Guid = text.parse().unwrap();
        assert_eq!(guid.0[0], 0x78);
        assert_eq!(guid.to_string(), text);
        assert!("not-a-guid".parse::<Guid>().is_err());
    }

    #[test]
    fn test_layout_from_json_defaults() {
        let layout = FirmwareLayout::from_json(
            r#"{
                "fit": [{"entry_type": "startup_acm", "address": 4294901760, "size": 16}],
                "boot_policy": {
                    "range": {"offset": 0, "length": 16},
                    "signature_range": {"offset": 0, "length": 4},
                    "signature_valid": true,
                    "public_key_range": {"offset": 4, "length": 4},
                    "ibb_segments": [{"base": 4294967040, "size": 256}]
                }
            }"#,
        )
        .unwrap();
        assert!(layout.has_fit());
        assert!(layout.regions.is_empty());
        let bpm = layout.boot_policy.unwrap();
        assert!(bpm.ibb_segments[0].hashed);
        assert!(!bpm.ibb_segments[0].dma_protected);
    }

    #[test]
    fn test_register_snapshot_layout() {
        let snap = RegisterSnapshot::from_registers([
            Register::from_u64(RegisterId::AcmPolicyStatus, 0x1122_3344_5566_7788),
            Register::new(RegisterId::Mp0C2pMsg37, vec![1, 2, 3, 4]),
        ])
        .unwrap();
        assert_eq!(snap.size(), 12);
        assert_eq!(snap.range_of(RegisterId::Mp0C2pMsg37), Some(Range::new(8, 4)));
        assert_eq!(snap.acm_policy_status(), Some(0x1122_3344_5566_7788));
        assert_eq!(read_range(&snap, Range::new(8, 4)).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(snap.value(RegisterId::AcmStatus), None);
    }

    #[test]
    fn test_register_snapshot_rejects_duplicates_and_bad_sizes() {
        let dup = RegisterSnapshot::from_registers([
            Register::from_u64(RegisterId::AcmStatus, 1),
            Register::from_u64(RegisterId::AcmStatus, 2),
        ]);
        assert_eq!(dup, Err(RegisterError::Duplicate(RegisterId::AcmStatus)));

        let short = RegisterSnapshot::from_registers([Register::new(RegisterId::AcmPolicyStatus, vec![0; 4])]);
        assert!(matches!(short, Err(RegisterError::Size { expected: 8, actual: 4, .. })));
    }
}
