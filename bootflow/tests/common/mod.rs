//! Synthetic platforms shared by the integration tests
//!
//! Every image is BIOS-only and 64 KiB, so physical address `p` lives at file
//! offset `p - BASE`.

#![allow(dead_code)]

use bootflow::firmware::{
    file_type, AcmInfo, AmdFirmware, BootPolicyInfo, DirectoryEntry, FirmwareFile, FirmwareVolume, FitEntry,
    FitEntryType, Guid, IbbDigest, IbbSegment, KeyHash, KeyManifestInfo, BIOS_ENTRY_RESET_IMAGE,
    PSP_ENTRY_BOOTLOADER,
};
use bootflow::{
    FirmwareImage, FirmwareLayout, FlowRegistry, HashAlgorithm, Pch, Psp, Range, Register, RegisterId,
    RegisterSnapshot, SimulationConfig, State,
};
use std::sync::Arc;

pub const IMAGE_SIZE: usize = 0x10000;
pub const BASE: u64 = 0x1_0000_0000 - IMAGE_SIZE as u64;

pub const DXE_VOLUME: Range = Range { offset: 0x4000, length: 0x4000 };
pub const PEI_VOLUME: Range = Range { offset: 0x8000, length: 0x4000 };
pub const IBB: Range = Range { offset: 0x8000, length: 0x8000 };

pub const ACM_POLICY_STATUS: u64 = 0x0000_0000_0011_0F21;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub struct Platform {
    pub bytes: Vec<u8>,
    pub layout: FirmwareLayout,
    pub registers: Vec<Register>,
}

fn slice(bytes: &[u8], range: Range) -> &[u8] {
    &bytes[range.offset as usize..range.end() as usize]
}

fn uefi_layout() -> FirmwareLayout {
    FirmwareLayout {
        volumes: vec![
            FirmwareVolume { guid: Guid([0xD0; 16]), range: DXE_VOLUME },
            FirmwareVolume { guid: Guid([0xE0; 16]), range: PEI_VOLUME },
        ],
        files: vec![
            FirmwareFile { guid: Guid([0xD1; 16]), file_type: file_type::DXE_CORE, range: Range::new(0x4100, 0x200) },
            FirmwareFile { guid: Guid([0xE1; 16]), file_type: file_type::PEI_CORE, range: Range::new(0x8100, 0x200) },
        ],
        ..Default::default()
    }
}

fn image_bytes() -> Vec<u8> {
    (0..IMAGE_SIZE).map(|i| (i * 7 % 251) as u8).collect()
}

impl Platform {
    /// Intel Boot Guard / CBnT with valid manifests
    pub fn cbnt() -> Self {
        let mut bytes = image_bytes();
        let public_key = Range::new(0x3200, 0x40);
        let sha1_digest = Range::new(0x3100, 20);
        let sha256_digest = Range::new(0x3120, 32);

        let ibb = slice(&bytes, IBB).to_vec();
        let sha1 = HashAlgorithm::Sha1.hash(&ibb);
        let sha256 = HashAlgorithm::Sha256.hash(&ibb);
        bytes[sha1_digest.offset as usize..sha1_digest.end() as usize].copy_from_slice(sha1.as_bytes());
        bytes[sha256_digest.offset as usize..sha256_digest.end() as usize].copy_from_slice(sha256.as_bytes());
        let key_hash = HashAlgorithm::Sha256.hash(slice(&bytes, public_key));

        let layout = FirmwareLayout {
            fit: vec![FitEntry { entry_type: FitEntryType::StartupAcm, address: BASE + 0x1000, size: 0x400 }],
            acm: Some(AcmInfo {
                range: Range::new(0x1000, 0x400),
                svn_range: Range::new(0x1004, 2),
                signature_range: Range::new(0x1100, 0x100),
                signature_valid: true,
            }),
            key_manifest: Some(KeyManifestInfo {
                range: Range::new(0x2000, 0x200),
                signature_range: Range::new(0x2100, 0x80),
                signature_valid: true,
                bpm_key_hashes: vec![KeyHash { algorithm: HashAlgorithm::Sha256, digest: key_hash }],
            }),
            boot_policy: Some(BootPolicyInfo {
                range: Range::new(0x3000, 0x400),
                signature_range: Range::new(0x3300, 0x80),
                signature_valid: true,
                public_key_range: public_key,
                ibb_segments: vec![
                    IbbSegment { base: BASE + 0x8000, size: 0x4000, hashed: true, dma_protected: true },
                    IbbSegment { base: BASE + 0xC000, size: 0x4000, hashed: true, dma_protected: false },
                ],
                ibb_digests: vec![
                    IbbDigest { algorithm: HashAlgorithm::Sha1, range: sha1_digest },
                    IbbDigest { algorithm: HashAlgorithm::Sha256, range: sha256_digest },
                ],
            }),
            ..uefi_layout()
        };
        Self {
            bytes,
            layout,
            registers: vec![Register::from_u64(RegisterId::AcmPolicyStatus, ACM_POLICY_STATUS)],
        }
    }

    /// CBnT platform whose vendor version string carries the OCP magic
    pub fn ocp() -> Self {
        let mut platform = Self::cbnt();
        let version = Range::new(0x3800, 8);
        platform.bytes[0x3800..0x3808].copy_from_slice(b"OCP 1.20");
        platform.layout.vendor_version = Some(version);
        platform
    }

    /// Intel without a Boot Policy Manifest
    pub fn legacy_txt() -> Self {
        let layout = FirmwareLayout {
            fit: vec![
                FitEntry { entry_type: FitEntryType::BiosStartupModule, address: BASE + 0xF000, size: 0x1000 },
                FitEntry { entry_type: FitEntryType::BiosStartupModule, address: BASE + 0xE000, size: 0x800 },
            ],
            ..uefi_layout()
        };
        Self {
            bytes: image_bytes(),
            layout,
            registers: vec![],
        }
    }

    pub fn amd() -> Self {
        let layout = FirmwareLayout {
            amd: Some(AmdFirmware {
                psp_entries: vec![DirectoryEntry {
                    entry_type: PSP_ENTRY_BOOTLOADER,
                    range: Range::new(0x1000, 0x800),
                    verified: true,
                }],
                bios_entries: vec![DirectoryEntry {
                    entry_type: BIOS_ENTRY_RESET_IMAGE,
                    range: Range::new(0xC000, 0x4000),
                    verified: true,
                }],
            }),
            ..uefi_layout()
        };
        Self {
            bytes: image_bytes(),
            layout,
            registers: vec![],
        }
    }

    pub fn range(&self, range: Range) -> &[u8] {
        slice(&self.bytes, range)
    }

    /// Bytes the ACM measures into PCR0 for `algorithm`
    pub fn pcr0_data(&self, algorithm: HashAlgorithm) -> Vec<u8> {
        let acm = self.layout.acm.expect("acm");
        let km = self.layout.key_manifest.as_ref().expect("key manifest");
        let bpm = self.layout.boot_policy.as_ref().expect("boot policy");
        let digest = bpm.ibb_digest(algorithm).expect("ibb digest");
        let mut out = ACM_POLICY_STATUS.to_le_bytes().to_vec();
        for range in [acm.svn_range, acm.signature_range, km.signature_range, bpm.signature_range, digest.range] {
            out.extend_from_slice(self.range(range));
        }
        out
    }

    pub fn image(&self) -> FirmwareImage {
        FirmwareImage::from_bytes(self.bytes.clone(), self.layout.clone())
    }

    /// Fully populated state positioned at the Root flow
    pub fn state(&self) -> State {
        self.state_with_image(self.image())
    }

    pub fn state_with_image(&self, image: FirmwareImage) -> State {
        let mut state = State::new(Arc::new(FlowRegistry::builtin().expect("builtin flows")));
        state.add_firmware(image).expect("firmware");
        if !self.registers.is_empty() {
            let registers = RegisterSnapshot::from_registers(self.registers.clone()).expect("registers");
            state.add_registers(registers).expect("registers");
        }
        state.add_subsystem(SimulationConfig::default().new_tpm()).expect("tpm");
        state.add_subsystem(Pch).expect("pch");
        state.add_subsystem(Psp).expect("psp");
        state.set_root_flow("Root").expect("root flow");
        state
    }
}

/// PCR0 after `Init(locality)` followed by extends of the hashes of `measurements`
pub fn expected_pcr0(algorithm: HashAlgorithm, locality: u8, measurements: &[&[u8]]) -> bootflow::Digest {
    let mut value = bootflow::tpm::initial_pcr_value(0, algorithm, locality);
    for m in measurements {
        value = algorithm.extend(&value, &algorithm.hash(m));
    }
    value
}
