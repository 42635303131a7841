//! Boot platforms whose runs produce the command logs under reconstruction
//!
//! Images are BIOS-only and 64 KiB; physical address `p` lives at file
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

const IMAGE_SIZE: usize = 0x10000;
const BASE: u64 = 0x1_0000_0000 - IMAGE_SIZE as u64;
const IBB: Range = Range { offset: 0x8000, length: 0x8000 };

/// Value the hardware reports; the ACM measures it into PCR0
pub const ACM_POLICY_STATUS: u64 = 0x0000_0000_0011_0F21;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub struct Platform {
    pub bytes: Vec<u8>,
    pub layout: FirmwareLayout,
    /// Register snapshot handed to the run, possibly misread
    pub registers: Vec<Register>,
}

fn image_bytes() -> Vec<u8> {
    (0..IMAGE_SIZE).map(|i| (i * 13 % 241) as u8).collect()
}

/// PEI and DXE volumes with their core files
fn volumes() -> FirmwareLayout {
    FirmwareLayout {
        volumes: vec![
            FirmwareVolume { guid: Guid([0x5D; 16]), range: Range::new(0x4000, 0x4000) },
            FirmwareVolume { guid: Guid([0x5E; 16]), range: Range::new(0x8000, 0x4000) },
        ],
        files: vec![
            FirmwareFile { guid: Guid([0x6D; 16]), file_type: file_type::DXE_CORE, range: Range::new(0x4080, 0x100) },
            FirmwareFile { guid: Guid([0x6E; 16]), file_type: file_type::PEI_CORE, range: Range::new(0x8080, 0x100) },
        ],
        ..Default::default()
    }
}

impl Platform {
    /// Boot Guard / CBnT platform with valid manifests and the true ACM policy status
    pub fn cbnt() -> Self {
        let mut bytes = image_bytes();
        let public_key = Range::new(0x3200, 0x40);
        let digests = [
            (HashAlgorithm::Sha1, Range::new(0x3100, 20)),
            (HashAlgorithm::Sha256, Range::new(0x3120, 32)),
        ];
        let ibb = bytes[IBB.offset as usize..IBB.end() as usize].to_vec();
        for (algorithm, range) in digests {
            bytes[range.offset as usize..range.end() as usize].copy_from_slice(algorithm.hash(&ibb).as_bytes());
        }
        let key_hash = HashAlgorithm::Sha256.hash(&bytes[public_key.offset as usize..public_key.end() as usize]);

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
                ibb_segments: vec![IbbSegment { base: BASE + IBB.offset, size: IBB.length, hashed: true, dma_protected: true }],
                ibb_digests: digests
                    .iter()
                    .map(|(algorithm, range)| IbbDigest { algorithm: *algorithm, range: *range })
                    .collect(),
            }),
            ..volumes()
        };
        Self {
            bytes,
            layout,
            registers: vec![Register::from_u64(RegisterId::AcmPolicyStatus, ACM_POLICY_STATUS)],
        }
    }

    /// AMD platform; its measurements carry no register bytes
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
            ..volumes()
        };
        Self {
            bytes: image_bytes(),
            layout,
            registers: vec![],
        }
    }

    /// State with every subsystem attached, positioned at the Root flow
    pub fn state(&self) -> State {
        let mut state = State::new(Arc::new(FlowRegistry::builtin().expect("builtin flows")));
        state
            .add_firmware(FirmwareImage::from_bytes(self.bytes.clone(), self.layout.clone()))
            .expect("firmware");
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
