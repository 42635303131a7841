//! AMD PSP and BIOS directory entries

use super::{firmware, firmware_ref, DataSource, SourceError};
use crate::data::Data;
use crate::firmware::{AmdFirmware, DirectoryEntry};
use crate::state::State;

fn amd(state: &State) -> Result<&AmdFirmware, SourceError> {
    firmware(state)?
        .layout()
        .amd
        .as_ref()
        .ok_or_else(|| SourceError::NotFound("AMD firmware directories".into()))
}

fn first_of(entries: &[DirectoryEntry], entry_type: u32) -> Option<&DirectoryEntry> {
    entries.iter().find(|e| e.entry_type == entry_type)
}

/// First PSP directory entry of a type
#[derive(Debug, Clone)]
pub struct PspEntry(pub u32);

impl DataSource for PspEntry {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let entry = first_of(&amd(state)?.psp_entries, self.0)
            .ok_or_else(|| SourceError::NotFound(self.describe()))?;
        Ok(Data::references(vec![firmware_ref(entry.range)]))
    }

    fn describe(&self) -> String {
        format!("PSP directory entry {:#04x}", self.0)
    }
}

/// First BIOS directory entry of a type
#[derive(Debug, Clone)]
pub struct BiosEntry(pub u32);

impl DataSource for BiosEntry {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let entry = first_of(&amd(state)?.bios_entries, self.0)
            .ok_or_else(|| SourceError::NotFound(self.describe()))?;
        Ok(Data::references(vec![firmware_ref(entry.range)]))
    }

    fn describe(&self) -> String {
        format!("BIOS directory entry {:#04x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Range;
    use crate::datasource::tests::state_with;
    use crate::firmware::{FirmwareLayout, BIOS_ENTRY_RESET_IMAGE, PSP_ENTRY_BOOTLOADER};

    #[test]
    fn test_directory_entries() {
        let layout = FirmwareLayout {
            amd: Some(AmdFirmware {
                psp_entries: vec![DirectoryEntry {
                    entry_type: PSP_ENTRY_BOOTLOADER,
                    range: Range::new(0x10, 0x10),
                    verified: true,
                }],
                bios_entries: vec![DirectoryEntry {
                    entry_type: BIOS_ENTRY_RESET_IMAGE,
                    range: Range::new(0x80, 0x80),
                    verified: true,
                }],
            }),
            ..Default::default()
        };
        let state = state_with(layout, 0x100);
        let psp = PspEntry(PSP_ENTRY_BOOTLOADER).resolve(&state).unwrap().resolve(&state).unwrap();
        assert_eq!(psp.segments[0].range, Range::new(0x10, 0x10));
        assert!(matches!(PspEntry(0x30).resolve(&state), Err(SourceError::NotFound(_))));
        assert!(BiosEntry(BIOS_ENTRY_RESET_IMAGE).resolve(&state).is_ok());

        let intel = state_with(FirmwareLayout::default(), 0x10);
        assert!(matches!(BiosEntry(BIOS_ENTRY_RESET_IMAGE).resolve(&intel), Err(SourceError::NotFound(_))));
    }
}
