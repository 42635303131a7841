//! UEFI file lookups

use super::{firmware, firmware_ref, DataSource, SourceError};
use crate::data::Data;
use crate::firmware::Guid;
use crate::state::State;

/// All UEFI files of one type, in image order
#[derive(Debug, Clone)]
pub struct UefiFiles(pub u8);

impl DataSource for UefiFiles {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let image = firmware(state)?;
        let mut ranges: Vec<_> = image
            .layout()
            .files
            .iter()
            .filter(|f| f.file_type == self.0)
            .map(|f| f.range)
            .collect();
        if ranges.is_empty() {
            return Err(SourceError::NotFound(self.describe()));
        }
        ranges.sort();
        Ok(Data::references(ranges.into_iter().map(firmware_ref).collect()))
    }

    fn describe(&self) -> String {
        format!("UEFI files of type {:#04x}", self.0)
    }
}

/// The single UEFI file with a given GUID
#[derive(Debug, Clone)]
pub struct UefiFileByGuid(pub Guid);

impl DataSource for UefiFileByGuid {
    fn resolve(&self, state: &State) -> Result<Data, SourceError> {
        let image = firmware(state)?;
        let matches: Vec<_> = image.layout().files.iter().filter(|f| f.guid == self.0).collect();
        match matches.as_slice() {
            [] => Err(SourceError::NotFound(self.describe())),
            [file] => Ok(Data::references(vec![firmware_ref(file.range)])),
            _ => Err(SourceError::Ambiguous(format!(
                "{} files carry GUID {}",
                matches.len(),
                self.0
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("UEFI file {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Range;
    use crate::datasource::tests::state_with;
    use crate::firmware::{file_type, FirmwareFile, FirmwareLayout};

    fn guid(last: u8) -> Guid {
        let mut g = [0u8; 16];
        g[15] = last;
        Guid(g)
    }

    fn layout() -> FirmwareLayout {
        FirmwareLayout {
            files: vec![
                FirmwareFile { guid: guid(1), file_type: file_type::PEIM, range: Range::new(0x40, 0x10) },
                FirmwareFile { guid: guid(2), file_type: file_type::PEI_CORE, range: Range::new(0x20, 0x10) },
                FirmwareFile { guid: guid(3), file_type: file_type::PEIM, range: Range::new(0x10, 0x08) },
                FirmwareFile { guid: guid(3), file_type: file_type::DRIVER, range: Range::new(0x80, 0x08) },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_files_by_type_in_image_order() {
        let state = state_with(layout(), 0x100);
        let resolved = UefiFiles(file_type::PEIM).resolve(&state).unwrap().resolve(&state).unwrap();
        let ranges: Vec<Range> = resolved.segments.iter().map(|s| s.range).collect();
        assert_eq!(ranges, vec![Range::new(0x10, 0x08), Range::new(0x40, 0x10)]);
        assert!(matches!(
            UefiFiles(file_type::DXE_CORE).resolve(&state),
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn test_file_by_guid() {
        let state = state_with(layout(), 0x100);
        assert!(UefiFileByGuid(guid(2)).resolve(&state).is_ok());
        assert!(matches!(UefiFileByGuid(guid(3)).resolve(&state), Err(SourceError::Ambiguous(_))));
        assert!(matches!(UefiFileByGuid(guid(9)).resolve(&state), Err(SourceError::NotFound(_))));
    }
}
