//! Generic UEFI PEI and DXE phases, with OCP variants that also measure the
//! vendor version string.

use super::{source, step, Measure, Separators, DXE, OCP_DXE, OCP_PEI, PEI};
use crate::action::Action;
use crate::condition::{OcpVendorVersion, SharedCondition};
use crate::datasource::{SharedSource, UefiFiles, VendorVersion, VolumeContaining};
use crate::firmware::file_type;
use crate::flow::{Branch, Flow, StaticActions};
use crate::state::Actor;
use crate::tpm::{EV_EFI_PLATFORM_FIRMWARE_BLOB, EV_S_CRTM_VERSION};
use std::sync::Arc;

fn pei_volume() -> SharedSource {
    source(VolumeContaining(source(UefiFiles(file_type::PEI_CORE))))
}

fn dxe_volume() -> SharedSource {
    source(VolumeContaining(source(UefiFiles(file_type::DXE_CORE))))
}

pub fn pei() -> Flow {
    Flow::new(
        PEI,
        vec![
            step(Branch {
                cases: vec![(Arc::new(OcpVendorVersion) as SharedCondition, OCP_PEI.to_string())],
                otherwise: vec![],
            }),
            step(Measure::new(0, pei_volume(), EV_EFI_PLATFORM_FIRMWARE_BLOB, b"PEI firmware volume".to_vec())),
            step(StaticActions(vec![
                Action::SetActor(Actor::with_code("PEI", pei_volume())),
                Action::SetFlow(DXE.to_string()),
            ])),
        ],
    )
}

pub fn dxe() -> Flow {
    Flow::new(
        DXE,
        vec![
            step(Measure::new(0, dxe_volume(), EV_EFI_PLATFORM_FIRMWARE_BLOB, b"DXE firmware volume".to_vec())),
            step(StaticActions(vec![Action::SetActor(Actor::with_code("DXE", dxe_volume()))])),
            step(Separators { pcrs: 0..=7, error: false }),
        ],
    )
}

pub fn ocp_pei() -> Flow {
    Flow::new(
        OCP_PEI,
        vec![
            step(Measure::new(0, source(VendorVersion), EV_S_CRTM_VERSION, b"OCP vendor version".to_vec())),
            step(Measure::new(0, pei_volume(), EV_EFI_PLATFORM_FIRMWARE_BLOB, b"PEI firmware volume".to_vec())),
            step(StaticActions(vec![
                Action::SetActor(Actor::with_code("PEI", pei_volume())),
                Action::SetFlow(OCP_DXE.to_string()),
            ])),
        ],
    )
}

pub fn ocp_dxe() -> Flow {
    Flow::new(
        OCP_DXE,
        vec![
            step(Measure::new(0, dxe_volume(), EV_EFI_PLATFORM_FIRMWARE_BLOB, b"DXE firmware volume".to_vec())),
            step(StaticActions(vec![Action::SetActor(Actor::with_code("DXE", dxe_volume()))])),
            step(Separators { pcrs: 0..=7, error: false }),
        ],
    )
}
