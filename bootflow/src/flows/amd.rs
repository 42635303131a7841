//! AMD: the PSP verifies its off-chip bootloader and the BIOS reset image,
//! then the reset image is measured into PCR0.

use super::{source, step, Measure, AMD, PEI};
use crate::action::Action;
use crate::condition::{BiosEntryVerified, PspEntryVerified};
use crate::datasource::{BiosEntry, PspEntry};
use crate::firmware::{BIOS_ENTRY_RESET_IMAGE, PSP_ENTRY_BOOTLOADER};
use crate::flow::{Flow, If, StaticActions};
use crate::state::Actor;
use crate::subsystem::SubsystemKind;
use crate::tpm::EV_EFI_PLATFORM_FIRMWARE_BLOB;
use std::sync::Arc;

pub fn amd() -> Flow {
    let reset_image = source(BiosEntry(BIOS_ENTRY_RESET_IMAGE));
    Flow::new(
        AMD,
        vec![
            step(StaticActions(vec![
                Action::TpmInit { locality: 0, lazy: true },
                Action::SetActor(Actor::new("PSP")),
            ])),
            step(If {
                condition: Arc::new(PspEntryVerified(PSP_ENTRY_BOOTLOADER)),
                then: vec![Action::SetVerified {
                    source: source(PspEntry(PSP_ENTRY_BOOTLOADER)),
                    verifier: SubsystemKind::Psp,
                }],
                otherwise: vec![],
            }),
            step(If {
                condition: Arc::new(BiosEntryVerified(BIOS_ENTRY_RESET_IMAGE)),
                then: vec![Action::SetVerified {
                    source: reset_image.clone(),
                    verifier: SubsystemKind::Psp,
                }],
                otherwise: vec![],
            }),
            step(Measure::new(
                0,
                reset_image.clone(),
                EV_EFI_PLATFORM_FIRMWARE_BLOB,
                b"BIOS reset image".to_vec(),
            )),
            step(StaticActions(vec![
                Action::SetActor(Actor::with_code("BIOS", reset_image)),
                Action::SetFlow(PEI.to_string()),
            ])),
        ],
    )
}
