//! # Intel Flows
//!
//! Boot Guard / CBnT: the ACM verifies KM -> BPM -> IBB in that order, then
//! measures `PCR0_DATA` into PCR0 under SHA-1 and SHA-256. Any verification
//! failure diverts to `IntelCBnTFailure`, which caps PCR0 with an error
//! separator.
//!
//! Legacy TXT: the BIOS startup modules listed in the FIT are measured as the
//! S-CRTM.

use super::{measure_actions, source, step, Measure, INTEL, INTEL_CBNT, INTEL_CBNT_FAILURE, INTEL_LEGACY_TXT, PEI};
use crate::action::{Action, Actions};
use crate::condition::{
    AcmSignatureValid, BootPolicyManifestPresent, BootPolicyManifestValid, IbbDigestValid, KeyManifestValid,
    SharedCondition,
};
use crate::datasource::{
    AcmCode, Bytes, FitEntries, IbbFilter, IbbSegments, Manifest, ManifestRange, Pcr0Data, Selection,
    SharedSource,
};
use crate::firmware::FitEntryType;
use crate::flow::{Branch, Flow, If, SharedStep, StaticActions, Step};
use crate::hash::HashAlgorithm;
use crate::state::{Actor, State};
use crate::subsystem::SubsystemKind;
use crate::tpm::{EV_SEPARATOR, EV_S_CRTM_CONTENTS, SEPARATOR_ERROR};
use std::sync::Arc;

/// Event data of the Boot Guard S-CRTM measurement
pub const BOOT_GUARD_EVENT: &[u8] = b"Boot Guard Measured S-CRTM";

/// Event data of the legacy TXT S-CRTM measurement
pub const LEGACY_SCRTM_EVENT: &[u8] = b"Legacy S-CRTM";

/// Locality the ACM runs at
pub const ACM_LOCALITY: u8 = 3;

pub fn intel() -> Flow {
    Flow::new(
        INTEL,
        vec![step(Branch {
            cases: vec![(Arc::new(BootPolicyManifestPresent) as SharedCondition, INTEL_CBNT.to_string())],
            otherwise: vec![Action::SetFlow(INTEL_LEGACY_TXT.to_string())],
        })],
    )
}

fn ibb_actor() -> Actor {
    Actor::with_code("IBB", source(IbbSegments(IbbFilter::Hashed)))
}

/// Verify with the PCH if `condition` holds, divert to the failure flow otherwise
fn verify_or_fail(condition: SharedCondition, what: SharedSource) -> SharedStep {
    step(If {
        condition,
        then: vec![Action::SetVerified {
            source: what,
            verifier: SubsystemKind::Pch,
        }],
        otherwise: vec![Action::SetFlow(INTEL_CBNT_FAILURE.to_string())],
    })
}

/// The ACM's `PCR0_DATA` measurement into PCR0
#[derive(Debug, Clone)]
pub struct MeasurePcr0Data;

impl Step for MeasurePcr0Data {
    fn actions(&self, state: &State) -> Actions {
        let digests_empty = state
            .firmware()
            .and_then(|f| f.layout().boot_policy.as_ref())
            .is_some_and(|b| b.ibb_digests.is_empty());
        if digests_empty {
            return vec![Action::Panic("IBB digest list is empty".into())];
        }
        [HashAlgorithm::Sha1, HashAlgorithm::Sha256]
            .into_iter()
            .flat_map(|algorithm| {
                let pcr0_data = source(Pcr0Data { algorithm });
                measure_actions(0, algorithm, &pcr0_data, EV_S_CRTM_CONTENTS, BOOT_GUARD_EVENT)
            })
            .collect()
    }

    fn describe(&self) -> String {
        "measure PCR0_DATA".into()
    }
}

pub fn cbnt() -> Flow {
    Flow::new(
        INTEL_CBNT,
        vec![
            step(StaticActions(vec![Action::TpmInit {
                locality: ACM_LOCALITY,
                lazy: true,
            }])),
            step(If {
                condition: Arc::new(AcmSignatureValid),
                then: vec![
                    Action::SetVerified {
                        source: source(AcmCode),
                        verifier: SubsystemKind::Pch,
                    },
                    // authenticated by CPU microcode, nothing to measure
                    Action::SetActor(Actor::new("ACM")),
                ],
                otherwise: vec![Action::SetFlow(INTEL_CBNT_FAILURE.to_string())],
            }),
            verify_or_fail(Arc::new(KeyManifestValid), source(ManifestRange(Manifest::KeyManifest))),
            verify_or_fail(Arc::new(BootPolicyManifestValid), source(ManifestRange(Manifest::BootPolicy))),
            verify_or_fail(Arc::new(IbbDigestValid), source(IbbSegments(IbbFilter::Hashed))),
            step(MeasurePcr0Data),
            step(StaticActions(vec![
                Action::SetActor(ibb_actor()),
                Action::SetFlow(PEI.to_string()),
            ])),
        ],
    )
}

pub fn cbnt_failure() -> Flow {
    Flow::new(
        INTEL_CBNT_FAILURE,
        vec![
            step(StaticActions(vec![Action::TpmInit {
                locality: ACM_LOCALITY,
                lazy: true,
            }])),
            step(Measure::new(
                0,
                source(Bytes(SEPARATOR_ERROR.to_vec())),
                EV_SEPARATOR,
                SEPARATOR_ERROR.to_vec(),
            )),
            step(StaticActions(vec![
                Action::SetActor(ibb_actor()),
                Action::SetFlow(PEI.to_string()),
            ])),
        ],
    )
}

pub fn legacy_txt() -> Flow {
    let startup_modules = source(FitEntries {
        entry_type: FitEntryType::BiosStartupModule,
        selection: Selection::All,
    });
    Flow::new(
        INTEL_LEGACY_TXT,
        vec![
            step(StaticActions(vec![Action::TpmInit { locality: 0, lazy: true }])),
            step(Measure::new(0, startup_modules.clone(), EV_S_CRTM_CONTENTS, LEGACY_SCRTM_EVENT)),
            step(StaticActions(vec![
                Action::SetActor(Actor::with_code("IBB", startup_modules)),
                Action::SetFlow(PEI.to_string()),
            ])),
        ],
    )
}
