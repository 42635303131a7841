//! # Built-in Platform Flows
//!
//! | Flow               | Entered from            | Ends in        |
//! |--------------------|-------------------------|----------------|
//! | `Root`             | caller                  | Intel / AMD    |
//! | `Intel`            | Root                    | CBnT / TXT     |
//! | `IntelCBnT`        | Intel                   | PEI            |
//! | `IntelCBnTFailure` | IntelCBnT               | PEI            |
//! | `IntelLegacyTXT`   | Intel                   | PEI            |
//! | `AMD`              | Root                    | PEI            |
//! | `PEI` / `OCPPEI`   | platform flows          | DXE / OCPDXE   |
//! | `DXE` / `OCPDXE`   | PEI / OCPPEI            | end of run     |

pub mod amd;
pub mod intel;
pub mod pei;
pub mod root;

use crate::action::{Action, Actions};
use crate::datasource::{Bytes, SharedSource};
use crate::flow::{Flow, SharedStep, Step};
use crate::hash::HashAlgorithm;
use crate::state::State;
use crate::tpm::{PcrIndex, EV_SEPARATOR, SEPARATOR, SEPARATOR_ERROR};
use std::ops::RangeInclusive;
use std::sync::Arc;

pub const ROOT: &str = "Root";
pub const INTEL: &str = "Intel";
pub const INTEL_CBNT: &str = "IntelCBnT";
pub const INTEL_CBNT_FAILURE: &str = "IntelCBnTFailure";
pub const INTEL_LEGACY_TXT: &str = "IntelLegacyTXT";
pub const AMD: &str = "AMD";
pub const PEI: &str = "PEI";
pub const DXE: &str = "DXE";
pub const OCP_PEI: &str = "OCPPEI";
pub const OCP_DXE: &str = "OCPDXE";

/// Every flow registered by `FlowRegistry::builtin()`
pub fn builtin_flows() -> Vec<Flow> {
    vec![
        root::root(),
        intel::intel(),
        intel::cbnt(),
        intel::cbnt_failure(),
        intel::legacy_txt(),
        amd::amd(),
        pei::pei(),
        pei::dxe(),
        pei::ocp_pei(),
        pei::ocp_dxe(),
    ]
}

pub(crate) fn step(step: impl Step + 'static) -> SharedStep {
    Arc::new(step)
}

pub(crate) fn source(source: impl crate::datasource::DataSource + 'static) -> SharedSource {
    Arc::new(source)
}

/// Event-log and extend one source into a PCR, once per TPM bank
#[derive(Debug, Clone)]
pub struct Measure {
    pub pcr: PcrIndex,
    pub source: SharedSource,
    pub event_type: u32,
    pub event_data: Vec<u8>,
}

impl Measure {
    pub fn new(pcr: PcrIndex, source: SharedSource, event_type: u32, event_data: impl Into<Vec<u8>>) -> Self {
        Self {
            pcr,
            source,
            event_type,
            event_data: event_data.into(),
        }
    }
}

/// PCR banks to measure into; SHA-256 when there is no TPM so the extend
/// itself reports the missing subsystem
pub(crate) fn banks(state: &State) -> Vec<HashAlgorithm> {
    state
        .tpm()
        .map(|t| t.supported_algorithms().to_vec())
        .unwrap_or_else(|| vec![HashAlgorithm::Sha256])
}

pub(crate) fn measure_actions(
    pcr: PcrIndex,
    algorithm: HashAlgorithm,
    source: &SharedSource,
    event_type: u32,
    event_data: &[u8],
) -> Actions {
    vec![
        Action::TpmEventLogAdd {
            pcr,
            algorithm,
            source: source.clone(),
            event_type,
            event_data: event_data.to_vec(),
        },
        Action::TpmExtend {
            pcr,
            algorithm,
            source: source.clone(),
        },
    ]
}

impl Step for Measure {
    fn actions(&self, state: &State) -> Actions {
        banks(state)
            .into_iter()
            .flat_map(|algo| measure_actions(self.pcr, algo, &self.source, self.event_type, &self.event_data))
            .collect()
    }

    fn describe(&self) -> String {
        format!("measure {} into PCR{}", self.source.describe(), self.pcr)
    }
}

/// EV_SEPARATOR measurements closing a range of PCRs
#[derive(Debug, Clone)]
pub struct Separators {
    pub pcrs: RangeInclusive<PcrIndex>,
    pub error: bool,
}

impl Step for Separators {
    fn actions(&self, state: &State) -> Actions {
        let value = if self.error { SEPARATOR_ERROR } else { SEPARATOR };
        let separator = source(Bytes(value.to_vec()));
        let algorithms = banks(state);
        self.pcrs
            .clone()
            .flat_map(|pcr| {
                algorithms
                    .iter()
                    .flat_map(|algo| measure_actions(pcr, *algo, &separator, EV_SEPARATOR, &value))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!(
            "separators PCR{}..=PCR{}{}",
            self.pcrs.start(),
            self.pcrs.end(),
            if self.error { " (error)" } else { "" }
        )
    }
}
