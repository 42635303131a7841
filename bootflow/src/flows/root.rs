//! Entry flow: pick the platform family

use super::{step, AMD, INTEL, ROOT};
use crate::action::Action;
use crate::condition::{AmdManifestPresent, FitPresent, SharedCondition};
use crate::flow::{Branch, Flow};
use std::sync::Arc;

pub fn root() -> Flow {
    Flow::new(
        ROOT,
        vec![step(Branch {
            cases: vec![
                (Arc::new(FitPresent) as SharedCondition, INTEL.to_string()),
                (Arc::new(AmdManifestPresent) as SharedCondition, AMD.to_string()),
            ],
            otherwise: vec![Action::Panic(
                "firmware has neither an Intel FIT nor an AMD PSP directory".into(),
            )],
        })],
    )
}
