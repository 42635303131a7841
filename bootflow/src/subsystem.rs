//! Trust-chain subsystems taking part in a run
//!
//! Only the TPM carries state; PCH and PSP are markers naming who verified
//! something.

use crate::tpm::Tpm;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    Tpm,
    /// Intel Platform Controller Hub (Boot Guard verification)
    Pch,
    /// AMD Platform Security Processor
    Psp,
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsystemKind::Tpm => write!(f, "TPM"),
            SubsystemKind::Pch => write!(f, "PCH"),
            SubsystemKind::Psp => write!(f, "PSP"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Psp;

#[derive(Debug, Clone)]
pub enum Subsystem {
    Tpm(Tpm),
    Pch(Pch),
    Psp(Psp),
}

impl Subsystem {
    pub fn kind(&self) -> SubsystemKind {
        match self {
            Subsystem::Tpm(_) => SubsystemKind::Tpm,
            Subsystem::Pch(_) => SubsystemKind::Pch,
            Subsystem::Psp(_) => SubsystemKind::Psp,
        }
    }
}

impl From<Tpm> for Subsystem {
    fn from(tpm: Tpm) -> Self {
        Subsystem::Tpm(tpm)
    }
}

impl From<Pch> for Subsystem {
    fn from(pch: Pch) -> Self {
        Subsystem::Pch(pch)
    }
}

impl From<Psp> for Subsystem {
    fn from(psp: Psp) -> Self {
        Subsystem::Psp(psp)
    }
}
