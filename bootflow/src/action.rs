//! Atomic state mutations produced by flow steps
//!
//! The set of actions is closed: every mutation a flow can make is one of the
//! [`Action`] variants below, so replaying a run is exhaustive by construction.

use crate::data::{DataError, DataRecord};
use crate::datasource::{SharedSource, SourceError};
use crate::hash::HashAlgorithm;
use crate::state::{Actor, ActorRecord, MeasuredData, State, StateError, VerifiedData};
use crate::subsystem::SubsystemKind;
use crate::tpm::{Command, PcrIndex, Preimage, TpmError};
use crate::Digest;
use log::debug;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown flow: {0}")]
    UnknownFlow(String),
    #[error("subsystem {0} is not part of this platform")]
    MissingSubsystem(SubsystemKind),
    #[error("panic: {0}")]
    Panic(String),
    #[error("cannot locate code of actor {actor}: {reason}")]
    ActorCode { actor: String, reason: String },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
}

impl ActionError {
    /// Whether the run must stop instead of recording a step issue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ActionError::UnknownFlow(_) | ActionError::MissingSubsystem(_) | ActionError::Panic(_)
        )
    }
}

impl From<StateError> for ActionError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::UnknownFlow(name) => ActionError::UnknownFlow(name),
            other => ActionError::Panic(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    SetActor(Actor),
    SetFlow(String),
    /// `lazy` skips the reset when the TPM is already initialised
    TpmInit { locality: u8, lazy: bool },
    TpmExtend {
        pcr: PcrIndex,
        algorithm: HashAlgorithm,
        source: SharedSource,
    },
    TpmEventLogAdd {
        pcr: PcrIndex,
        algorithm: HashAlgorithm,
        source: SharedSource,
        event_type: u32,
        event_data: Vec<u8>,
    },
    SetVerified {
        source: SharedSource,
        verifier: SubsystemKind,
    },
    Panic(String),
}

pub type Actions = Vec<Action>;

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::SetActor(actor) => write!(f, "SetActor({})", actor.name),
            Action::SetFlow(name) => write!(f, "SetFlow({})", name),
            Action::TpmInit { locality, lazy } => {
                write!(f, "TPMInit(locality={}{})", locality, if *lazy { ", lazy" } else { "" })
            }
            Action::TpmExtend { pcr, algorithm, source } => {
                write!(f, "TPMExtend(PCR{}, {}, {})", pcr, algorithm, source.describe())
            }
            Action::TpmEventLogAdd {
                pcr,
                algorithm,
                event_type,
                ..
            } => write!(f, "TPMEventLogAdd(PCR{}, {}, type={:#x})", pcr, algorithm, event_type),
            Action::SetVerified { source, verifier } => {
                write!(f, "SetVerified({}, by {})", source.describe(), verifier)
            }
            Action::Panic(reason) => write!(f, "Panic({})", reason),
        }
    }
}

/// Digest a source measures to, plus what was hashed
struct Measurement {
    digest: Digest,
    preimage: Option<Preimage>,
    record: DataRecord,
}

fn measure(state: &State, source: &SharedSource, algorithm: HashAlgorithm) -> Result<Measurement, ActionError> {
    let data = source.resolve(state)?;
    let resolved = data.resolve(state)?;
    match resolved.converted {
        Some(converted) => Ok(Measurement {
            digest: Digest(converted),
            preimage: None,
            record: resolved.record,
        }),
        None => Ok(Measurement {
            digest: algorithm.hash(&resolved.raw),
            preimage: Some(Preimage {
                bytes: resolved.raw,
                segments: resolved.segments,
            }),
            record: resolved.record,
        }),
    }
}

fn require(state: &State, kind: SubsystemKind) -> Result<(), ActionError> {
    if state.has_subsystem(kind) {
        Ok(())
    } else {
        Err(ActionError::MissingSubsystem(kind))
    }
}

impl Action {
    pub fn apply(&self, state: &mut State) -> Result<(), ActionError> {
        debug!("apply {}", self);
        match self {
            Action::SetActor(actor) => {
                let (code, code_error) = match &actor.code {
                    None => (None, None),
                    Some(source) => match source
                        .resolve(state)
                        .map_err(ActionError::from)
                        .and_then(|data| Ok(data.record(&*state)?))
                    {
                        Ok(record) => (Some(record), None),
                        Err(err) => (None, Some(err.to_string())),
                    },
                };
                let record = ActorRecord {
                    name: actor.name.clone(),
                    code,
                    code_error: code_error.clone(),
                };
                state.set_actor(actor.clone(), record);
                match code_error {
                    Some(reason) => Err(ActionError::ActorCode {
                        actor: actor.name.clone(),
                        reason,
                    }),
                    None => Ok(()),
                }
            }
            Action::SetFlow(name) => Ok(state.switch_flow(name)?),
            Action::TpmInit { locality, lazy } => {
                let cause = state.cause().cloned();
                let tpm = state
                    .tpm_mut()
                    .ok_or(ActionError::MissingSubsystem(SubsystemKind::Tpm))?;
                if *lazy && tpm.is_initialized() {
                    return Ok(());
                }
                tpm.execute(Command::Init { locality: *locality }, cause, None)?;
                Ok(())
            }
            Action::TpmExtend { pcr, algorithm, source } => {
                require(state, SubsystemKind::Tpm)?;
                let measurement = measure(state, source, *algorithm)?;
                let cause = state.cause().cloned();
                let actor = state.actor().map(|a| a.name.clone());
                let tpm = state
                    .tpm_mut()
                    .ok_or(ActionError::MissingSubsystem(SubsystemKind::Tpm))?;
                tpm.execute(
                    Command::Extend {
                        pcr: *pcr,
                        algorithm: *algorithm,
                        digest: measurement.digest,
                    },
                    cause.clone(),
                    measurement.preimage,
                )?;
                state.push_measured(MeasuredData {
                    data: measurement.record,
                    trust_chain: SubsystemKind::Tpm,
                    actor,
                    source: source.describe(),
                    cause,
                });
                Ok(())
            }
            Action::TpmEventLogAdd {
                pcr,
                algorithm,
                source,
                event_type,
                event_data,
            } => {
                require(state, SubsystemKind::Tpm)?;
                let measurement = measure(state, source, *algorithm)?;
                let cause = state.cause().cloned();
                let tpm = state
                    .tpm_mut()
                    .ok_or(ActionError::MissingSubsystem(SubsystemKind::Tpm))?;
                tpm.execute(
                    Command::EventLogAdd {
                        pcr: *pcr,
                        algorithm: *algorithm,
                        digest: measurement.digest,
                        event_type: *event_type,
                        data: event_data.clone(),
                    },
                    cause,
                    None,
                )?;
                Ok(())
            }
            Action::SetVerified { source, verifier } => {
                require(state, *verifier)?;
                let data = source.resolve(state)?;
                let record = data.record(&*state)?;
                let verified = VerifiedData {
                    data: record,
                    trust_chain: *verifier,
                    actor: state.actor().map(|a| a.name.clone()),
                    source: source.describe(),
                    cause: state.cause().cloned(),
                };
                state.push_verified(verified);
                Ok(())
            }
            Action::Panic(reason) => Err(ActionError::Panic(reason.clone())),
        }
    }
}
