//! # Boot Process Driver
//!
//! Steps a [`State`] through its flows, recording per step the actions that
//! ran, their issues, and the measured/verified data and actor changes they
//! produced.
//!
//! Non-fatal action errors become issues in the [`Log`]; fatal ones (unknown
//! flow, missing subsystem, `Panic`) abort the run. A step budget turns flow
//! ping-pong into [`ProcessError::ExecutionBudgetExceeded`] instead of a hang.

use crate::action::ActionError;
use crate::config::{ConfigError, SimulationConfig};
use crate::state::{ActorRecord, MeasuredData, State, VerifiedData};
use crate::tpm::CauseCoordinates;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no flow selected")]
    NoFlow,
    #[error("execution budget of {0} steps exceeded")]
    ExecutionBudgetExceeded(usize),
    #[error("fatal error at {cause}: {error}")]
    Fatal {
        cause: CauseCoordinates,
        error: ActionError,
        /// Everything logged up to and including the failing step
        log: Box<Log>,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One applied action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measured: Vec<MeasuredData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verified: Vec<VerifiedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorRecord>,
}

/// One executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position in the whole run
    pub index: usize,
    pub flow: String,
    pub step_index: usize,
    pub step: String,
    pub actions: Vec<ActionRecord>,
}

impl StepRecord {
    pub fn issues(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| a.issue.as_deref())
    }

    pub fn measured(&self) -> impl Iterator<Item = &MeasuredData> {
        self.actions.iter().flat_map(|a| a.measured.iter())
    }

    pub fn verified(&self) -> impl Iterator<Item = &VerifiedData> {
        self.actions.iter().flat_map(|a| a.verified.iter())
    }
}

/// Causal trace of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub steps: Vec<StepRecord>,
}

impl Log {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn issue_count(&self) -> usize {
        self.steps.iter().map(|s| s.issues().count()).sum()
    }

    /// Flows in the order they were entered
    pub fn flow_path(&self) -> Vec<&str> {
        let mut path: Vec<&str> = self.steps.iter().map(|s| s.flow.as_str()).collect();
        path.dedup();
        path
    }
}

#[derive(Debug)]
pub struct BootResult {
    pub log: Log,
    pub state: State,
}

pub struct BootProcess {
    state: State,
    log: Log,
    max_steps: usize,
}

impl BootProcess {
    pub fn new(state: State, config: &SimulationConfig) -> Self {
        Self {
            state,
            log: Log::default(),
            max_steps: config.max_steps,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Execute the current step; `Ok(false)` once the flow is exhausted
    pub fn step(&mut self) -> Result<bool, ProcessError> {
        let Some(flow) = self.state.current_flow().cloned() else {
            return Ok(false);
        };
        let step_index = self.state.step_index();
        let Some(step) = flow.step(step_index).cloned() else {
            return Ok(false);
        };
        if self.log.steps.len() >= self.max_steps {
            return Err(ProcessError::ExecutionBudgetExceeded(self.max_steps));
        }

        debug!("{}[{}]: {}", flow.name, step_index, step.describe());
        let actions = step.actions(&self.state);
        let mut record = StepRecord {
            index: self.log.steps.len(),
            flow: flow.name.clone(),
            step_index,
            step: step.describe(),
            actions: Vec::with_capacity(actions.len()),
        };

        for (action_index, action) in actions.iter().enumerate() {
            let cause = CauseCoordinates {
                flow: flow.name.clone(),
                step_index,
                action_index,
            };
            self.state.set_cause(Some(cause.clone()));
            let measured_before = self.state.measured().len();
            let verified_before = self.state.verified().len();

            let result = action.apply(&mut self.state);

            let mut action_record = ActionRecord {
                action: action.to_string(),
                issue: None,
                measured: self.state.measured()[measured_before..].to_vec(),
                verified: self.state.verified()[verified_before..].to_vec(),
                actor: self.state.take_actor_change(),
            };
            if let Err(error) = result {
                if error.is_fatal() {
                    action_record.issue = Some(error.to_string());
                    record.actions.push(action_record);
                    self.log.steps.push(record);
                    self.state.set_cause(None);
                    return Err(ProcessError::Fatal {
                        cause,
                        error,
                        log: Box::new(self.log.clone()),
                    });
                }
                warn!("{}: {}", cause, error);
                action_record.issue = Some(error.to_string());
            }
            record.actions.push(action_record);
        }

        self.state.set_cause(None);
        self.state.advance();
        self.log.steps.push(record);
        Ok(true)
    }

    /// Step until every flow is exhausted
    pub fn finish(&mut self) -> Result<(), ProcessError> {
        while self.step()? {}
        info!(
            "boot flow finished after {} steps with {} issues",
            self.log.steps.len(),
            self.log.issue_count()
        );
        Ok(())
    }

    pub fn into_result(self) -> BootResult {
        BootResult {
            log: self.log,
            state: self.state,
        }
    }
}

/// Run the selected flow of `state` to completion
pub fn run_flow(state: State, config: &SimulationConfig) -> Result<BootResult, ProcessError> {
    config.validate()?;
    if state.current_flow().is_none() {
        return Err(ProcessError::NoFlow);
    }
    let mut process = BootProcess::new(state, config);
    process.finish()?;
    Ok(process.into_result())
}
