//! Mutable simulation state
//!
//! One named slot per artifact and subsystem kind; a second instance of the
//! same kind is rejected.

use crate::artifact::{ArtifactKind, SystemArtifact};
use crate::data::{ArtifactProvider, DataRecord};
use crate::datasource::SharedSource;
use crate::firmware::{FirmwareImage, RegisterSnapshot};
use crate::flow::{Flow, FlowRegistry};
use crate::subsystem::{Pch, Psp, Subsystem, SubsystemKind};
use crate::tpm::{CauseCoordinates, Tpm};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("an artifact of kind {0} is already registered")]
    DuplicateArtifact(ArtifactKind),
    #[error("a subsystem of kind {0} is already registered")]
    DuplicateSubsystem(SubsystemKind),
    #[error("unknown flow: {0}")]
    UnknownFlow(String),
}

/// The logical code currently executing
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    /// Code the actor runs; `None` for hardware actors with nothing to measure
    pub code: Option<SharedSource>,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
        }
    }

    pub fn with_code(name: impl Into<String>, code: SharedSource) -> Self {
        Self {
            name: name.into(),
            code: Some(code),
        }
    }
}

/// Log form of an actor change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub name: String,
    pub code: Option<DataRecord>,
    /// Why the code could not be located, if it could not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasuredData {
    pub data: DataRecord,
    pub trust_chain: SubsystemKind,
    pub actor: Option<String>,
    pub source: String,
    pub cause: Option<CauseCoordinates>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedData {
    pub data: DataRecord,
    pub trust_chain: SubsystemKind,
    pub actor: Option<String>,
    pub source: String,
    pub cause: Option<CauseCoordinates>,
}

#[derive(Debug, Clone)]
pub struct State {
    registry: Arc<FlowRegistry>,
    firmware: Option<FirmwareImage>,
    registers: Option<RegisterSnapshot>,
    tpm: Option<Tpm>,
    pch: Option<Pch>,
    psp: Option<Psp>,
    current_flow: Option<Arc<Flow>>,
    step_index: usize,
    flow_changed: bool,
    actor: Option<Actor>,
    actor_change: Option<ActorRecord>,
    measured: Vec<MeasuredData>,
    verified: Vec<VerifiedData>,
    cause: Option<CauseCoordinates>,
}

impl State {
    pub fn new(registry: Arc<FlowRegistry>) -> Self {
        Self {
            registry,
            firmware: None,
            registers: None,
            tpm: None,
            pch: None,
            psp: None,
            current_flow: None,
            step_index: 0,
            flow_changed: false,
            actor: None,
            actor_change: None,
            measured: Vec::new(),
            verified: Vec::new(),
            cause: None,
        }
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    pub fn add_firmware(&mut self, image: FirmwareImage) -> Result<(), StateError> {
        if self.firmware.is_some() {
            return Err(StateError::DuplicateArtifact(ArtifactKind::Firmware));
        }
        self.firmware = Some(image);
        Ok(())
    }

    pub fn add_registers(&mut self, registers: RegisterSnapshot) -> Result<(), StateError> {
        if self.registers.is_some() {
            return Err(StateError::DuplicateArtifact(ArtifactKind::Registers));
        }
        self.registers = Some(registers);
        Ok(())
    }

    pub fn add_subsystem(&mut self, subsystem: impl Into<Subsystem>) -> Result<(), StateError> {
        let subsystem = subsystem.into();
        let kind = subsystem.kind();
        if self.has_subsystem(kind) {
            return Err(StateError::DuplicateSubsystem(kind));
        }
        match subsystem {
            Subsystem::Tpm(tpm) => self.tpm = Some(tpm),
            Subsystem::Pch(pch) => self.pch = Some(pch),
            Subsystem::Psp(psp) => self.psp = Some(psp),
        }
        Ok(())
    }

    /// Select the flow the run starts with
    pub fn set_root_flow(&mut self, name: &str) -> Result<(), StateError> {
        let flow = self
            .registry
            .get(name)
            .ok_or_else(|| StateError::UnknownFlow(name.to_string()))?;
        self.current_flow = Some(flow);
        self.step_index = 0;
        self.flow_changed = false;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn firmware(&self) -> Option<&FirmwareImage> {
        self.firmware.as_ref()
    }

    pub fn registers(&self) -> Option<&RegisterSnapshot> {
        self.registers.as_ref()
    }

    pub fn tpm(&self) -> Option<&Tpm> {
        self.tpm.as_ref()
    }

    pub fn tpm_mut(&mut self) -> Option<&mut Tpm> {
        self.tpm.as_mut()
    }

    pub fn pch(&self) -> Option<&Pch> {
        self.pch.as_ref()
    }

    pub fn psp(&self) -> Option<&Psp> {
        self.psp.as_ref()
    }

    pub fn has_subsystem(&self, kind: SubsystemKind) -> bool {
        match kind {
            SubsystemKind::Tpm => self.tpm.is_some(),
            SubsystemKind::Pch => self.pch.is_some(),
            SubsystemKind::Psp => self.psp.is_some(),
        }
    }

    pub fn current_flow(&self) -> Option<&Arc<Flow>> {
        self.current_flow.as_ref()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn measured(&self) -> &[MeasuredData] {
        &self.measured
    }

    pub fn verified(&self) -> &[VerifiedData] {
        &self.verified
    }

    /// Coordinates of the action being applied
    pub fn cause(&self) -> Option<&CauseCoordinates> {
        self.cause.as_ref()
    }

    // ------------------------------------------------------------------------
    // Mutation (actions and driver)
    // ------------------------------------------------------------------------

    pub(crate) fn switch_flow(&mut self, name: &str) -> Result<(), StateError> {
        let flow = self
            .registry
            .get(name)
            .ok_or_else(|| StateError::UnknownFlow(name.to_string()))?;
        info!("switching to flow {}", flow.name);
        self.current_flow = Some(flow);
        self.step_index = 0;
        self.flow_changed = true;
        Ok(())
    }

    pub(crate) fn set_actor(&mut self, actor: Actor, record: ActorRecord) {
        info!("actor is now {}", actor.name);
        self.actor = Some(actor);
        self.actor_change = Some(record);
    }

    pub(crate) fn take_actor_change(&mut self) -> Option<ActorRecord> {
        self.actor_change.take()
    }

    pub(crate) fn push_measured(&mut self, measured: MeasuredData) {
        self.measured.push(measured);
    }

    pub(crate) fn push_verified(&mut self, verified: VerifiedData) {
        self.verified.push(verified);
    }

    pub(crate) fn set_cause(&mut self, cause: Option<CauseCoordinates>) {
        self.cause = cause;
    }

    /// Move past the current step unless an action replaced the flow
    pub(crate) fn advance(&mut self) {
        if self.flow_changed {
            self.flow_changed = false;
        } else {
            self.step_index += 1;
        }
    }
}

impl ArtifactProvider for State {
    fn artifact(&self, kind: ArtifactKind) -> Option<&dyn SystemArtifact> {
        match kind {
            ArtifactKind::Firmware => self.firmware.as_ref().map(|f| f as &dyn SystemArtifact),
            ArtifactKind::Registers => self.registers.as_ref().map(|r| r as &dyn SystemArtifact),
        }
    }
}
