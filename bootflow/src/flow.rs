//! # Flows and Steps
//!
//! A [`Flow`] is a named list of [`Step`]s. A step looks at the current
//! [`State`] and yields actions without mutating anything; the driver applies
//! them. Branching happens only through `SetFlow` actions.
//!
//! Flows live in an explicit [`FlowRegistry`] keyed by lowercase name.

use crate::action::{Action, Actions};
use crate::condition::SharedCondition;
use crate::state::State;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("flow {0} is already registered")]
    Duplicate(String),
}

pub trait Step: fmt::Debug + Send + Sync {
    fn actions(&self, state: &State) -> Actions;
    fn describe(&self) -> String;
}

pub type SharedStep = Arc<dyn Step>;

/// A fixed list of actions
#[derive(Debug, Clone)]
pub struct StaticActions(pub Vec<Action>);

impl Step for StaticActions {
    fn actions(&self, _state: &State) -> Actions {
        self.0.clone()
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|a| a.to_string()).collect();
        parts.join("; ")
    }
}

/// Actions chosen by a condition
#[derive(Debug, Clone)]
pub struct If {
    pub condition: SharedCondition,
    pub then: Vec<Action>,
    pub otherwise: Vec<Action>,
}

impl Step for If {
    fn actions(&self, state: &State) -> Actions {
        if self.condition.check(state) {
            self.then.clone()
        } else {
            self.otherwise.clone()
        }
    }

    fn describe(&self) -> String {
        format!("if {}", self.condition.describe())
    }
}

/// Switch to the flow of the first case whose condition holds
#[derive(Debug, Clone)]
pub struct Branch {
    pub cases: Vec<(SharedCondition, String)>,
    pub otherwise: Vec<Action>,
}

impl Step for Branch {
    fn actions(&self, state: &State) -> Actions {
        self.cases
            .iter()
            .find(|(condition, _)| condition.check(state))
            .map(|(_, flow)| vec![Action::SetFlow(flow.clone())])
            .unwrap_or_else(|| self.otherwise.clone())
    }

    fn describe(&self) -> String {
        let cases: Vec<String> = self
            .cases
            .iter()
            .map(|(c, flow)| format!("{} => {}", c.describe(), flow))
            .collect();
        format!("branch [{}]", cases.join(", "))
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub name: String,
    pub steps: Vec<SharedStep>,
}

impl Flow {
    pub fn new(name: impl Into<String>, steps: Vec<SharedStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&SharedStep> {
        self.steps.get(index)
    }
}

/// Case-insensitive, duplicate-free set of flows
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<Flow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in platform flows
    pub fn builtin() -> Result<Self, FlowError> {
        Self::from_flows(crate::flows::builtin_flows())
    }

    pub fn from_flows(flows: impl IntoIterator<Item = Flow>) -> Result<Self, FlowError> {
        let mut registry = Self::new();
        for flow in flows {
            registry.register(flow)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, flow: Flow) -> Result<(), FlowError> {
        let key = flow.name.to_lowercase();
        if self.flows.contains_key(&key) {
            return Err(FlowError::Duplicate(flow.name));
        }
        self.flows.insert(key, Arc::new(flow));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows.get(&name.to_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(&name.to_lowercase())
    }

    /// Registered flow names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.flows.values().map(|f| f.name.as_str()).collect();
        names.sort();
        names
    }
}
