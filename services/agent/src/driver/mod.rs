//! Driver step registry.
//!
//! A driver supplies the work behind each catalog state: an optional exec
//! step and an optional post step. Steps are registered by state name and
//! checked against the catalog before the loop starts, so a state without
//! its step is reported at startup rather than on first use.

pub mod fake;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nodepool_engine::{Action, Catalog, Step, StepKind};
use thiserror::Error;

use crate::config::Config;
use crate::state::{StoreError, StoreTx};

/// A driver step. Returns `Ok(true)` when the step is done, `Ok(false)` when
/// it should be retried on a later tick.
pub type StepFn =
    Box<dyn Fn(&mut Action, &StoreTx<'_>) -> Result<bool, DriverFault> + Send + Sync>;

/// A step broke the driver contract. Faults are never retried.
#[derive(Debug, Error)]
pub enum DriverFault {
    #[error("step {0} is not registered")]
    Unregistered(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Contract(String),
}

/// Registry validation errors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),

    #[error("state '{state}' declares {step} but the driver does not provide it")]
    MissingStep { state: String, step: String },

    #[error("driver provides {step} but state '{state}' does not declare it")]
    UnexpectedStep { state: String, step: String },

    #[error("driver provides steps for undescribed state '{0}'")]
    UnknownState(String),
}

#[derive(Default)]
struct StateSteps {
    exec: Option<StepFn>,
    post: Option<StepFn>,
}

impl StateSteps {
    fn slot(&mut self, kind: StepKind) -> &mut Option<StepFn> {
        match kind {
            StepKind::Exec => &mut self.exec,
            StepKind::Post => &mut self.post,
        }
    }

    fn get(&self, kind: StepKind) -> Option<&StepFn> {
        match kind {
            StepKind::Exec => self.exec.as_ref(),
            StepKind::Post => self.post.as_ref(),
        }
    }
}

/// Map from state name to its exec and post steps.
#[derive(Default)]
pub struct DriverRegistry {
    name: String,
    steps: HashMap<String, StateSteps>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut states: Vec<&String> = self.steps.keys().collect();
        states.sort();
        f.debug_struct("DriverRegistry")
            .field("name", &self.name)
            .field("states", &states)
            .finish()
    }
}

impl DriverRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register (or replace) the step for one half of a state.
    pub fn register<F>(&mut self, state: &str, kind: StepKind, step: F) -> &mut Self
    where
        F: Fn(&mut Action, &StoreTx<'_>) -> Result<bool, DriverFault> + Send + Sync + 'static,
    {
        *self.steps.entry(state.to_string()).or_default().slot(kind) = Some(Box::new(step));
        self
    }

    pub fn contains(&self, step: &Step) -> bool {
        self.steps
            .get(&step.state)
            .is_some_and(|steps| steps.get(step.kind).is_some())
    }

    /// Check that the registry provides exactly the steps the catalog declares.
    pub fn validate(&self, catalog: &Catalog) -> Result<(), DriverError> {
        if let Some(state) = self
            .steps
            .keys()
            .find(|state| catalog.descriptor(state).is_none())
        {
            return Err(DriverError::UnknownState(state.clone()));
        }

        for (state, desc) in catalog.states() {
            for (kind, declared) in [(StepKind::Exec, desc.exec), (StepKind::Post, desc.post)] {
                let step = Step {
                    state: state.to_string(),
                    kind,
                };
                match (declared, self.contains(&step)) {
                    (true, false) => {
                        return Err(DriverError::MissingStep {
                            state: state.to_string(),
                            step: step.to_string(),
                        })
                    }
                    (false, true) => {
                        return Err(DriverError::UnexpectedStep {
                            state: state.to_string(),
                            step: step.to_string(),
                        })
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Invoke a step.
    pub fn call(
        &self,
        step: &Step,
        action: &mut Action,
        tx: &StoreTx<'_>,
    ) -> Result<bool, DriverFault> {
        let f = self
            .steps
            .get(&step.state)
            .and_then(|steps| steps.get(step.kind))
            .ok_or_else(|| DriverFault::Unregistered(step.to_string()))?;
        f(action, tx)
    }
}

/// Build and validate the registry named in the configuration.
pub fn from_config(config: &Config, catalog: Arc<Catalog>) -> Result<DriverRegistry, DriverError> {
    let registry = match config.driver.as_str() {
        fake::NAME => fake::registry(catalog.clone(), config.fake_success_ratio),
        other => return Err(DriverError::UnknownDriver(other.to_string())),
    };
    registry.validate(&catalog)?;
    Ok(registry)
}
