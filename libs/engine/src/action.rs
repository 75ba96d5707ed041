//! The live execution record for one resource.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{Catalog, Checkpoint, LOST};

/// Configuration errors raised while moving an action between states.
///
/// Whenever one of these is returned the action has been forced to `lost`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("no state list for process '{process}' (environment {environment:?})")]
    NoStateList {
        process: String,
        environment: Option<String>,
    },

    #[error("process '{process}' has no state after index {index}")]
    Exhausted { process: String, index: usize },

    #[error("state '{0}' is not described in the catalog")]
    UnknownState(String),
}

/// One process run against one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub resource: String,
    pub address: Option<String>,
    pub environment: Option<String>,
    pub process: String,

    /// Index in the process state list. `None` until the first advance.
    pub state_idx: Option<usize>,

    /// Current state, possibly carrying an `_exec`/`_post` suffix.
    pub state: Option<String>,

    pub updated_at: Option<DateTime<Utc>>,

    /// Set when this action was hard rebooted at that point of a process.
    pub reboot_checkpoint: Option<Checkpoint>,
}

impl Action {
    /// A fresh action with no process started yet.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            address: None,
            environment: None,
            process: String::new(),
            state_idx: None,
            state: None,
            updated_at: None,
            reboot_checkpoint: None,
        }
    }

    pub fn with_address(mut self, address: Option<String>) -> Self {
        self.address = address;
        self
    }

    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    /// Move to the next state of the current process.
    ///
    /// On error the action is left in `lost`.
    pub fn advance(&mut self, catalog: &Catalog, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let Some(states) = catalog.states_for(&self.process, self.environment.as_deref()) else {
            self.state = Some(LOST.to_string());
            return Err(TransitionError::NoStateList {
                process: self.process.clone(),
                environment: self.environment.clone(),
            });
        };

        let next = match self.state_idx {
            None => 0,
            Some(idx) if idx + 1 < states.len() => idx + 1,
            Some(idx) => {
                self.state = Some(LOST.to_string());
                return Err(TransitionError::Exhausted {
                    process: self.process.clone(),
                    index: idx,
                });
            }
        };

        self.state_idx = Some(next);
        self.state = Some(states[next].clone());
        self.updated_at = Some(now);
        Ok(())
    }

    /// Start `process` from its first state.
    pub fn init_process(
        &mut self,
        process: &str,
        catalog: &Catalog,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.process = process.to_string();
        self.state_idx = None;
        self.state = None;
        self.advance(catalog, now)
    }

    /// The current resume point, if the process has started.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.state_idx
            .map(|idx| Checkpoint::new(self.process.clone(), idx))
    }

    /// Position the action so that the next [`advance`](Self::advance) lands
    /// on the checkpointed state.
    pub fn resume_from(&mut self, checkpoint: &Checkpoint) {
        self.process = checkpoint.process.clone();
        self.state_idx = checkpoint.index.checked_sub(1);
        self.state = None;
    }

    /// Current state without its `_exec`/`_post` suffix.
    pub fn bare_state(&self) -> Option<&str> {
        self.state.as_deref().map(crate::bare_state)
    }

    pub fn is_lost(&self) -> bool {
        self.state.as_deref() == Some(LOST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProcessVariant, StateDescriptor};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn catalog() -> Catalog {
        let states = ["s0", "s1", "s2", "s3", "s4", "done"]
            .into_iter()
            .map(|name| {
                let desc = StateDescriptor {
                    exec: name != "done",
                    ..Default::default()
                };
                (name.to_string(), desc)
            })
            .collect();
        let processes = vec![
            ProcessVariant {
                name: "deploy".into(),
                environments: vec!["minimal".into()],
                states: vec!["s0".into(), "done".into()],
            },
            ProcessVariant {
                name: "deploy".into(),
                environments: vec![],
                states: ["s0", "s1", "s2", "s3", "s4", "done"]
                    .map(String::from)
                    .to_vec(),
            },
        ];
        Catalog::new(processes, states, BTreeMap::new()).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_advance_starts_at_zero() {
        let catalog = catalog();
        let mut action = Action::new("node-1");
        action.init_process("deploy", &catalog, at(0)).unwrap();

        assert_eq!(action.state_idx, Some(0));
        assert_eq!(action.state.as_deref(), Some("s0"));
        assert_eq!(action.updated_at, Some(at(0)));
    }

    #[test]
    fn test_environment_selects_variant() {
        let catalog = catalog();
        let mut action = Action::new("node-1").with_environment(Some("minimal".into()));
        action.init_process("deploy", &catalog, at(0)).unwrap();
        action.advance(&catalog, at(1)).unwrap();
        assert_eq!(action.state.as_deref(), Some("done"));
    }

    #[test]
    fn test_exhausted_process_is_lost() {
        let catalog = catalog();
        let mut action = Action::new("node-1").with_environment(Some("minimal".into()));
        action.init_process("deploy", &catalog, at(0)).unwrap();
        action.advance(&catalog, at(1)).unwrap();

        let err = action.advance(&catalog, at(2)).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Exhausted {
                process: "deploy".into(),
                index: 1
            }
        );
        assert!(action.is_lost());
    }

    #[test]
    fn test_unknown_process_is_lost() {
        let catalog = catalog();
        let mut action = Action::new("node-1");
        let err = action.init_process("custom", &catalog, at(0)).unwrap_err();
        assert!(matches!(err, TransitionError::NoStateList { .. }));
        assert!(action.is_lost());
    }

    #[test]
    fn test_resume_from_index_zero_restarts() {
        let catalog = catalog();
        let mut action = Action::new("node-1");
        action.resume_from(&Checkpoint::new("deploy", 0));
        assert_eq!(action.state_idx, None);
        action.advance(&catalog, at(0)).unwrap();
        assert_eq!(action.state.as_deref(), Some("s0"));
    }

    #[test]
    fn test_checkpoint_requires_started_process() {
        let action = Action::new("node-1");
        assert_eq!(action.checkpoint(), None);
    }

    proptest! {
        #[test]
        fn prop_state_idx_is_monotonic(steps in 1usize..12) {
            let catalog = catalog();
            let mut action = Action::new("node-1");
            action.init_process("deploy", &catalog, at(0)).unwrap();
            let mut last = action.state_idx.unwrap();
            for step in 0..steps {
                if action.advance(&catalog, at(step as i64 + 1)).is_err() {
                    prop_assert!(action.is_lost());
                    break;
                }
                let idx = action.state_idx.unwrap();
                prop_assert!(idx > last);
                last = idx;
            }
        }

        #[test]
        fn prop_checkpoint_resume_lands_on_same_state(index in 1usize..6) {
            let catalog = catalog();
            let mut action = Action::new("node-1");
            action.init_process("deploy", &catalog, at(0)).unwrap();
            for _ in 0..index {
                action.advance(&catalog, at(1)).unwrap();
            }
            let expected = action.state.clone();
            let checkpoint: Checkpoint = action.checkpoint().unwrap().to_string().parse().unwrap();

            let mut resumed = Action::new("node-1");
            resumed.init_process("deploy", &catalog, at(2)).unwrap();
            resumed.resume_from(&checkpoint);
            resumed.advance(&catalog, at(3)).unwrap();
            prop_assert_eq!(resumed.state, expected);
            prop_assert_eq!(resumed.state_idx, Some(index));
        }
    }
}
