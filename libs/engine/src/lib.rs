//! Action state machine for the nodepool scheduler.
//!
//! Every resource in the pool is driven through a named *process* (deploy,
//! destroy, reboot, custom) defined by a [`Catalog`]. A process is an ordered
//! list of states; each state may have an `exec` sub-step (do the work) and a
//! `post` sub-step (poll for completion). One sub-step runs per tick, and an
//! [`Action`] records where the resource currently is.
//!
//! Failing steps are escalated by [`escalate`]: first wait, then hard reboot
//! the resource (remembering a [`Checkpoint`] of the interrupted process),
//! and finally give up and mark the action `lost`.
//!
//! This crate is pure logic. Time is always passed in by the caller and no
//! I/O is performed, so every transition can be tested deterministically.
//!
//! # Invariants
//!
//! - `state_idx` only increases until the action is lost or the process is
//!   re-initialized
//! - A failing state with both timeouts set goes through `reboot` before `lost`
//! - Resuming from a checkpoint and advancing lands on the checkpointed state

mod action;
mod catalog;
mod checkpoint;
mod escalation;
mod step;

pub use action::{Action, TransitionError};
pub use catalog::{Catalog, CatalogError, ConfigureField, ProcessVariant, StateDescriptor};
pub use checkpoint::{Checkpoint, CheckpointError, SEPARATOR};
pub use escalation::{escalate, FailureResponse};
pub use step::{apply_success, bare_state, next_step, Step, StepKind};

/// Process run when a reservation is deployed.
pub const DEPLOY: &str = "deploy";

/// Process run when a reservation is torn down.
pub const DESTROY: &str = "destroy";

/// Process used to hard reboot a resource.
pub const REBOOT: &str = "reboot";

/// Terminal state for actions that exhausted their escalation budget.
pub const LOST: &str = "lost";

/// Terminal state of the reboot process.
pub const REBOOTED: &str = "rebooted";

/// Terminal state of the destroy process.
pub const DESTROYED: &str = "destroyed";
