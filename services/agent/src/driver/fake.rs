//! Fake driver for development and demos.
//!
//! Every step succeeds with a fixed probability. Deploy steps record a
//! `percent` progress property, and the last deploy step generates an
//! `os_password` when the owner did not provide one.

use std::sync::Arc;

use nodepool_engine::{Action, Catalog, StepKind, DEPLOY};
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::info;

use super::{DriverFault, DriverRegistry};
use crate::state::StoreTx;

pub const NAME: &str = "fake";

const PASSWORD_LEN: usize = 12;

/// Register a random step for every sub-step declared by the catalog.
pub fn registry(catalog: Arc<Catalog>, success_ratio: f64) -> DriverRegistry {
    let mut registry = DriverRegistry::new(NAME);
    let ratio = success_ratio.clamp(0.0, 1.0);

    for (state, desc) in catalog.states() {
        for (kind, declared) in [(StepKind::Exec, desc.exec), (StepKind::Post, desc.post)] {
            if !declared {
                continue;
            }
            let catalog = Arc::clone(&catalog);
            registry.register(state, kind, move |action, tx| {
                let success = rand::rng().random_bool(ratio);
                info!(
                    resource = %action.resource,
                    state = ?action.state,
                    success,
                    "[FAKE] Running step"
                );
                if success && action.process == DEPLOY {
                    record_progress(action, &catalog, tx)?;
                }
                Ok(success)
            });
        }
    }
    registry
}

fn record_progress(action: &Action, catalog: &Catalog, tx: &StoreTx<'_>) -> Result<(), DriverFault> {
    let Some(states) = catalog.states_for(&action.process, action.environment.as_deref()) else {
        return Err(DriverFault::Contract(format!(
            "no state list for process '{}'",
            action.process
        )));
    };
    let idx = action.state_idx.unwrap_or(0);
    let last = states.len().saturating_sub(1).max(1);
    let percent = ((idx + 1) * 100 / last).min(100);
    tx.set_action_property(&action.resource, "percent", &percent.to_string())?;

    if idx + 1 >= last && tx.action_property(&action.resource, "os_password")?.is_none() {
        let password: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LEN)
            .map(char::from)
            .collect();
        tx.set_action_property(&action.resource, "os_password", &password)?;
    }
    Ok(())
}
