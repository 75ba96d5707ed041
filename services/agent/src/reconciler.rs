//! Reconciliation tick for the resource pool.
//!
//! Each tick runs inside one store transaction and:
//! - Resumes rebooted actions from their checkpoint
//! - Sweeps terminal actions into resource and reservation status
//! - Promotes configured reservations into new deploy actions
//! - Runs one driver step per pending action, grouped by state in catalog order
//! - Escalates failed steps (wait, hard reboot, lost)
//!
//! A driver fault aborts the tick and rolls it back. It is reported as fatal;
//! every other error is retried on the next tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nodepool_engine::{
    apply_success, escalate, next_step, Action, Catalog, Checkpoint, FailureResponse, DEPLOY,
    DESTROYED, LOST, REBOOTED,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::driver::{DriverFault, DriverRegistry};
use crate::state::{ReservationStatus, Resource, ResourceStatus, Store, StoreError, StoreTx};

/// Result type for reconciliation.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that can occur during a tick.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("driver fault in {step} on {resource}: {source}")]
    DriverFault {
        resource: String,
        step: String,
        source: DriverFault,
    },

    #[error("tick panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Fatal errors stop the loop; anything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DriverFault { .. } | Self::Panicked(_))
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub resumed: usize,
    pub swept: usize,
    pub promoted: usize,
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rebooted: usize,
    pub lost: usize,
}

impl TickStats {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives every action in the store one step per tick.
pub struct Reconciler {
    store: Arc<Store>,
    catalog: Arc<Catalog>,
    drivers: Arc<DriverRegistry>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>, catalog: Arc<Catalog>, drivers: Arc<DriverRegistry>) -> Self {
        Self {
            store,
            catalog,
            drivers,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn tick(&self) -> ReconcileResult<TickStats> {
        self.tick_at(Utc::now())
    }

    /// Run one tick as if the current time were `now`.
    #[instrument(skip(self))]
    pub fn tick_at(&self, now: DateTime<Utc>) -> ReconcileResult<TickStats> {
        self.store.transaction(|tx| {
            let mut stats = TickStats {
                resumed: resume_rebooted(tx, &self.catalog, now)?,
                swept: sweep_terminal(tx, &self.catalog)?,
                promoted: promote_ready(tx, &self.catalog, now)?,
                ..TickStats::default()
            };
            self.run_pending(tx, now, &mut stats)?;
            Ok(stats)
        })
    }

    /// Restart every lost resource that carries a checkpoint.
    pub fn rescue_lost(&self) -> ReconcileResult<Vec<String>> {
        let now = Utc::now();
        self.store
            .transaction(|tx| rescue_lost(tx, &self.catalog, now).map_err(Into::into))
    }

    fn run_pending(
        &self,
        tx: &StoreTx<'_>,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> ReconcileResult<()> {
        let mut groups: BTreeMap<usize, Vec<Action>> = BTreeMap::new();
        for action in tx.list_actions()? {
            let Some(state) = action.bare_state() else {
                warn!(resource = %action.resource, "Action has no state");
                continue;
            };
            if self.catalog.is_terminal(state) {
                continue;
            }
            match self.catalog.position(state) {
                Some(pos) => groups.entry(pos).or_default().push(action),
                None => warn!(resource = %action.resource, state = %state, "Unknown state"),
            }
        }

        for mut action in groups.into_values().flatten() {
            self.run_step(tx, &mut action, now, stats)?;
            tx.upsert_action(&action)?;
        }
        Ok(())
    }

    fn run_step(
        &self,
        tx: &StoreTx<'_>,
        action: &mut Action,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> ReconcileResult<()> {
        let succeeded = match next_step(action, &self.catalog) {
            Some(step) => {
                debug!(resource = %action.resource, step = %step, "Running step");
                let done = self.drivers.call(&step, action, tx).map_err(|source| {
                    error!(
                        resource = %action.resource,
                        process = %action.process,
                        state = ?action.state,
                        step = %step,
                        error = %source,
                        "Driver fault, stopping"
                    );
                    ReconcileError::DriverFault {
                        resource: action.resource.clone(),
                        step: step.to_string(),
                        source,
                    }
                })?;
                stats.executed += 1;
                if done {
                    if let Err(e) = apply_success(action, &step, &self.catalog, now) {
                        error!(resource = %action.resource, error = %e, "Action is lost");
                    } else {
                        info!(resource = %action.resource, state = ?action.state, "Step done");
                    }
                }
                done
            }
            None => false,
        };

        if succeeded {
            stats.succeeded += 1;
            return Ok(());
        }

        stats.failed += 1;
        match escalate(action, &self.catalog, now) {
            Ok(FailureResponse::Waiting { elapsed }) => {
                debug!(
                    resource = %action.resource,
                    state = ?action.state,
                    elapsed_secs = elapsed.num_seconds(),
                    "Not ready"
                );
            }
            Ok(FailureResponse::HardReboot { checkpoint }) => {
                warn!(resource = %action.resource, checkpoint = %checkpoint, "Hard reboot");
                stats.rebooted += 1;
            }
            Ok(FailureResponse::Lost { elapsed }) => {
                warn!(
                    resource = %action.resource,
                    elapsed_secs = elapsed.num_seconds(),
                    "Resource is lost, no longer driving it"
                );
                stats.lost += 1;
            }
            Err(e) => {
                error!(resource = %action.resource, error = %e, "Action is lost");
                stats.lost += 1;
            }
        }
        Ok(())
    }
}

/// Jump back into the process interrupted by a hard reboot.
fn resume(action: &mut Action, checkpoint: &Checkpoint, catalog: &Catalog, now: DateTime<Utc>) {
    info!(resource = %action.resource, checkpoint = %checkpoint, "Resuming process");
    action.resume_from(checkpoint);
    if let Err(e) = action.advance(catalog, now) {
        error!(resource = %action.resource, error = %e, "Cannot resume process");
    }
}

/// Resume actions sitting in `rebooted` that carry an action-level or
/// resource-level checkpoint. Returns the number of resumed actions.
///
/// The action-level checkpoint is kept: it marks that a reboot was already
/// tried at that point. The resource-level one is only consumed when the
/// action carries none.
fn resume_rebooted(
    tx: &StoreTx<'_>,
    catalog: &Catalog,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let mut resumed = 0;
    for mut action in tx.list_actions()? {
        if action.state.as_deref() != Some(REBOOTED) {
            continue;
        }
        let mut resource = tx.get_resource(&action.resource)?;
        let checkpoint = match action.reboot_checkpoint.clone() {
            Some(checkpoint) => checkpoint,
            None => match resource.as_mut().and_then(|r| r.lost_checkpoint.take()) {
                Some(checkpoint) => {
                    if let Some(resource) = &resource {
                        tx.update_resource(resource)?;
                    }
                    checkpoint
                }
                None => continue,
            },
        };

        resume(&mut action, &checkpoint, catalog, now);
        tx.upsert_action(&action)?;
        resumed += 1;
    }
    Ok(resumed)
}

/// Fold terminal actions into their resource and reservation, then delete
/// them. Returns the number of swept actions.
fn sweep_terminal(tx: &StoreTx<'_>, catalog: &Catalog) -> Result<usize, StoreError> {
    let mut swept = 0;
    for action in tx.list_actions()? {
        let Some(state) = action.state.as_deref() else {
            continue;
        };
        if !catalog.is_terminal(state) {
            continue;
        }
        info!(resource = %action.resource, state = %state, "Action completed");
        swept += 1;
        tx.delete_action(&action.resource)?;

        let Some(mut resource) = tx.get_resource(&action.resource)? else {
            warn!(resource = %action.resource, "Action on unregistered resource");
            continue;
        };
        let mut reservation = match &resource.owner {
            Some(owner) => tx.get_reservation(&resource.name, owner)?,
            None => None,
        };

        match state {
            DESTROYED => {
                tx.delete_action_properties(&resource.name)?;
                if let Some(reservation) = reservation.take() {
                    tx.delete_reservation(&reservation.resource, &reservation.owner)?;
                }
                resource.release();
            }
            LOST => {
                resource.status = ResourceStatus::Lost;
                resource.lost_checkpoint = action.reboot_checkpoint.clone();
            }
            _ => resource.status = ResourceStatus::Ready,
        }
        tx.update_resource(&resource)?;

        if let Some(mut reservation) = reservation {
            reservation.status = ReservationStatus::Ready;
            reservation.action_state = state.to_string();
            tx.update_reservation(&reservation)?;
        }
    }
    Ok(swept)
}

/// Start a deploy action for every configured reservation with no action.
/// Returns the number of new actions.
fn promote_ready(
    tx: &StoreTx<'_>,
    catalog: &Catalog,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let mut promoted = 0;
    for mut reservation in tx.list_reservations()? {
        if reservation.status != ReservationStatus::Ready || !reservation.action_state.is_empty() {
            continue;
        }
        if tx.get_action(&reservation.resource)?.is_some() {
            continue;
        }
        let Some(mut resource) = tx.get_resource(&reservation.resource)? else {
            continue;
        };
        if resource.owner.as_deref() != Some(reservation.owner.as_str()) {
            debug!(
                resource = %resource.name,
                owner = %reservation.owner,
                "Resource held by another reservation"
            );
            continue;
        }

        info!(resource = %resource.name, owner = %reservation.owner, "Starting the deploy process");
        let mut action = new_action(tx, &resource)?;
        if let Err(e) = action.init_process(DEPLOY, catalog, now) {
            error!(resource = %resource.name, error = %e, "Cannot start deploy");
        }
        tx.upsert_action(&action)?;

        resource.status = ResourceStatus::InProgress;
        tx.update_resource(&resource)?;
        reservation.status = ReservationStatus::InProgress;
        tx.update_reservation(&reservation)?;
        promoted += 1;
    }
    Ok(promoted)
}

/// A fresh action for `resource`, honoring its configured environment.
pub(crate) fn new_action(tx: &StoreTx<'_>, resource: &Resource) -> Result<Action, StoreError> {
    let environment = tx.action_property(&resource.name, "environment")?;
    Ok(Action::new(resource.name.clone())
        .with_address(resource.address.clone())
        .with_environment(environment))
}

/// Move the resource's reservation (if any) to `in_progress`.
pub(crate) fn mark_in_progress(tx: &StoreTx<'_>, resource: &mut Resource) -> Result<(), StoreError> {
    resource.status = ResourceStatus::InProgress;
    tx.update_resource(resource)?;
    if let Some(owner) = &resource.owner {
        if let Some(mut reservation) = tx.get_reservation(&resource.name, owner)? {
            reservation.status = ReservationStatus::InProgress;
            tx.update_reservation(&reservation)?;
        }
    }
    Ok(())
}

/// Give every lost resource with a checkpoint a new action resumed at that
/// checkpoint. Returns the names of the rescued resources.
pub(crate) fn rescue_lost(
    tx: &StoreTx<'_>,
    catalog: &Catalog,
    now: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
    let mut rescued = Vec::new();
    for mut resource in tx.list_resources_by_status(ResourceStatus::Lost)? {
        if tx.get_action(&resource.name)?.is_some() {
            continue;
        }
        let Some(checkpoint) = resource.lost_checkpoint.take() else {
            debug!(resource = %resource.name, "Lost resource has no checkpoint");
            continue;
        };

        info!(resource = %resource.name, "Rescuing lost resource");
        let mut action = new_action(tx, &resource)?;
        resume(&mut action, &checkpoint, catalog, now);
        tx.upsert_action(&action)?;
        mark_in_progress(tx, &mut resource)?;
        rescued.push(resource.name);
    }
    Ok(rescued)
}
