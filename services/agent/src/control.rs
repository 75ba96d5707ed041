//! Control operations behind the user and admin surfaces.
//!
//! Every operation validates the owner identity, runs in one store
//! transaction, and reports per-resource outcomes so that partial success is
//! explicit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use nodepool_engine::{Catalog, ConfigureField, DEPLOY, DESTROY, REBOOT};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::allocator::{self, ReserveRequest};
use crate::config::Config;
use crate::reconciler::{mark_in_progress, new_action, rescue_lost};
use crate::state::{
    Reservation, ReservationStatus, Resource, ResourceStatus, Store, StoreError, StoreTx,
};

/// Property holding the owner's payload identifier.
pub const NODE_BIN: &str = "node_bin";

/// Property selecting the process variant.
pub const ENVIRONMENT: &str = "environment";

const UNSAFE_CHARS: &str = "\"!@#$%^&*()[]{};:,/<>?\\|`~=+";

/// Validation errors returned before any state is touched.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid owner '{0}': an email address is required")]
    InvalidOwner(String),

    #[error("wrong date format '{0}': expected YYYY-MM-DD HH:MM:SS or a Unix timestamp")]
    InvalidDate(String),

    #[error("the filter requires a positive 'nb_nodes'")]
    MissingNodeCount,

    #[error("duration must be a positive number of hours, got {0}")]
    InvalidDuration(i64),

    #[error("invalid resource name '{0}'")]
    InvalidName(String),

    #[error("resource {0} has a running action")]
    Busy(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of an operation on one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
    /// Mandatory properties absent from a deploy request.
    Missing(Vec<String>),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
            Self::Missing(props) => write!(f, "failure: missing {}", props.join(", ")),
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Per-resource outcomes keyed by resource name.
pub type Outcomes = BTreeMap<String, Outcome>;

/// What an owner must fill in to configure one reservation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigureForm {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub properties: BTreeMap<String, ConfigureField>,
}

/// Owner-facing view of one reserved resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceReport {
    pub address: Option<String>,
    pub bin: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub reservation: ReservationStatus,
    /// Running state while in progress, last terminal state otherwise.
    pub state: String,
    pub environment: Option<String>,
    pub os_password: Option<String>,
    pub percent: Option<String>,
}

/// Status of an owner's reservations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// States of the longest deploy variant, for progress display.
    pub states: Vec<String>,
    pub resources: BTreeMap<String, ResourceReport>,
}

/// A resource with its matchable properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceView {
    #[serde(flatten)]
    pub resource: Resource,
    pub properties: BTreeMap<String, String>,
}

/// Strip shell and markup characters and replace spaces.
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !UNSAFE_CHARS.contains(*c))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

/// Secrets are stored as given.
fn keep_raw(prop: &str) -> bool {
    prop.contains("ssh_key") || prop == "os_password"
}

fn validate_owner(owner: &str) -> Result<(), ControlError> {
    if owner.trim().is_empty() || !owner.contains('@') {
        return Err(ControlError::InvalidOwner(owner.to_string()));
    }
    Ok(())
}

/// Entry point for every control operation.
pub struct Control {
    store: Arc<Store>,
    catalog: Arc<Catalog>,
    padding: TimeDelta,
    max_reservation: TimeDelta,
}

impl Control {
    pub fn new(store: Arc<Store>, catalog: Arc<Catalog>, config: &Config) -> Self {
        Self {
            store,
            catalog,
            padding: config.reservation_padding(),
            max_reservation: config.max_reservation(),
        }
    }

    /// Reserve up to `nb_nodes` resources matching `filter`.
    #[instrument(skip(self, filter))]
    pub fn reserve(
        &self,
        filter: Map<String, Value>,
        owner: &str,
        start_date: &Value,
        duration_hours: i64,
    ) -> Result<Vec<String>, ControlError> {
        validate_owner(owner)?;
        let request = ReserveRequest::parse(filter, owner, start_date, duration_hours)?;
        self.store
            .transaction(|tx| allocator::reserve(tx, &request, self.padding))
    }

    /// Forms for the owner's reservations awaiting configuration.
    pub fn configure(&self, owner: &str) -> Result<BTreeMap<String, ConfigureForm>, ControlError> {
        validate_owner(owner)?;
        let properties = self.configure_properties();
        self.store.transaction(|tx| {
            let forms = tx
                .reservations_for_owner(owner)?
                .into_iter()
                .filter(|r| r.status == ReservationStatus::Configuring)
                .map(|r| {
                    let form = ConfigureForm {
                        start_date: r.start_date,
                        end_date: r.end_date,
                        properties: properties.clone(),
                    };
                    (r.resource, form)
                })
                .collect();
            Ok(forms)
        })
    }

    /// `node_bin` and `environment` are always mandatory.
    fn configure_properties(&self) -> BTreeMap<String, ConfigureField> {
        let mut properties = self.catalog.configure_fields().clone();
        properties.insert(
            NODE_BIN.to_string(),
            ConfigureField {
                values: Vec::new(),
                mandatory: true,
            },
        );
        properties.entry(ENVIRONMENT.to_string()).or_default().mandatory = true;
        properties
    }

    /// Store the configuration of reservations and mark them ready; the
    /// reconciliation loop starts the deploy.
    #[instrument(skip(self, nodes))]
    pub fn deploy(
        &self,
        owner: &str,
        nodes: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<Outcomes, ControlError> {
        validate_owner(owner)?;
        let required: Vec<String> = self
            .configure_properties()
            .into_iter()
            .filter(|(_, field)| field.mandatory)
            .map(|(name, _)| name)
            .collect();

        self.store.transaction(|tx| {
            let mut outcomes = Outcomes::new();
            for (name, props) in nodes {
                let outcome = configure_one(tx, owner, name, props, &required)?;
                outcomes.insert(name.clone(), outcome);
            }
            Ok(outcomes)
        })
    }

    /// Tear down reservations. Unconfigured ones are released at once.
    #[instrument(skip(self))]
    pub fn destroy(&self, owner: &str, names: &[String]) -> Result<Outcomes, ControlError> {
        validate_owner(owner)?;
        let now = Utc::now();
        self.for_each(names, |tx, name| {
            let Some(reservation) = tx.get_reservation(name, owner)? else {
                return Ok(Outcome::Failure(format!("{name} is not reserved by {owner}")));
            };
            let Some(mut resource) = tx.get_resource(name)? else {
                return Ok(Outcome::Failure(format!("unknown resource {name}")));
            };
            let holds = resource.owner.as_deref() == Some(owner);

            if reservation.status == ReservationStatus::Configuring || !holds {
                tx.delete_reservation(name, owner)?;
                if holds {
                    tx.delete_action(name)?;
                    tx.delete_action_properties(name)?;
                    resource.release();
                    tx.update_resource(&resource)?;
                }
                info!(resource = %name, owner = %owner, "Reservation released");
                return Ok(Outcome::Success);
            }

            self.start_process(tx, &mut resource, DESTROY, now)?;
            Ok(Outcome::Success)
        })
    }

    /// Power-cycle deployed resources, replacing any running action.
    #[instrument(skip(self))]
    pub fn hardreboot(&self, owner: &str, names: &[String]) -> Result<Outcomes, ControlError> {
        self.restart(owner, names, REBOOT)
    }

    /// Run the deploy process again, replacing any running action.
    #[instrument(skip(self))]
    pub fn deployagain(&self, owner: &str, names: &[String]) -> Result<Outcomes, ControlError> {
        self.restart(owner, names, DEPLOY)
    }

    fn restart(
        &self,
        owner: &str,
        names: &[String],
        process: &str,
    ) -> Result<Outcomes, ControlError> {
        validate_owner(owner)?;
        let now = Utc::now();
        self.for_each(names, |tx, name| {
            let ready = tx.get_reservation(name, owner)?.is_some_and(|r| {
                matches!(
                    r.status,
                    ReservationStatus::Ready | ReservationStatus::InProgress
                )
            });
            let resource = tx
                .get_resource(name)?
                .filter(|r| r.owner.as_deref() == Some(owner));
            match (ready, resource) {
                (true, Some(mut resource)) => {
                    self.start_process(tx, &mut resource, process, now)?;
                    Ok(Outcome::Success)
                }
                _ => Ok(Outcome::Failure(format!("{name} is not ready"))),
            }
        })
    }

    /// Replace any running action with a fresh run of `process`.
    fn start_process(
        &self,
        tx: &StoreTx<'_>,
        resource: &mut Resource,
        process: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        tx.delete_action(&resource.name)?;
        let mut action = new_action(tx, resource)?;
        if let Err(e) = action.init_process(process, &self.catalog, now) {
            error!(resource = %resource.name, process = %process, error = %e, "Cannot start process");
        }
        tx.upsert_action(&action)?;
        mark_in_progress(tx, resource)?;
        info!(resource = %resource.name, process = %process, "Process started");
        Ok(())
    }

    /// Double the reservation window, capped at the maximum duration.
    #[instrument(skip(self))]
    pub fn extend(&self, owner: &str, names: &[String]) -> Result<Outcomes, ControlError> {
        validate_owner(owner)?;
        self.for_each(names, |tx, name| {
            let Some(mut reservation) = tx.get_reservation(name, owner)? else {
                return Ok(Outcome::Failure(format!("{name} is not reserved by {owner}")));
            };
            let length = reservation.end_date - reservation.start_date;
            let doubled = reservation.end_date.checked_add_signed(length);
            let cap = reservation.start_date.checked_add_signed(self.max_reservation);
            let new_end = doubled
                .into_iter()
                .chain(cap)
                .min()
                .unwrap_or(reservation.end_date);
            if new_end <= reservation.end_date {
                return Ok(Outcome::Failure(
                    "maximum reservation duration reached".to_string(),
                ));
            }

            let extended = Reservation {
                end_date: new_end,
                ..reservation.clone()
            };
            let conflict = tx
                .reservations_for_resource(name)?
                .iter()
                .filter(|r| r.owner != owner)
                .any(|r| allocator::overlaps(r.start_date, r.end_date, self.padding, &extended));
            if conflict {
                return Ok(Outcome::Failure(format!(
                    "{name} is reserved by someone else after this reservation"
                )));
            }

            reservation.end_date = new_end;
            tx.update_reservation(&reservation)?;
            if let Some(mut resource) = tx.get_resource(name)? {
                if resource.owner.as_deref() == Some(owner) {
                    resource.end_date = Some(new_end);
                    tx.update_resource(&resource)?;
                }
            }
            Ok(Outcome::Success)
        })
    }

    fn for_each<F>(&self, names: &[String], mut op: F) -> Result<Outcomes, ControlError>
    where
        F: FnMut(&StoreTx<'_>, &str) -> Result<Outcome, ControlError>,
    {
        self.store.transaction(|tx| {
            let mut outcomes = Outcomes::new();
            for name in names {
                outcomes.insert(name.clone(), op(tx, name)?);
            }
            Ok(outcomes)
        })
    }

    /// Current state of every reservation of `owner`.
    pub fn status(&self, owner: &str) -> Result<StatusReport, ControlError> {
        validate_owner(owner)?;
        let states = self
            .catalog
            .variants(DEPLOY)
            .map(|v| &v.states)
            .fold(Vec::new(), |longest, states| {
                if states.len() > longest.len() {
                    states.clone()
                } else {
                    longest
                }
            });

        self.store.transaction(|tx| {
            let mut resources = BTreeMap::new();
            for reservation in tx.reservations_for_owner(owner)? {
                let resource = tx.get_resource(&reservation.resource)?;
                let holds = resource
                    .as_ref()
                    .is_some_and(|r| r.owner.as_deref() == Some(owner));
                let props = if holds {
                    tx.action_properties(&reservation.resource)?
                } else {
                    BTreeMap::new()
                };

                let state = match reservation.status {
                    ReservationStatus::InProgress if holds => tx
                        .get_action(&reservation.resource)?
                        .and_then(|a| a.bare_state().map(str::to_string))
                        .unwrap_or_else(|| reservation.status.to_string()),
                    ReservationStatus::Ready if !reservation.action_state.is_empty() => {
                        reservation.action_state.clone()
                    }
                    status => status.to_string(),
                };

                let report = ResourceReport {
                    address: resource.and_then(|r| r.address),
                    bin: reservation.bin.clone(),
                    start_date: reservation.start_date,
                    end_date: reservation.end_date,
                    reservation: reservation.status,
                    state,
                    environment: props.get(ENVIRONMENT).cloned(),
                    os_password: props.get("os_password").cloned(),
                    percent: props.get("percent").cloned(),
                };
                resources.insert(reservation.resource, report);
            }
            Ok(StatusReport { states, resources })
        })
    }

    /// Every reservation in the pool.
    pub fn schedule(&self) -> Result<Vec<Reservation>, ControlError> {
        self.store
            .transaction(|tx| tx.list_reservations().map_err(Into::into))
    }

    /// Registered resources matching `filter` (all when empty).
    pub fn resources(&self, filter: &Map<String, Value>) -> Result<Vec<ResourceView>, ControlError> {
        self.store.transaction(|tx| {
            let mut views = Vec::new();
            for resource in tx.list_resources()? {
                let properties = tx.resource_properties(&resource.name)?;
                if allocator::matches_filter(&properties, filter) {
                    views.push(ResourceView {
                        resource,
                        properties,
                    });
                }
            }
            Ok(views)
        })
    }

    /// Add a resource to the pool.
    #[instrument(skip(self, properties))]
    pub fn register_resource(
        &self,
        name: &str,
        address: Option<String>,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), ControlError> {
        if name.is_empty() || sanitize(name) != name {
            return Err(ControlError::InvalidName(name.to_string()));
        }
        self.store.transaction(|tx| {
            tx.insert_resource(&Resource::new(name, address))?;
            for (key, value) in properties {
                tx.set_resource_property(name, key, value)?;
            }
            info!(resource = %name, "Resource registered");
            Ok(())
        })
    }

    /// Remove an idle resource and its reservations.
    #[instrument(skip(self))]
    pub fn delete_resource(&self, name: &str) -> Result<(), ControlError> {
        self.store.transaction(|tx| {
            if tx.get_action(name)?.is_some() {
                return Err(ControlError::Busy(name.to_string()));
            }
            tx.delete_resource(name)?;
            info!(resource = %name, "Resource deleted");
            Ok(())
        })
    }

    /// Resume every lost resource that carries a checkpoint.
    pub fn rescue_lost(&self) -> Result<Vec<String>, ControlError> {
        let now = Utc::now();
        self.store
            .transaction(|tx| rescue_lost(tx, &self.catalog, now).map_err(Into::into))
    }
}

/// Apply a deploy request to one reservation.
fn configure_one(
    tx: &StoreTx<'_>,
    owner: &str,
    name: &str,
    props: &BTreeMap<String, String>,
    required: &[String],
) -> Result<Outcome, ControlError> {
    let Some(mut reservation) = tx.get_reservation(name, owner)? else {
        return Ok(Outcome::Failure(format!("{name} is not reserved by {owner}")));
    };
    if reservation.status != ReservationStatus::Configuring {
        return Ok(Outcome::Failure(format!("{name} is already configured")));
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|prop| !props.get(*prop).is_some_and(|v| !v.trim().is_empty()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Ok(Outcome::Missing(missing));
    }

    let Some(mut resource) = tx.get_resource(name)? else {
        return Ok(Outcome::Failure(format!("unknown resource {name}")));
    };
    let held_by_other = resource.owner.as_deref().is_some_and(|o| o != owner);
    if held_by_other || tx.get_action(name)?.is_some() {
        return Ok(Outcome::Failure(format!("{name} is in use")));
    }

    let bin = sanitize(props.get(NODE_BIN).map(String::as_str).unwrap_or_default());
    tx.delete_action_properties(name)?;
    for (prop, value) in props {
        if prop == NODE_BIN || value.is_empty() {
            continue;
        }
        let value = if keep_raw(prop) {
            value.clone()
        } else {
            sanitize(value)
        };
        tx.set_action_property(name, prop, &value)?;
    }

    reservation.bin = Some(bin.clone());
    reservation.status = ReservationStatus::Ready;
    reservation.action_state.clear();
    tx.update_reservation(&reservation)?;

    resource.owner = Some(owner.to_string());
    resource.bin = Some(bin);
    resource.start_date = Some(reservation.start_date);
    resource.end_date = Some(reservation.end_date);
    resource.status = ResourceStatus::Ready;
    tx.update_resource(&resource)?;

    info!(resource = %name, owner = %owner, "Reservation configured");
    Ok(Outcome::Success)
}
