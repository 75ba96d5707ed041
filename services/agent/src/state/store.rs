//! SQLite-based store for resources, reservations and actions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nodepool_engine::{Action, Checkpoint};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Deployment status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Free to be reserved.
    Available,
    /// Reserved, waiting for the owner to configure it.
    Configuring,
    /// Configured, or idle after a finished process.
    Ready,
    /// An action is running.
    InProgress,
    /// Gave up on the resource; needs a rescue.
    Lost,
    /// Torn down, about to be released.
    Destroyed,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Lost => "lost",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "configuring" => Some(Self::Configuring),
            "ready" => Some(Self::Ready),
            "in_progress" => Some(Self::InProgress),
            "lost" => Some(Self::Lost),
            "destroyed" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Configuring,
    Ready,
    InProgress,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "configuring" => Some(Self::Configuring),
            "ready" => Some(Self::Ready),
            "in_progress" => Some(Self::InProgress),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub name: String,
    /// Reachable address handed to driver steps.
    pub address: Option<String>,
    pub status: ResourceStatus,
    pub owner: Option<String>,
    /// Payload identifier chosen by the owner.
    pub bin: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Where to resume once the resource is rescued from `lost`.
    #[serde(serialize_with = "serialize_checkpoint")]
    pub lost_checkpoint: Option<Checkpoint>,
}

impl Resource {
    pub fn new(name: impl Into<String>, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            address,
            status: ResourceStatus::Available,
            owner: None,
            bin: None,
            start_date: None,
            end_date: None,
            lost_checkpoint: None,
        }
    }

    /// Drop ownership and return the resource to the pool.
    pub fn release(&mut self) {
        self.status = ResourceStatus::Available;
        self.owner = None;
        self.bin = None;
        self.start_date = None;
        self.end_date = None;
        self.lost_checkpoint = None;
    }
}

/// A time-boxed claim of one owner on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub resource: String,
    pub owner: String,
    pub bin: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: ReservationStatus,
    /// Last terminal state reached within this reservation. Empty until the
    /// first deploy finishes.
    pub action_state: String,
}

fn serialize_checkpoint<S: serde::Serializer>(
    checkpoint: &Option<Checkpoint>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match checkpoint {
        Some(cp) => serializer.serialize_some(&cp.to_string()),
        None => serializer.serialize_none(),
    }
}

/// SQLite store shared by the reconciliation loop and control operations.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets the CLI read while the agent ticks
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(10))?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!("Store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside an immediate (write-locking) transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back
    /// otherwise. Concurrent callers in this process wait on the connection
    /// lock; other processes wait on SQLite's reserved lock.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let store_tx = StoreTx { tx };
        let value = f(&store_tx)?;
        store_tx.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    name TEXT PRIMARY KEY,
    address TEXT,
    status TEXT NOT NULL,
    owner TEXT,
    bin TEXT,
    start_date INTEGER,
    end_date INTEGER,
    lost_checkpoint TEXT
);

CREATE TABLE IF NOT EXISTS resource_properties (
    resource TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (resource, name)
);

CREATE TABLE IF NOT EXISTS reservations (
    resource TEXT NOT NULL,
    owner TEXT NOT NULL,
    bin TEXT,
    start_date INTEGER NOT NULL,
    end_date INTEGER NOT NULL,
    status TEXT NOT NULL,
    action_state TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (resource, owner)
);

CREATE TABLE IF NOT EXISTS actions (
    resource TEXT PRIMARY KEY,
    address TEXT,
    environment TEXT,
    process TEXT NOT NULL,
    state_idx INTEGER,
    state TEXT,
    updated_at INTEGER,
    reboot_checkpoint TEXT
);

CREATE TABLE IF NOT EXISTS action_properties (
    resource TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (resource, name)
);

CREATE INDEX IF NOT EXISTS idx_resources_status ON resources(status);
CREATE INDEX IF NOT EXISTS idx_reservations_owner ON reservations(owner);
"#;

const RESOURCE_COLUMNS: &str =
    "name, address, status, owner, bin, start_date, end_date, lost_checkpoint";

const RESERVATION_COLUMNS: &str =
    "resource, owner, bin, start_date, end_date, status, action_state";

const ACTION_COLUMNS: &str =
    "resource, address, environment, process, state_idx, state, updated_at, reboot_checkpoint";

/// An open store transaction.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreTx<'_> {
    // Resources

    /// Register a new resource.
    pub fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        if self.get_resource(&resource.name)?.is_some() {
            return Err(StoreError::Conflict(resource.name.clone()));
        }
        self.tx.execute(
            &format!("INSERT INTO resources ({RESOURCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                resource.name,
                resource.address,
                resource.status.as_str(),
                resource.owner,
                resource.bin,
                resource.start_date.map(|d| d.timestamp()),
                resource.end_date.map(|d| d.timestamp()),
                resource.lost_checkpoint.as_ref().map(Checkpoint::to_string),
            ],
        )?;
        Ok(())
    }

    /// Overwrite every field of an existing resource.
    pub fn update_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let changed = self.tx.execute(
            r#"
            UPDATE resources SET address = ?2, status = ?3, owner = ?4, bin = ?5,
                start_date = ?6, end_date = ?7, lost_checkpoint = ?8
            WHERE name = ?1
            "#,
            params![
                resource.name,
                resource.address,
                resource.status.as_str(),
                resource.owner,
                resource.bin,
                resource.start_date.map(|d| d.timestamp()),
                resource.end_date.map(|d| d.timestamp()),
                resource.lost_checkpoint.as_ref().map(Checkpoint::to_string),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(resource.name.clone()));
        }
        Ok(())
    }

    pub fn get_resource(&self, name: &str) -> Result<Option<Resource>, StoreError> {
        self.tx
            .query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE name = ?1"),
                params![name],
                resource_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All resources in registration order.
    pub fn list_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(&format!("SELECT {RESOURCE_COLUMNS} FROM resources ORDER BY rowid"))?;
        let resources = stmt
            .query_map([], resource_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(resources)
    }

    pub fn list_resources_by_status(
        &self,
        status: ResourceStatus,
    ) -> Result<Vec<Resource>, StoreError> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE status = ?1 ORDER BY rowid"
        ))?;
        let resources = stmt
            .query_map(params![status.as_str()], resource_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(resources)
    }

    /// Delete a resource together with everything attached to it.
    pub fn delete_resource(&self, name: &str) -> Result<(), StoreError> {
        let changed = self
            .tx
            .execute("DELETE FROM resources WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        for table in [
            "resource_properties",
            "reservations",
            "actions",
            "action_properties",
        ] {
            self.tx.execute(
                &format!("DELETE FROM {table} WHERE resource = ?1"),
                params![name],
            )?;
        }
        Ok(())
    }

    pub fn set_resource_property(
        &self,
        resource: &str,
        name: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            r#"
            INSERT INTO resource_properties (resource, name, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(resource, name) DO UPDATE SET value = excluded.value
            "#,
            params![resource, name, value],
        )?;
        Ok(())
    }

    /// Matchable properties of a resource (model, switch, ...).
    pub fn resource_properties(
        &self,
        resource: &str,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        self.properties("resource_properties", resource)
    }

    // Reservations

    pub fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        if self
            .get_reservation(&reservation.resource, &reservation.owner)?
            .is_some()
        {
            return Err(StoreError::Conflict(format!(
                "{} reserved by {}",
                reservation.resource, reservation.owner
            )));
        }
        self.tx.execute(
            &format!(
                "INSERT INTO reservations ({RESERVATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                reservation.resource,
                reservation.owner,
                reservation.bin,
                reservation.start_date.timestamp(),
                reservation.end_date.timestamp(),
                reservation.status.as_str(),
                reservation.action_state,
            ],
        )?;
        Ok(())
    }

    pub fn update_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let changed = self.tx.execute(
            r#"
            UPDATE reservations SET bin = ?3, start_date = ?4, end_date = ?5,
                status = ?6, action_state = ?7
            WHERE resource = ?1 AND owner = ?2
            "#,
            params![
                reservation.resource,
                reservation.owner,
                reservation.bin,
                reservation.start_date.timestamp(),
                reservation.end_date.timestamp(),
                reservation.status.as_str(),
                reservation.action_state,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "{} reserved by {}",
                reservation.resource, reservation.owner
            )));
        }
        Ok(())
    }

    pub fn get_reservation(
        &self,
        resource: &str,
        owner: &str,
    ) -> Result<Option<Reservation>, StoreError> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE resource = ?1 AND owner = ?2"
                ),
                params![resource, owner],
                reservation_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Every reservation, ordered by resource then start date.
    pub fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        self.reservations_where(None)
    }

    pub fn reservations_for_resource(&self, resource: &str) -> Result<Vec<Reservation>, StoreError> {
        self.reservations_where(Some(("resource", resource)))
    }

    pub fn reservations_for_owner(&self, owner: &str) -> Result<Vec<Reservation>, StoreError> {
        self.reservations_where(Some(("owner", owner)))
    }

    fn reservations_where(
        &self,
        filter: Option<(&str, &str)>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let clause = filter
            .map(|(column, _)| format!("WHERE {column} = ?1"))
            .unwrap_or_default();
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations {clause} ORDER BY resource, start_date"
        ))?;
        let rows = match filter {
            Some((_, value)) => stmt.query_map(params![value], reservation_from_row)?,
            None => stmt.query_map([], reservation_from_row)?,
        }
        .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_reservation(&self, resource: &str, owner: &str) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM reservations WHERE resource = ?1 AND owner = ?2",
            params![resource, owner],
        )?;
        Ok(())
    }

    // Actions

    /// Insert or replace the action of a resource.
    pub fn upsert_action(&self, action: &Action) -> Result<(), StoreError> {
        self.tx.execute(
            &format!(
                r#"
                INSERT INTO actions ({ACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(resource) DO UPDATE SET
                    address = excluded.address,
                    environment = excluded.environment,
                    process = excluded.process,
                    state_idx = excluded.state_idx,
                    state = excluded.state,
                    updated_at = excluded.updated_at,
                    reboot_checkpoint = excluded.reboot_checkpoint
                "#
            ),
            params![
                action.resource,
                action.address,
                action.environment,
                action.process,
                action.state_idx.and_then(|idx| i64::try_from(idx).ok()),
                action.state,
                action.updated_at.map(|d| d.timestamp()),
                action.reboot_checkpoint.as_ref().map(Checkpoint::to_string),
            ],
        )?;
        Ok(())
    }

    pub fn get_action(&self, resource: &str) -> Result<Option<Action>, StoreError> {
        self.tx
            .query_row(
                &format!("SELECT {ACTION_COLUMNS} FROM actions WHERE resource = ?1"),
                params![resource],
                action_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All actions ordered by resource name.
    pub fn list_actions(&self) -> Result<Vec<Action>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(&format!("SELECT {ACTION_COLUMNS} FROM actions ORDER BY resource"))?;
        let actions = stmt
            .query_map([], action_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(actions)
    }

    pub fn delete_action(&self, resource: &str) -> Result<(), StoreError> {
        self.tx
            .execute("DELETE FROM actions WHERE resource = ?1", params![resource])?;
        Ok(())
    }

    // Action properties

    /// Write a property, replacing any previous value with the same name.
    pub fn set_action_property(
        &self,
        resource: &str,
        name: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            r#"
            INSERT INTO action_properties (resource, name, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(resource, name) DO UPDATE SET value = excluded.value
            "#,
            params![resource, name, value],
        )?;
        Ok(())
    }

    pub fn action_property(&self, resource: &str, name: &str) -> Result<Option<String>, StoreError> {
        self.tx
            .query_row(
                "SELECT value FROM action_properties WHERE resource = ?1 AND name = ?2",
                params![resource, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn action_properties(&self, resource: &str) -> Result<BTreeMap<String, String>, StoreError> {
        self.properties("action_properties", resource)
    }

    pub fn delete_action_properties(&self, resource: &str) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM action_properties WHERE resource = ?1",
            params![resource],
        )?;
        Ok(())
    }

    fn properties(&self, table: &str, resource: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(&format!("SELECT name, value FROM {table} WHERE resource = ?1"))?;
        let props = stmt
            .query_map(params![resource], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(props)
    }
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let secs: Option<i64> = row.get(idx)?;
    Ok(secs.and_then(|s| DateTime::from_timestamp(s, 0)))
}

fn required_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

/// Stored checkpoints that fail to parse are dropped.
fn checkpoint(row: &Row<'_>, idx: usize, owner: &str) -> rusqlite::Result<Option<Checkpoint>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.filter(|s| !s.is_empty()).and_then(|s| match s.parse() {
        Ok(cp) => Some(cp),
        Err(e) => {
            warn!(resource = %owner, error = %e, "Ignoring malformed checkpoint");
            None
        }
    }))
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    let name: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let status = ResourceStatus::from_str(&status_str).unwrap_or_else(|| {
        warn!(resource = %name, status = %status_str, "Unknown resource status");
        ResourceStatus::Lost
    });
    let lost_checkpoint = checkpoint(row, 7, &name)?;

    Ok(Resource {
        address: row.get(1)?,
        status,
        owner: row.get(3)?,
        bin: row.get(4)?,
        start_date: timestamp(row, 5)?,
        end_date: timestamp(row, 6)?,
        lost_checkpoint,
        name,
    })
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    let status_str: String = row.get(5)?;
    let status =
        ReservationStatus::from_str(&status_str).unwrap_or(ReservationStatus::Configuring);

    Ok(Reservation {
        resource: row.get(0)?,
        owner: row.get(1)?,
        bin: row.get(2)?,
        start_date: required_timestamp(row, 3)?,
        end_date: required_timestamp(row, 4)?,
        status,
        action_state: row.get(6)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<Action> {
    let resource: String = row.get(0)?;
    let state_idx: Option<i64> = row.get(4)?;
    let reboot_checkpoint = checkpoint(row, 7, &resource)?;

    Ok(Action {
        address: row.get(1)?,
        environment: row.get(2)?,
        process: row.get(3)?,
        state_idx: state_idx.and_then(|idx| usize::try_from(idx).ok()),
        state: row.get(5)?,
        updated_at: timestamp(row, 6)?,
        reboot_checkpoint,
        resource,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_resources_roundtrip() {
        let store = Store::open_in_memory().unwrap();

        store
            .transaction(|tx| {
                tx.insert_resource(&Resource::new("node-1", Some("10.0.0.1".into())))?;
                tx.insert_resource(&Resource::new("node-2", None))?;
                tx.set_resource_property("node-1", "model", "RPI4B8G")?;

                let mut node = tx.get_resource("node-1")?.unwrap();
                node.status = ResourceStatus::Lost;
                node.lost_checkpoint = Some(Checkpoint::new("deploy", 3));
                tx.update_resource(&node)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        store
            .transaction(|tx| {
                let node = tx.get_resource("node-1")?.unwrap();
                assert_eq!(node.status, ResourceStatus::Lost);
                assert_eq!(node.lost_checkpoint, Some(Checkpoint::new("deploy", 3)));
                assert_eq!(node.address.as_deref(), Some("10.0.0.1"));

                let names: Vec<_> = tx.list_resources()?.into_iter().map(|r| r.name).collect();
                assert_eq!(names, ["node-1", "node-2"]);
                assert_eq!(tx.list_resources_by_status(ResourceStatus::Available)?.len(), 1);
                assert_eq!(tx.resource_properties("node-1")?["model"], "RPI4B8G");
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_resource_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        let result = store.transaction(|tx| {
            tx.insert_resource(&Resource::new("node-1", None))?;
            tx.insert_resource(&Resource::new("node-1", None))
        });
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.insert_resource(&Resource::new("node-1", None))?;
            Err(StoreError::NotFound("boom".into()))
        });
        assert!(result.is_err());

        let resources = store.transaction(|tx| tx.list_resources()).unwrap();
        assert!(resources.is_empty());
    }

    #[test]
    fn test_actions_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut action = Action::new("node-1").with_environment(Some("raspbian".into()));
        action.process = "deploy".into();
        action.state_idx = Some(2);
        action.state = Some("turn_on_post".into());
        action.updated_at = Some(date(10));
        action.reboot_checkpoint = Some(Checkpoint::new("deploy", 2));

        store.transaction(|tx| tx.upsert_action(&action)).unwrap();
        let fetched = store.transaction(|tx| tx.get_action("node-1")).unwrap();
        assert_eq!(fetched, Some(action.clone()));

        action.state_idx = None;
        action.state = None;
        action.reboot_checkpoint = None;
        store.transaction(|tx| tx.upsert_action(&action)).unwrap();
        let all = store.transaction(|tx| tx.list_actions()).unwrap();
        assert_eq!(all, vec![action]);

        store.transaction(|tx| tx.delete_action("node-1")).unwrap();
        assert!(store.transaction(|tx| tx.get_action("node-1")).unwrap().is_none());
    }

    #[test]
    fn test_malformed_checkpoint_is_dropped() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.upsert_action(&Action::new("node-1"))?;
                tx.tx.execute(
                    "UPDATE actions SET reboot_checkpoint = 'deploy-3' WHERE resource = 'node-1'",
                    [],
                )?;
                Ok::<_, StoreError>(())
            })
            .unwrap();
        let action = store.transaction(|tx| tx.get_action("node-1")).unwrap().unwrap();
        assert_eq!(action.reboot_checkpoint, None);
    }

    #[test]
    fn test_reservations_and_properties() {
        let store = Store::open_in_memory().unwrap();
        let reservation = Reservation {
            resource: "node-1".into(),
            owner: "a@x.org".into(),
            bin: None,
            start_date: date(8),
            end_date: date(11),
            status: ReservationStatus::Configuring,
            action_state: String::new(),
        };

        store
            .transaction(|tx| {
                tx.insert_reservation(&reservation)?;
                tx.set_action_property("node-1", "environment", "raspbian")?;
                tx.set_action_property("node-1", "environment", "tiny_core")?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        store
            .transaction(|tx| {
                assert!(matches!(
                    tx.insert_reservation(&reservation),
                    Err(StoreError::Conflict(_))
                ));
                assert_eq!(tx.reservations_for_owner("a@x.org")?, vec![reservation.clone()]);
                assert_eq!(tx.reservations_for_resource("node-1")?.len(), 1);
                assert_eq!(tx.list_reservations()?.len(), 1);
                assert_eq!(
                    tx.action_property("node-1", "environment")?.as_deref(),
                    Some("tiny_core")
                );

                tx.delete_action_properties("node-1")?;
                tx.delete_reservation("node-1", "a@x.org")?;
                assert!(tx.action_properties("node-1")?.is_empty());
                assert!(tx.list_reservations()?.is_empty());
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ResourceStatus::Available,
            ResourceStatus::Configuring,
            ResourceStatus::Ready,
            ResourceStatus::InProgress,
            ResourceStatus::Lost,
            ResourceStatus::Destroyed,
        ] {
            assert_eq!(ResourceStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ResourceStatus::from_str("unknown"), None);
    }
}
