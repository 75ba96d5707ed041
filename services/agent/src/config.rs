//! Configuration for the nodepool agent.

use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::TimeDelta;
use nodepool_engine::{Catalog, CatalogError};

/// Catalog used when no catalog file is configured.
pub const BUILTIN_CATALOG: &str = include_str!("../../../catalogs/fake.toml");

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub db_path: PathBuf,

    /// Catalog file. The built-in fake catalog is used when unset.
    pub catalog_path: Option<PathBuf>,

    /// Driver providing the state steps.
    pub driver: String,

    /// Seconds between reconciliation ticks.
    pub reconcile_interval_secs: u64,

    /// The loop stops when this file exists.
    pub stop_file: PathBuf,

    /// Grace period kept free before the start of every reservation.
    pub reservation_padding_minutes: i64,

    /// Upper bound on a reservation's total duration when extended.
    pub max_reservation_hours: i64,

    /// Probability that a fake driver step succeeds.
    pub fake_success_ratio: f64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("nodepool.db"),
            catalog_path: None,
            driver: "fake".to_string(),
            reconcile_interval_secs: 3,
            stop_file: PathBuf::from("execstop"),
            reservation_padding_minutes: 15,
            max_reservation_hours: 7 * 24,
            fake_success_ratio: 0.75,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let db_path = std::env::var("NODEPOOL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let catalog_path = std::env::var("NODEPOOL_CATALOG").ok().map(PathBuf::from);

        let driver = std::env::var("NODEPOOL_DRIVER").unwrap_or(defaults.driver);

        let reconcile_interval_secs = env_parse("NODEPOOL_RECONCILE_INTERVAL")
            .unwrap_or(defaults.reconcile_interval_secs);

        let stop_file = std::env::var("NODEPOOL_STOP_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.stop_file);

        let reservation_padding_minutes = env_parse("NODEPOOL_RESERVATION_PADDING_MINUTES")
            .unwrap_or(defaults.reservation_padding_minutes);

        let max_reservation_hours =
            env_parse("NODEPOOL_MAX_RESERVATION_HOURS").unwrap_or(defaults.max_reservation_hours);

        let fake_success_ratio =
            env_parse("NODEPOOL_FAKE_SUCCESS_RATIO").unwrap_or(defaults.fake_success_ratio);

        let log_level = std::env::var("NODEPOOL_LOG_LEVEL").unwrap_or(defaults.log_level);

        let config = Self {
            db_path,
            catalog_path,
            driver,
            reconcile_interval_secs,
            stop_file,
            reservation_padding_minutes,
            max_reservation_hours,
            fake_success_ratio,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.reconcile_interval_secs == 0 {
            bail!("NODEPOOL_RECONCILE_INTERVAL must be at least 1 second");
        }
        if TimeDelta::try_minutes(self.reservation_padding_minutes).is_none()
            || self.reservation_padding_minutes < 0
        {
            bail!("NODEPOOL_RESERVATION_PADDING_MINUTES must be a non-negative duration");
        }
        if TimeDelta::try_hours(self.max_reservation_hours).is_none()
            || self.max_reservation_hours <= 0
        {
            bail!("NODEPOOL_MAX_RESERVATION_HOURS must be a positive duration");
        }
        if !(0.0..=1.0).contains(&self.fake_success_ratio) {
            bail!("NODEPOOL_FAKE_SUCCESS_RATIO must be between 0 and 1");
        }
        Ok(())
    }

    /// Load the configured catalog.
    pub fn load_catalog(&self) -> Result<Catalog, CatalogError> {
        match &self.catalog_path {
            Some(path) => Catalog::from_path(path),
            None => Catalog::from_toml_str(BUILTIN_CATALOG),
        }
    }

    pub fn reservation_padding(&self) -> TimeDelta {
        TimeDelta::minutes(self.reservation_padding_minutes)
    }

    pub fn max_reservation(&self) -> TimeDelta {
        TimeDelta::hours(self.max_reservation_hours)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
