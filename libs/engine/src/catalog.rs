//! Static process and state tables supplied by a driver.
//!
//! A catalog is loaded once at startup from TOML:
//!
//! ```toml
//! [[processes]]
//! name = "deploy"
//! environments = []
//! states = ["boot_conf", "turn_on", "deployed"]
//!
//! [[states]]
//! name = "turn_on"
//! exec = true
//! post = true
//! before_reboot = 60
//! lost = 90
//!
//! [configure.os_password]
//! mandatory = false
//! ```
//!
//! The order of `[[states]]` is the order in which the reconciliation loop
//! drives actions grouped by state.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LOST, REBOOT, REBOOTED};

/// Catalog loading and validation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("state names must not be empty")]
    EmptyStateName,

    #[error("state '{0}' is described more than once")]
    DuplicateState(String),

    #[error("state '{0}' must not end with '_exec' or '_post'")]
    ReservedSuffix(String),

    #[error("state name '{0}' is reserved")]
    ReservedName(String),

    #[error("process '{process}' references undescribed state '{state}'")]
    UnknownState { process: String, state: String },

    #[error("process '{0}' has a variant with no states")]
    EmptyProcess(String),

    #[error("state '{state}': lost timeout ({lost}s) must exceed before_reboot ({before_reboot}s)")]
    TimeoutOrder {
        state: String,
        before_reboot: u64,
        lost: u64,
    },

    #[error("state '{0}' escalates to a hard reboot but no 'reboot' process is defined")]
    MissingRebootProcess(String),

    #[error("every 'reboot' variant must end in the terminal 'rebooted' state")]
    RebootTerminal,
}

/// One `(environment filter, ordered states)` variant of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessVariant {
    pub name: String,

    /// Environment tags this variant applies to. Empty matches every environment.
    #[serde(default)]
    pub environments: Vec<String>,

    pub states: Vec<String>,
}

impl ProcessVariant {
    fn matches(&self, environment: Option<&str>) -> bool {
        self.environments.is_empty()
            || environment.is_some_and(|env| self.environments.iter().any(|e| e == env))
    }
}

/// Per-state behavior: which sub-steps exist and the escalation budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDescriptor {
    #[serde(default)]
    pub exec: bool,

    #[serde(default)]
    pub post: bool,

    /// Seconds of failure before a hard reboot (0 = never).
    #[serde(default)]
    pub before_reboot: u64,

    /// Seconds of failure before giving up (0 = never).
    #[serde(default)]
    pub lost: u64,
}

impl StateDescriptor {
    /// A state with no sub-step and no timeout ends its process.
    pub fn is_terminal(&self) -> bool {
        !self.exec && !self.post && self.before_reboot == 0 && self.lost == 0
    }
}

/// A property users fill in when configuring a reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureField {
    /// Suggested values shown to the user.
    #[serde(default)]
    pub values: Vec<String>,

    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    processes: Vec<ProcessVariant>,
    #[serde(default)]
    states: Vec<RawState>,
    #[serde(default)]
    configure: BTreeMap<String, ConfigureField>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    name: String,
    #[serde(default)]
    exec: bool,
    #[serde(default)]
    post: bool,
    #[serde(default)]
    before_reboot: u64,
    #[serde(default)]
    lost: u64,
}

/// Validated process catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    processes: Vec<ProcessVariant>,
    states: Vec<(String, StateDescriptor)>,
    positions: HashMap<String, usize>,
    configure: BTreeMap<String, ConfigureField>,
}

impl Catalog {
    /// Build and validate a catalog.
    pub fn new(
        processes: Vec<ProcessVariant>,
        states: Vec<(String, StateDescriptor)>,
        configure: BTreeMap<String, ConfigureField>,
    ) -> Result<Self, CatalogError> {
        let mut positions = HashMap::with_capacity(states.len());
        for (pos, (name, desc)) in states.iter().enumerate() {
            if name.is_empty() {
                return Err(CatalogError::EmptyStateName);
            }
            if name.ends_with("_exec") || name.ends_with("_post") {
                return Err(CatalogError::ReservedSuffix(name.clone()));
            }
            if name == LOST {
                return Err(CatalogError::ReservedName(name.clone()));
            }
            if desc.before_reboot > 0 && desc.lost > 0 && desc.lost <= desc.before_reboot {
                return Err(CatalogError::TimeoutOrder {
                    state: name.clone(),
                    before_reboot: desc.before_reboot,
                    lost: desc.lost,
                });
            }
            if positions.insert(name.clone(), pos).is_some() {
                return Err(CatalogError::DuplicateState(name.clone()));
            }
        }

        for variant in &processes {
            if variant.states.is_empty() {
                return Err(CatalogError::EmptyProcess(variant.name.clone()));
            }
            if let Some(state) = variant.states.iter().find(|s| !positions.contains_key(*s)) {
                return Err(CatalogError::UnknownState {
                    process: variant.name.clone(),
                    state: state.clone(),
                });
            }
            if variant.name == REBOOT && variant.states.last().map(String::as_str) != Some(REBOOTED)
            {
                return Err(CatalogError::RebootTerminal);
            }
        }

        let has_reboot = processes.iter().any(|p| p.name == REBOOT);
        if let Some((name, _)) = states
            .iter()
            .find(|(_, desc)| desc.before_reboot > 0 && !has_reboot)
        {
            return Err(CatalogError::MissingRebootProcess(name.clone()));
        }

        Ok(Self {
            processes,
            states,
            positions,
            configure,
        })
    }

    /// Parse and validate a catalog from TOML text.
    pub fn from_toml_str(input: &str) -> Result<Self, CatalogError> {
        let raw: RawCatalog = toml::from_str(input)?;
        let states = raw
            .states
            .into_iter()
            .map(|s| {
                (
                    s.name,
                    StateDescriptor {
                        exec: s.exec,
                        post: s.post,
                        before_reboot: s.before_reboot,
                        lost: s.lost,
                    },
                )
            })
            .collect();
        Self::new(raw.processes, states, raw.configure)
    }

    /// Read a catalog file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Ordered states of the first variant of `process` whose environment
    /// filter admits `environment`.
    pub fn states_for(&self, process: &str, environment: Option<&str>) -> Option<&[String]> {
        self.processes
            .iter()
            .find(|v| v.name == process && v.matches(environment))
            .map(|v| v.states.as_slice())
    }

    /// Every variant of `process`, in declaration order.
    pub fn variants<'a>(&'a self, process: &'a str) -> impl Iterator<Item = &'a ProcessVariant> {
        self.processes.iter().filter(move |v| v.name == process)
    }

    pub fn descriptor(&self, state: &str) -> Option<&StateDescriptor> {
        self.positions.get(state).map(|&pos| &self.states[pos].1)
    }

    /// Position of `state` in the catalog's grouping order.
    pub fn position(&self, state: &str) -> Option<usize> {
        self.positions.get(state).copied()
    }

    /// State names and descriptors in catalog order.
    pub fn states(&self) -> impl Iterator<Item = (&str, &StateDescriptor)> {
        self.states.iter().map(|(name, desc)| (name.as_str(), desc))
    }

    /// True for `lost` and for states with neither sub-step nor timeout.
    pub fn is_terminal(&self, state: &str) -> bool {
        state == LOST || self.descriptor(state).is_some_and(StateDescriptor::is_terminal)
    }

    pub fn configure_fields(&self) -> &BTreeMap<String, ConfigureField> {
        &self.configure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[processes]]
name = "deploy"
environments = ["tiny_core"]
states = ["boot_conf", "deployed"]

[[processes]]
name = "deploy"
states = ["boot_conf", "turn_on", "deployed"]

[[processes]]
name = "reboot"
states = ["turn_on", "rebooted"]

[[states]]
name = "boot_conf"
exec = true

[[states]]
name = "turn_on"
exec = true
post = true
before_reboot = 60
lost = 90

[[states]]
name = "deployed"

[[states]]
name = "rebooted"

[configure.os_password]
mandatory = false
"#;

    fn sample() -> Catalog {
        Catalog::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_first_matching_variant_wins() {
        let catalog = sample();
        assert_eq!(
            catalog.states_for("deploy", Some("tiny_core")).unwrap(),
            ["boot_conf", "deployed"]
        );
        assert_eq!(
            catalog.states_for("deploy", Some("raspbian")).unwrap(),
            ["boot_conf", "turn_on", "deployed"]
        );
        assert_eq!(
            catalog.states_for("deploy", None).unwrap(),
            ["boot_conf", "turn_on", "deployed"]
        );
        assert!(catalog.states_for("custom", None).is_none());
    }

    #[test]
    fn test_terminal_states() {
        let catalog = sample();
        assert!(catalog.is_terminal("deployed"));
        assert!(catalog.is_terminal("rebooted"));
        assert!(catalog.is_terminal(LOST));
        assert!(!catalog.is_terminal("turn_on"));
        assert!(!catalog.is_terminal("unknown"));
    }

    #[test]
    fn test_state_order_follows_file() {
        let catalog = sample();
        let order: Vec<&str> = catalog.states().map(|(name, _)| name).collect();
        assert_eq!(order, ["boot_conf", "turn_on", "deployed", "rebooted"]);
        assert_eq!(catalog.position("turn_on"), Some(1));
        assert!(catalog.configure_fields().contains_key("os_password"));
    }

    #[test]
    fn test_rejects_lost_before_reboot() {
        let input = SAMPLE.replace("lost = 90", "lost = 60");
        assert!(matches!(
            Catalog::from_toml_str(&input),
            Err(CatalogError::TimeoutOrder { before_reboot: 60, lost: 60, .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_state() {
        let input = SAMPLE.replace(r#"["turn_on", "rebooted"]"#, r#"["turn_off", "rebooted"]"#);
        assert!(matches!(
            Catalog::from_toml_str(&input),
            Err(CatalogError::UnknownState { state, .. }) if state == "turn_off"
        ));
    }

    #[test]
    fn test_rejects_suffixed_state() {
        let input = SAMPLE.replace(r#"name = "boot_conf""#, r#"name = "boot_exec""#);
        assert!(matches!(
            Catalog::from_toml_str(&input),
            Err(CatalogError::ReservedSuffix(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_state() {
        let input = SAMPLE.replace(
            "[configure.os_password]",
            "[[states]]\nname = \"deployed\"\n\n[configure.os_password]",
        );
        assert!(matches!(
            Catalog::from_toml_str(&input),
            Err(CatalogError::DuplicateState(name)) if name == "deployed"
        ));
    }

    #[test]
    fn test_rejects_reserved_lost() {
        let input = SAMPLE.replace(
            "[configure.os_password]",
            "[[states]]\nname = \"lost\"\n\n[configure.os_password]",
        );
        assert!(matches!(
            Catalog::from_toml_str(&input),
            Err(CatalogError::ReservedName(_))
        ));
    }

    #[test]
    fn test_reboot_escalation_needs_reboot_process() {
        let states = vec![(
            "turn_on".to_string(),
            StateDescriptor {
                exec: true,
                before_reboot: 10,
                ..Default::default()
            },
        )];
        let processes = vec![ProcessVariant {
            name: "deploy".into(),
            environments: vec![],
            states: vec!["turn_on".into()],
        }];
        assert!(matches!(
            Catalog::new(processes, states, BTreeMap::new()),
            Err(CatalogError::MissingRebootProcess(_))
        ));
    }

    #[test]
    fn test_reboot_must_end_in_rebooted() {
        let input = SAMPLE.replace(r#"["turn_on", "rebooted"]"#, r#"["turn_on"]"#);
        assert!(matches!(
            Catalog::from_toml_str(&input),
            Err(CatalogError::RebootTerminal)
        ));
    }
}
