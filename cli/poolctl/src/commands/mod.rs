//! CLI commands.

mod admin;
mod lifecycle;
mod reservations;
mod resources;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodepool_agent::config::Config;
use nodepool_agent::control::Control;
use nodepool_agent::state::Store;

use crate::error::CliError;
use crate::output::OutputFormat;

/// poolctl - Reserve and deploy testbed resources.
#[derive(Debug, Parser)]
#[command(name = "poolctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Database of the agent.
    #[arg(long, global = true, env = "NODEPOOL_DB_PATH")]
    db: Option<PathBuf>,

    /// Catalog TOML file (defaults to the built-in fake catalog).
    #[arg(long, global = true, env = "NODEPOOL_CATALOG")]
    catalog: Option<PathBuf>,

    /// Email address of the reservation owner.
    #[arg(long, global = true, env = "NODEPOOL_OWNER")]
    owner: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reserve resources for a time window.
    Reserve(reservations::ReserveArgs),

    /// Show what must be filled in to deploy your reservations.
    Configure,

    /// Configure reservations; the agent then deploys them.
    Deploy(reservations::DeployArgs),

    /// Destroy reservations.
    Destroy(lifecycle::TargetArgs),

    /// Power-cycle deployed resources.
    Hardreboot(lifecycle::TargetArgs),

    /// Run the deploy process again on deployed resources.
    Deployagain(lifecycle::TargetArgs),

    /// Double the length of reservations.
    Extend(lifecycle::TargetArgs),

    /// Show the state of your reservations.
    Status,

    /// Show every reservation in the pool.
    Schedule,

    /// List resources, optionally filtered by property.
    Resources(resources::ResourcesArgs),

    /// Pool administration.
    Admin(admin::AdminCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub fn run(self) -> Result<()> {
        if let Commands::Version = self.command {
            println!("poolctl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let mut config = Config::from_env()?;
        if let Some(db) = self.db {
            config.db_path = db;
        }
        if self.catalog.is_some() {
            config.catalog_path = self.catalog;
        }

        let store = Store::open(&config.db_path)
            .with_context(|| format!("opening store {}", config.db_path.display()))?;
        let catalog = config.load_catalog()?;
        let ctx = CommandContext {
            control: Control::new(Arc::new(store), Arc::new(catalog), &config),
            format: self.format,
            owner: self.owner,
        };

        match self.command {
            Commands::Reserve(args) => reservations::reserve(&ctx, args),
            Commands::Configure => reservations::configure(&ctx),
            Commands::Deploy(args) => reservations::deploy(&ctx, args),
            Commands::Destroy(args) => lifecycle::destroy(&ctx, args),
            Commands::Hardreboot(args) => lifecycle::hardreboot(&ctx, args),
            Commands::Deployagain(args) => lifecycle::deployagain(&ctx, args),
            Commands::Extend(args) => lifecycle::extend(&ctx, args),
            Commands::Status => reservations::status(&ctx),
            Commands::Schedule => reservations::schedule(&ctx),
            Commands::Resources(args) => resources::list(&ctx, args),
            Commands::Admin(cmd) => cmd.run(&ctx),
            Commands::Version => Ok(()),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub control: Control,
    pub format: OutputFormat,
    pub owner: Option<String>,
}

impl CommandContext {
    /// Require an owner to be specified.
    pub fn require_owner(&self) -> Result<&str, CliError> {
        self.owner.as_deref().ok_or(CliError::MissingOwner)
    }
}

/// Parse a `KEY=VALUE` argument.
pub fn parse_property(raw: &str) -> Result<(String, String), CliError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(CliError::InvalidProperty(raw.to_string())),
    }
}

/// Parse repeated `KEY=VALUE` arguments into a map.
pub fn parse_properties(raw: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    raw.iter().map(|p| parse_property(p)).collect()
}
