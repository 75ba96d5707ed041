//! Reservation commands (reserve, configure, deploy, status, schedule).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use nodepool_agent::allocator::{DATE_FORMAT, NB_NODES};
use nodepool_agent::control::ConfigureForm;
use nodepool_agent::state::Reservation;
use serde::Serialize;
use serde_json::{Map, Value};
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{
    display_option, print_info, print_json, print_outcomes, print_output, print_success,
    OutputFormat,
};

use super::{parse_properties, CommandContext};

#[derive(Debug, Args)]
pub struct ReserveArgs {
    /// Number of resources wanted.
    #[arg(long, short = 'n', default_value_t = 1)]
    nb_nodes: u64,

    /// Property the resources must have (repeatable): --filter KEY=VALUE
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    filters: Vec<String>,

    /// Start of the window, "YYYY-MM-DD HH:MM:SS" (UTC) or a Unix timestamp.
    /// Defaults to now.
    #[arg(long)]
    start: Option<String>,

    /// Length of the window in hours.
    #[arg(long, default_value_t = 2)]
    duration: i64,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Reservations to configure.
    names: Vec<String>,

    /// Property applied to every named reservation (repeatable): --prop KEY=VALUE
    #[arg(long = "prop", short = 'p', value_name = "KEY=VALUE")]
    props: Vec<String>,

    /// JSON file mapping each reservation to its properties.
    #[arg(long, conflicts_with_all = ["names", "props"])]
    file: Option<PathBuf>,
}

/// Build the allocator filter from the command line.
fn reserve_filter(args: &ReserveArgs) -> Result<Map<String, Value>, CliError> {
    let mut filter: Map<String, Value> = parse_properties(&args.filters)?
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    filter.insert(NB_NODES.to_string(), Value::from(args.nb_nodes));
    Ok(filter)
}

pub fn reserve(ctx: &CommandContext, args: ReserveArgs) -> Result<()> {
    let owner = ctx.require_owner()?;
    let filter = reserve_filter(&args)?;
    let start = args
        .start
        .clone()
        .unwrap_or_else(|| Utc::now().format(DATE_FORMAT).to_string());

    let reserved = ctx
        .control
        .reserve(filter, owner, &Value::String(start), args.duration)
        .map_err(CliError::from)?;

    match ctx.format {
        OutputFormat::Json => print_json(&reserved),
        OutputFormat::Table if reserved.is_empty() => {
            print_info("No resource is free for this window.");
        }
        OutputFormat::Table => {
            print_success(&format!("Reserved {}", reserved.join(", ")));
            if (reserved.len() as u64) < args.nb_nodes {
                print_info(&format!("Only {} of {} reserved.", reserved.len(), args.nb_nodes));
            }
            print_info("Next: poolctl configure");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
struct FormRow {
    #[tabled(rename = "Resource")]
    resource: String,

    #[tabled(rename = "Start")]
    start: String,

    #[tabled(rename = "End")]
    end: String,

    #[tabled(rename = "Required")]
    required: String,

    #[tabled(rename = "Optional")]
    optional: String,
}

fn form_row(resource: &str, form: &ConfigureForm) -> FormRow {
    let describe = |mandatory: bool| {
        form.properties
            .iter()
            .filter(|(_, field)| field.mandatory == mandatory)
            .map(|(name, field)| match field.values.as_slice() {
                [] => name.clone(),
                values => format!("{name} ({})", values.join("|")),
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    FormRow {
        resource: resource.to_string(),
        start: format_date(form.start_date),
        end: format_date(form.end_date),
        required: describe(true),
        optional: describe(false),
    }
}

pub fn configure(ctx: &CommandContext) -> Result<()> {
    let owner = ctx.require_owner()?;
    let forms = ctx.control.configure(owner).map_err(CliError::from)?;

    match ctx.format {
        OutputFormat::Json => print_json(&forms),
        OutputFormat::Table => {
            let rows: Vec<FormRow> = forms
                .iter()
                .map(|(resource, form)| form_row(resource, form))
                .collect();
            print_output(&rows, ctx.format);
        }
    }
    Ok(())
}

/// Properties per reservation, from a file or from the command line.
fn deploy_request(args: &DeployArgs) -> Result<BTreeMap<String, BTreeMap<String, String>>, CliError> {
    if let Some(path) = &args.file {
        let file_error = |message: String| CliError::DeployFile {
            path: path.display().to_string(),
            message,
        };
        let raw = fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        return serde_json::from_str(&raw).map_err(|e| file_error(e.to_string()));
    }
    let props = parse_properties(&args.props)?;
    Ok(args
        .names
        .iter()
        .map(|name| (name.clone(), props.clone()))
        .collect())
}

pub fn deploy(ctx: &CommandContext, args: DeployArgs) -> Result<()> {
    let owner = ctx.require_owner()?;
    let request = deploy_request(&args)?;
    let outcomes = ctx.control.deploy(owner, &request).map_err(CliError::from)?;
    print_outcomes(&outcomes, ctx.format);
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
struct StatusRow {
    #[tabled(rename = "Resource")]
    resource: String,

    #[tabled(rename = "Address", display = "display_option")]
    address: Option<String>,

    #[tabled(rename = "Reservation")]
    reservation: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Progress", display = "display_option")]
    percent: Option<String>,

    #[tabled(rename = "Environment", display = "display_option")]
    environment: Option<String>,

    #[tabled(rename = "End")]
    end: String,
}

pub fn status(ctx: &CommandContext) -> Result<()> {
    let owner = ctx.require_owner()?;
    let report = ctx.control.status(owner).map_err(CliError::from)?;

    match ctx.format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            let rows: Vec<StatusRow> = report
                .resources
                .iter()
                .map(|(resource, r)| StatusRow {
                    resource: resource.clone(),
                    address: r.address.clone(),
                    reservation: r.reservation.to_string(),
                    state: r.state.clone(),
                    percent: r.percent.as_ref().map(|p| format!("{p}%")),
                    environment: r.environment.clone(),
                    end: format_date(r.end_date),
                })
                .collect();
            print_output(&rows, ctx.format);
            if !rows.is_empty() {
                print_info(&format!("Deploy steps: {}", report.states.join(" > ")));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
struct ScheduleRow {
    #[tabled(rename = "Resource")]
    resource: String,

    #[tabled(rename = "Owner")]
    owner: String,

    #[tabled(rename = "Start")]
    start: String,

    #[tabled(rename = "End")]
    end: String,

    #[tabled(rename = "Status")]
    status: String,
}

impl From<&Reservation> for ScheduleRow {
    fn from(r: &Reservation) -> Self {
        Self {
            resource: r.resource.clone(),
            owner: r.owner.clone(),
            start: format_date(r.start_date),
            end: format_date(r.end_date),
            status: r.status.to_string(),
        }
    }
}

pub fn schedule(ctx: &CommandContext) -> Result<()> {
    let reservations = ctx.control.schedule().map_err(CliError::from)?;
    match ctx.format {
        OutputFormat::Json => print_json(&reservations),
        OutputFormat::Table => {
            let rows: Vec<ScheduleRow> = reservations.iter().map(ScheduleRow::from).collect();
            print_output(&rows, ctx.format);
        }
    }
    Ok(())
}

fn format_date(date: DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}
