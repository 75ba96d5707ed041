//! Resource listing.

use anyhow::Result;
use clap::Args;
use nodepool_agent::control::ResourceView;
use serde::Serialize;
use serde_json::{Map, Value};
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{display_option, print_json, print_output, OutputFormat};

use super::{parse_properties, CommandContext};

#[derive(Debug, Args)]
pub struct ResourcesArgs {
    /// Property the resources must have (repeatable): --filter KEY=VALUE
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    filters: Vec<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Address", display = "display_option")]
    address: Option<String>,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Owner", display = "display_option")]
    owner: Option<String>,

    #[tabled(rename = "Properties")]
    properties: String,
}

impl From<ResourceView> for ResourceRow {
    fn from(view: ResourceView) -> Self {
        let properties = view
            .properties
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            name: view.resource.name,
            address: view.resource.address,
            status: view.resource.status.to_string(),
            owner: view.resource.owner,
            properties,
        }
    }
}

pub fn list(ctx: &CommandContext, args: ResourcesArgs) -> Result<()> {
    let filter: Map<String, Value> = parse_properties(&args.filters)?
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    let views = ctx.control.resources(&filter).map_err(CliError::from)?;

    match ctx.format {
        OutputFormat::Json => print_json(&views),
        OutputFormat::Table => {
            let rows: Vec<ResourceRow> = views.into_iter().map(ResourceRow::from).collect();
            print_output(&rows, ctx.format);
        }
    }
    Ok(())
}
