//! Pool administration commands.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::error::CliError;
use crate::output::{print_info, print_json, print_success, OutputFormat};

use super::{parse_properties, CommandContext};

/// Admin commands.
#[derive(Debug, Args)]
pub struct AdminCommand {
    #[command(subcommand)]
    command: AdminSubcommand,
}

#[derive(Debug, Subcommand)]
enum AdminSubcommand {
    /// Register a resource in the pool.
    AddResource(AddResourceArgs),

    /// Remove an idle resource and its reservations.
    DeleteResource(DeleteResourceArgs),

    /// Resume lost resources from their checkpoint.
    Rescue,
}

#[derive(Debug, Args)]
struct AddResourceArgs {
    /// Resource name.
    name: String,

    /// Address handed to the driver.
    #[arg(long)]
    address: Option<String>,

    /// Matchable property (repeatable): --prop KEY=VALUE
    #[arg(long = "prop", short = 'p', value_name = "KEY=VALUE")]
    props: Vec<String>,
}

#[derive(Debug, Args)]
struct DeleteResourceArgs {
    /// Resource name.
    name: String,
}

impl AdminCommand {
    pub fn run(self, ctx: &CommandContext) -> Result<()> {
        match self.command {
            AdminSubcommand::AddResource(args) => add_resource(ctx, args),
            AdminSubcommand::DeleteResource(args) => delete_resource(ctx, args),
            AdminSubcommand::Rescue => rescue(ctx),
        }
    }
}

fn add_resource(ctx: &CommandContext, args: AddResourceArgs) -> Result<()> {
    let props = parse_properties(&args.props)?;
    ctx.control
        .register_resource(&args.name, args.address, &props)
        .map_err(CliError::from)?;
    print_success(&format!("Registered {}", args.name));
    Ok(())
}

fn delete_resource(ctx: &CommandContext, args: DeleteResourceArgs) -> Result<()> {
    ctx.control
        .delete_resource(&args.name)
        .map_err(CliError::from)?;
    print_success(&format!("Deleted {}", args.name));
    Ok(())
}

fn rescue(ctx: &CommandContext) -> Result<()> {
    let rescued = ctx.control.rescue_lost().map_err(CliError::from)?;
    match ctx.format {
        OutputFormat::Json => print_json(&rescued),
        OutputFormat::Table if rescued.is_empty() => print_info("No lost resource to rescue."),
        OutputFormat::Table => print_success(&format!("Rescued {}", rescued.join(", "))),
    }
    Ok(())
}
