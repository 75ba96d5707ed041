//! Commands acting on existing reservations.

use anyhow::Result;
use clap::Args;
use nodepool_agent::control::{ControlError, Outcomes};

use crate::error::CliError;
use crate::output::print_outcomes;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Reserved resources to act on. Defaults to all of your reservations.
    pub names: Vec<String>,
}

impl TargetArgs {
    fn resolve(self, ctx: &CommandContext, owner: &str) -> Result<Vec<String>, ControlError> {
        if !self.names.is_empty() {
            return Ok(self.names);
        }
        let report = ctx.control.status(owner)?;
        Ok(report.resources.into_keys().collect())
    }
}

fn run<F>(ctx: &CommandContext, args: TargetArgs, op: F) -> Result<()>
where
    F: FnOnce(&str, &[String]) -> Result<Outcomes, ControlError>,
{
    let owner = ctx.require_owner()?;
    let names = args.resolve(ctx, owner).map_err(CliError::from)?;
    let outcomes = op(owner, &names).map_err(CliError::from)?;
    print_outcomes(&outcomes, ctx.format);
    Ok(())
}

pub fn destroy(ctx: &CommandContext, args: TargetArgs) -> Result<()> {
    run(ctx, args, |owner, names| ctx.control.destroy(owner, names))
}

pub fn hardreboot(ctx: &CommandContext, args: TargetArgs) -> Result<()> {
    run(ctx, args, |owner, names| ctx.control.hardreboot(owner, names))
}

pub fn deployagain(ctx: &CommandContext, args: TargetArgs) -> Result<()> {
    run(ctx, args, |owner, names| ctx.control.deployagain(owner, names))
}

pub fn extend(ctx: &CommandContext, args: TargetArgs) -> Result<()> {
    run(ctx, args, |owner, names| ctx.control.extend(owner, names))
}
