//! Error handling and display for the CLI.

use colored::Colorize;
use nodepool_agent::control::ControlError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No owner specified. Use --owner or set NODEPOOL_OWNER.")]
    MissingOwner,

    #[error("Invalid property '{0}'. Expected KEY=VALUE")]
    InvalidProperty(String),

    #[error("Cannot read deploy file {path}: {message}")]
    DeployFile { path: String, message: String },

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::MissingOwner => {
                eprintln!(
                    "\n{}",
                    "Hint: Owners are identified by their email address.".yellow()
                );
            }
            CliError::Control(ControlError::InvalidDate(_)) => {
                eprintln!(
                    "\n{}",
                    "Hint: Dates look like \"2030-03-01 08:00:00\" (UTC).".yellow()
                );
            }
            CliError::Control(ControlError::Busy(_)) => {
                eprintln!(
                    "\n{}",
                    "Hint: Destroy the reservation or wait for the action to finish.".yellow()
                );
            }
            _ => {}
        }
    }
}
