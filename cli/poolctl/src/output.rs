//! Output formatting for CLI commands.

use colored::Colorize;
use nodepool_agent::control::{Outcome, Outcomes};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print rows in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => print_json(data),
    }
}

/// Print any serializable value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(data: &T) {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "null".to_string());
    println!("{}", json);
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

#[derive(Debug, Serialize, Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,

    #[tabled(rename = "Outcome")]
    outcome: String,
}

/// Print per-resource outcomes, coloring failures.
pub fn print_outcomes(outcomes: &Outcomes, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(outcomes);
        return;
    }
    let rows: Vec<OutcomeRow> = outcomes
        .iter()
        .map(|(resource, outcome)| OutcomeRow {
            resource: resource.clone(),
            outcome: colored_outcome(outcome),
        })
        .collect();
    print_output(&rows, format);
}

fn colored_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success => outcome.to_string().green().to_string(),
        _ => outcome.to_string().red().to_string(),
    }
}

pub fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}
