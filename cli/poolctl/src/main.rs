//! poolctl - CLI for the nodepool testbed scheduler
//!
//! Reserve, configure and drive testbed resources. Commands run directly
//! against the agent's database; the agent's loop picks up the changes.

use clap::Parser;

mod commands;
mod error;
mod output;

use commands::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.run() {
        error::print_error(&e);
        std::process::exit(1);
    }
}
