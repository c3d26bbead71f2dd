// caseroom CLI entry point.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod client;
mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;

#[derive(Parser)]
#[command(name = "caseroom", about = "Follow a case's documents and chat from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> process::ExitCode {
    // Logs go to stderr so stdout stays clean for --json consumers.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::run(cli.command) {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => ExitCode::from_error(&error).into(),
    }
}
