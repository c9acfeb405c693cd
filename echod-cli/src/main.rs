//! echod: TCP echo daemon.
//!
//! # Usage
//!
//! ```text
//! echod [--config <file>] start [--foreground]
//! echod [--config <file>] stop [--timeout-ms <ms>]
//! echod [--config <file>] status
//! echod [--config <file>] reload
//! echod [--config <file>] dump-status
//! echod [--config <file>] logs [--lines <n>]
//! echod [--config <file>] check-config
//! ```

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::{logs::LogsArgs, start::StartArgs, stop::StopArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "echod",
    version,
    about = "TCP echo daemon with signal-driven reload, graceful drain, and rotated logs",
    long_about = None,
)]
struct Cli {
    /// YAML config file. Defaults to ~/.echod/config.yaml; built-in defaults
    /// apply when that file does not exist.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon (detaches unless --foreground).
    Start(StartArgs),

    /// Send SIGTERM and wait for the daemon to drain and exit.
    Stop(StopArgs),

    /// Print whether the daemon is running, as JSON.
    Status,

    /// Send SIGHUP: re-read the config and reopen the log file.
    Reload,

    /// Send SIGUSR1: write state, uptime, and connections to the log.
    DumpStatus,

    /// Print the last lines of the active log file.
    Logs(LogsArgs),

    /// Validate the config and print the effective values as YAML.
    CheckConfig,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Start(args) => args.run(config),
        Commands::Stop(args) => args.run(config),
        Commands::Status => commands::status::run(config),
        Commands::Reload => commands::signal::reload(config),
        Commands::DumpStatus => commands::signal::dump_status(config),
        Commands::Logs(args) => args.run(config),
        Commands::CheckConfig => commands::check_config::run(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("echod: {err:#}");
            ExitCode::from(commands::exit_code_for(&err))
        }
    }
}
