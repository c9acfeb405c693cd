//! `echod start`: run the daemon.

use std::path::Path;

use anyhow::Result;
use clap::Args;

use echod_daemon::start_blocking;

use super::{load_config, LoadedConfig};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Stay attached to the terminal and echo log lines to stderr.
    #[arg(long)]
    pub foreground: bool,
}

impl StartArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let LoadedConfig { config, source } = load_config(config_path)?;
        // In background mode the launching process exits inside `start_blocking`
        // with the status the daemon reports.
        start_blocking(config, self.foreground, source)?;
        Ok(())
    }
}
