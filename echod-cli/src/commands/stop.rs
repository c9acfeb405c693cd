//! `echod stop`: SIGTERM and wait for a clean exit.

use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Args;
use nix::sys::signal::Signal;

use echod_daemon::is_process_alive;

use super::load_config;
use super::signal::{live_pid, send};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Args, Debug)]
pub struct StopArgs {
    /// How long to wait for the daemon to drain and exit.
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,
}

impl StopArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let loaded = load_config(config_path)?;
        let pid_file = &loaded.config.pid_file;

        let Some(pid) = live_pid(pid_file)? else {
            println!("daemon is not running");
            return Ok(());
        };
        send(pid, Signal::SIGTERM)?;

        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        while Instant::now() < deadline {
            if !pid_file.exists() || !is_process_alive(pid) {
                println!("daemon stopped (pid {pid})");
                return Ok(());
            }
            sleep(POLL_INTERVAL);
        }
        bail!(
            "daemon (pid {pid}) did not stop within {} ms",
            self.timeout_ms
        )
    }
}
