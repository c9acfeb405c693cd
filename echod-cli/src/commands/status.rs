//! `echod status`: JSON liveness report from the PID file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use echod_daemon::{is_process_alive, PidFile};

use super::load_config;

#[derive(Debug, Serialize)]
struct StatusReport {
    running: bool,
    pid: Option<i32>,
    pid_file: String,
}

pub fn run(config_path: Option<&Path>) -> Result<()> {
    let loaded = load_config(config_path)?;
    let pid_file = &loaded.config.pid_file;

    let recorded = PidFile::read(pid_file)
        .with_context(|| format!("failed to read PID file {}", pid_file.display()))?;
    let running = recorded.is_some_and(is_process_alive);

    if !running && pid_file.exists() {
        std::fs::remove_file(pid_file)
            .with_context(|| format!("failed to remove stale PID file {}", pid_file.display()))?;
    }

    let report = StatusReport {
        running,
        pid: recorded.filter(|_| running),
        pid_file: pid_file.display().to_string(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render status JSON")?
    );
    Ok(())
}
