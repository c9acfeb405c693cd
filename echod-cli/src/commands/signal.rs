//! `echod reload` / `echod dump-status`: signal the running daemon.

use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use echod_daemon::{is_process_alive, PidFile};

use super::load_config;

/// Pid from the PID file, if it names a live process.
pub fn live_pid(pid_file: &Path) -> Result<Option<i32>> {
    let pid = PidFile::read(pid_file)
        .with_context(|| format!("failed to read PID file {}", pid_file.display()))?;
    Ok(pid.filter(|pid| is_process_alive(*pid)))
}

pub fn send(pid: i32, signal: Signal) -> Result<()> {
    kill(Pid::from_raw(pid), signal)
        .with_context(|| format!("failed to send {signal} to pid {pid}"))
}

fn signal_daemon(config_path: Option<&Path>, signal: Signal) -> Result<i32> {
    let loaded = load_config(config_path)?;
    let pid_file = &loaded.config.pid_file;
    let Some(pid) = live_pid(pid_file)? else {
        bail!("daemon is not running (PID file: {})", pid_file.display());
    };
    send(pid, signal)?;
    Ok(pid)
}

pub fn reload(config_path: Option<&Path>) -> Result<()> {
    let pid = signal_daemon(config_path, Signal::SIGHUP)?;
    println!("reload requested (pid {pid})");
    Ok(())
}

pub fn dump_status(config_path: Option<&Path>) -> Result<()> {
    let pid = signal_daemon(config_path, Signal::SIGUSR1)?;
    println!("status dump requested (pid {pid}); see the daemon log");
    Ok(())
}
