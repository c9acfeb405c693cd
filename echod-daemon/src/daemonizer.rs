//! Detaching from the terminal, before any threads, sockets, or log files exist.
//!
//! Background start forks twice. The launching process stays attached to the
//! terminal until the daemon reports over a pipe whether it reached `Running`,
//! then exits with that status so shell scripts and process managers see the
//! real outcome.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::sys::stat::{umask, Mode};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2, fork, getpid, pipe, setsid, ForkResult};

use echod_core::DaemonConfig;

use crate::error::{exit_code, io_err, os_err, DaemonError};
use crate::pid_file::PidFile;

pub trait Daemonizer {
    fn daemonize(&self, config: &DaemonConfig) -> Result<DaemonHandle, DaemonError>;
}

/// Stay attached to the terminal; no PID file.
pub struct Foreground;

impl Daemonizer for Foreground {
    fn daemonize(&self, _config: &DaemonConfig) -> Result<DaemonHandle, DaemonError> {
        Ok(DaemonHandle::new(getpid().as_raw(), None, None))
    }
}

/// Classic double fork. Only the final daemon process returns from `daemonize`.
pub struct Background;

impl Daemonizer for Background {
    fn daemonize(&self, config: &DaemonConfig) -> Result<DaemonHandle, DaemonError> {
        PidFile::check(&config.pid_file)?;

        let (read_end, write_end) = pipe().map_err(os_err("pipe"))?;

        // SAFETY: called before the tokio runtime or any other thread exists.
        match unsafe { fork() }.map_err(os_err("fork"))? {
            ForkResult::Parent { child } => {
                drop(write_end);
                let code = wait_for_readiness(read_end);
                let _ = waitpid(child, None);
                std::process::exit(code);
            }
            ForkResult::Child => drop(read_end),
        }

        let mut ready = ReadyNotifier::new(write_end);
        match detach(config) {
            Ok(pid_file) => Ok(DaemonHandle::new(
                getpid().as_raw(),
                Some(pid_file),
                Some(ready),
            )),
            Err(err) => {
                ready.notify(err.exit_code());
                Err(err)
            }
        }
    }
}

/// Runs in the first child: new session, second fork, then the grandchild
/// settles in and claims the PID file.
fn detach(config: &DaemonConfig) -> Result<PidFile, DaemonError> {
    setsid().map_err(os_err("setsid"))?;

    // SAFETY: still single-threaded.
    match unsafe { fork() }.map_err(os_err("second fork"))? {
        ForkResult::Parent { .. } => std::process::exit(exit_code::OK),
        ForkResult::Child => {}
    }

    chdir("/").map_err(os_err("chdir"))?;
    umask(Mode::from_bits_truncate(0o022));
    redirect_stdio()?;

    PidFile::acquire(&config.pid_file)
}

fn redirect_stdio() -> Result<(), DaemonError> {
    let null_path = Path::new("/dev/null");
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open(null_path)
        .map_err(|e| io_err(null_path, e))?;
    for target in 0..=2 {
        dup2(null.as_raw_fd(), target).map_err(os_err("dup2"))?;
    }
    Ok(())
}

/// Block until the daemon reports its startup outcome.
///
/// The first byte is the exit code; a pipe closed without one is a fault.
pub fn wait_for_readiness(read_end: OwnedFd) -> i32 {
    let mut pipe = File::from(read_end);
    let mut status = [0u8; 1];
    loop {
        match pipe.read(&mut status) {
            Ok(1) => return i32::from(status[0]),
            Ok(_) => return exit_code::FAULT,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return exit_code::FAULT,
        }
    }
}

/// Write end of the readiness pipe. Reports once; later calls are no-ops.
#[derive(Debug)]
pub struct ReadyNotifier {
    pipe: Option<File>,
}

impl ReadyNotifier {
    pub fn new(write_end: OwnedFd) -> Self {
        Self {
            pipe: Some(File::from(write_end)),
        }
    }

    fn notify(&mut self, code: i32) {
        if let Some(mut pipe) = self.pipe.take() {
            let byte = u8::try_from(code).unwrap_or(exit_code::FAULT as u8);
            let _ = pipe.write_all(&[byte]);
        }
    }
}

/// What the daemon process holds after daemonization.
#[derive(Debug)]
pub struct DaemonHandle {
    pid: i32,
    pid_file: Option<PidFile>,
    ready: Option<ReadyNotifier>,
}

impl DaemonHandle {
    pub fn new(pid: i32, pid_file: Option<PidFile>, ready: Option<ReadyNotifier>) -> Self {
        Self {
            pid,
            pid_file,
            ready,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn pid_file_path(&self) -> Option<&Path> {
        self.pid_file.as_ref().map(PidFile::path)
    }

    /// Tell the launching process startup succeeded.
    pub fn notify_ready(&mut self) {
        if let Some(mut ready) = self.ready.take() {
            ready.notify(exit_code::OK);
        }
    }

    /// Tell the launching process startup failed with `code`.
    pub fn notify_failure(&mut self, code: i32) {
        if let Some(mut ready) = self.ready.take() {
            ready.notify(code);
        }
    }

    pub fn release_pid_file(&mut self) -> Result<(), DaemonError> {
        match self.pid_file.take() {
            Some(pid_file) => pid_file.release(),
            None => Ok(()),
        }
    }
}
