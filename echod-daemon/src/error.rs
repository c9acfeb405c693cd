use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Process exit codes. Operators and process managers key off these.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FAULT: i32 = 1;
    pub const INVALID_CONFIG: i32 = 2;
    pub const PID_FILE_CONFLICT: i32 = 3;
    pub const BIND_FAILURE: i32 = 4;
    pub const LOG_UNAVAILABLE: i32 = 5;
}

/// Error surface for daemonization, startup, and the supervisor control loop.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] echod_core::ConfigError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon already running with pid {pid} (PID file: {path})")]
    PidFileConflict { path: PathBuf, pid: i32 },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listening socket {addr} failed: {source}")]
    Listener {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open log file {path}: {source}")]
    LogUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context} failed: {source}")]
    Os {
        context: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("signal handler registration failed: {0}")]
    Signal(#[source] std::io::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition {
        from: echod_core::DaemonState,
        to: echod_core::DaemonState,
    },

    #[error("unexpected fault: {0}")]
    Fault(String),
}

impl DaemonError {
    /// Exit code for a daemon that ends with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::Config(_) => exit_code::INVALID_CONFIG,
            DaemonError::PidFileConflict { .. } => exit_code::PID_FILE_CONFLICT,
            DaemonError::Bind { .. } => exit_code::BIND_FAILURE,
            DaemonError::LogUnavailable { .. } => exit_code::LOG_UNAVAILABLE,
            _ => exit_code::FAULT,
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn os_err(context: &'static str) -> impl FnOnce(nix::errno::Errno) -> DaemonError {
    move |source| DaemonError::Os { context, source }
}
