//! Domain types shared by the daemon runtime and the CLI.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Sequence number assigned to an accepted connection.
///
/// Strictly increasing within one daemon process; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of the daemon, owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    #[default]
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl DaemonState {
    /// Whether `self -> next` is a legal supervisor transition.
    ///
    /// `Running -> Running` is the reload self-loop.
    pub fn can_transition_to(self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Running)
                | (Running, Draining)
                | (Running, Failed)
                | (Draining, Stopped)
                | (Draining, Failed)
        )
    }

    /// `Stopped` and `Failed` end the process.
    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Stopped | DaemonState::Failed)
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Starting => write!(f, "starting"),
            DaemonState::Running => write!(f, "running"),
            DaemonState::Draining => write!(f, "draining"),
            DaemonState::Stopped => write!(f, "stopped"),
            DaemonState::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle command delivered to the supervisor's control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    ReloadRequested,
    ShutdownRequested,
    StatusDumpRequested,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 3] = [
        ControlCommand::ReloadRequested,
        ControlCommand::ShutdownRequested,
        ControlCommand::StatusDumpRequested,
    ];

    /// Dense index, used for per-kind bookkeeping.
    pub fn index(self) -> usize {
        match self {
            ControlCommand::ReloadRequested => 0,
            ControlCommand::ShutdownRequested => 1,
            ControlCommand::StatusDumpRequested => 2,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::ReloadRequested => write!(f, "reload"),
            ControlCommand::ShutdownRequested => write!(f, "shutdown"),
            ControlCommand::StatusDumpRequested => write!(f, "status-dump"),
        }
    }
}
