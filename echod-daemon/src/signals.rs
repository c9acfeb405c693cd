//! OS signals → control commands for the supervisor.
//!
//! | Signal          | Command               |
//! |-----------------|-----------------------|
//! | SIGHUP          | `ReloadRequested`     |
//! | SIGTERM, SIGINT | `ShutdownRequested`   |
//! | SIGUSR1         | `StatusDumpRequested` |
//!
//! No other signal is touched. Commands are coalesced per kind: while one is
//! waiting in the channel, further requests of the same kind are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use echod_core::ControlCommand;

use crate::error::DaemonError;

type PendingFlags = Arc<[AtomicBool; ControlCommand::ALL.len()]>;

/// Single control channel with at most one outstanding command per kind.
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending: PendingFlags = Arc::new(std::array::from_fn(|_| AtomicBool::new(false)));
    (
        ControlSender {
            tx,
            pending: pending.clone(),
        },
        ControlReceiver { rx, pending },
    )
}

#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlCommand>,
    pending: PendingFlags,
}

impl ControlSender {
    /// Enqueue `command` unless one of the same kind is still outstanding.
    ///
    /// Returns `Ok(true)` if enqueued, `Ok(false)` if coalesced.
    pub fn request(&self, command: ControlCommand) -> Result<bool, DaemonError> {
        if self.pending[command.index()].swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        if self.tx.send(command).is_err() {
            self.pending[command.index()].store(false, Ordering::Release);
            return Err(DaemonError::ChannelClosed("control"));
        }
        Ok(true)
    }
}

pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<ControlCommand>,
    pending: PendingFlags,
}

impl ControlReceiver {
    /// Next command in arrival order; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ControlCommand> {
        let command = self.rx.recv().await?;
        self.pending[command.index()].store(false, Ordering::Release);
        Some(command)
    }

    pub fn try_recv(&mut self) -> Option<ControlCommand> {
        let command = self.rx.try_recv().ok()?;
        self.pending[command.index()].store(false, Ordering::Release);
        Some(command)
    }
}

struct SignalSet {
    hangup: Signal,
    terminate: Signal,
    interrupt: Signal,
    user1: Signal,
}

impl SignalSet {
    fn register() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    async fn next(&mut self) -> ControlCommand {
        tokio::select! {
            _ = self.hangup.recv() => ControlCommand::ReloadRequested,
            _ = self.terminate.recv() => ControlCommand::ShutdownRequested,
            _ = self.interrupt.recv() => ControlCommand::ShutdownRequested,
            _ = self.user1.recv() => ControlCommand::StatusDumpRequested,
        }
    }
}

/// Forwarding task; stops when dropped.
pub struct SignalRouter {
    task: JoinHandle<()>,
}

impl SignalRouter {
    /// Register the handlers and spawn the forwarder. Must run inside a tokio runtime.
    pub fn install(sender: ControlSender) -> Result<Self, DaemonError> {
        let mut signals = SignalSet::register().map_err(DaemonError::Signal)?;

        let task = tokio::spawn(async move {
            loop {
                let command = signals.next().await;
                match sender.request(command) {
                    Ok(true) => tracing::debug!(%command, "signal received"),
                    Ok(false) => tracing::debug!(%command, "signal coalesced with pending command"),
                    Err(_) => break,
                }
            }
        });

        Ok(Self { task })
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}
