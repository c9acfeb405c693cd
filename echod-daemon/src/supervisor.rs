//! Daemon lifecycle: startup, the control loop, reload, status dump, drain.
//!
//! ```text
//! Starting ──► Running ──► Draining ──► Stopped
//!    │            │ ▲          │
//!    │            └─┘ reload   │
//!    └────────────┴────────────┴──► Failed
//! ```
//!
//! The supervisor is the only writer of [`DaemonState`]. Commands from the
//! signal router (or [`RunningDaemon::control`]) are handled one at a time,
//! in arrival order, on a single control task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};

use echod_core::{ConfigSource, ControlCommand, DaemonConfig, DaemonState};

use crate::acceptor::{log_worker_exit, Acceptor};
use crate::daemonizer::DaemonHandle;
use crate::error::DaemonError;
use crate::log_sink::LogSink;
use crate::logging::LogLevelHandle;
use crate::registry::ConnectionRegistry;
use crate::signals::{control_channel, ControlReceiver, ControlSender, SignalRouter};
use crate::udp::UdpEcho;

/// Outcome of a clean stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections still open when the grace period ran out.
    pub forced_connections: usize,
    pub reloads: u64,
    pub uptime: Duration,
}

#[derive(Clone)]
struct Lifecycle {
    state: Arc<watch::Sender<DaemonState>>,
}

impl Lifecycle {
    fn new() -> Self {
        let (state, _) = watch::channel(DaemonState::Starting);
        Self {
            state: Arc::new(state),
        }
    }

    fn current(&self) -> DaemonState {
        *self.state.borrow()
    }

    fn transition(&self, next: DaemonState) -> Result<(), DaemonError> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(DaemonError::IllegalTransition { from, to: next });
        }
        self.state.send_replace(next);
        if from != next {
            tracing::info!(from = %from, to = %next, "state transition");
        }
        Ok(())
    }

    fn fail(&self) {
        let current = self.current();
        if current.is_terminal() {
            tracing::debug!(state = %current, "already terminal");
            return;
        }
        if let Err(err) = self.transition(DaemonState::Failed) {
            tracing::error!(error = %err, "could not mark daemon failed");
        }
    }
}

pub struct Supervisor {
    config: DaemonConfig,
    daemon: DaemonHandle,
    sink: Arc<LogSink>,
    levels: LogLevelHandle,
    source: Box<dyn ConfigSource>,
    install_signals: bool,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
    lifecycle: Lifecycle,
}

impl Supervisor {
    pub fn new(
        config: DaemonConfig,
        daemon: DaemonHandle,
        sink: Arc<LogSink>,
        levels: LogLevelHandle,
    ) -> Self {
        let (control_tx, control_rx) = control_channel();
        let source: Box<dyn ConfigSource> = Box::new(config.clone());
        Self {
            config,
            daemon,
            sink,
            levels,
            source,
            install_signals: true,
            control_tx,
            control_rx,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Where `ReloadRequested` reads the next config from. Defaults to the
    /// startup config itself, which makes reload a no-op apart from reopening the log.
    pub fn with_config_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.source = source;
        self
    }

    /// Whether to install OS signal handlers. Tests drive the daemon through
    /// [`Supervisor::control`] instead.
    pub fn with_signals(mut self, enabled: bool) -> Self {
        self.install_signals = enabled;
        self
    }

    pub fn control(&self) -> ControlSender {
        self.control_tx.clone()
    }

    pub fn state(&self) -> DaemonState {
        self.lifecycle.current()
    }

    /// Bring up signals, the listener, and the optional UDP socket, then hand
    /// over to the control loop. Any failure leaves nothing bound.
    pub async fn start(self) -> Result<RunningDaemon, DaemonError> {
        let Supervisor {
            config,
            mut daemon,
            sink,
            levels,
            source,
            install_signals,
            control_tx,
            control_rx,
            lifecycle,
        } = self;

        let started = Instant::now();
        let registry = ConnectionRegistry::new();
        let (shutdown_tx, _) = broadcast::channel(4);

        let bring_up = async {
            let signals = if install_signals {
                Some(SignalRouter::install(control_tx.clone())?)
            } else {
                None
            };
            let acceptor = Acceptor::bind(&config, registry.clone()).await?;
            let udp = match config.udp_port {
                Some(port) => Some(UdpEcho::bind(&config, port).await?),
                None => None,
            };
            Ok::<_, DaemonError>((signals, acceptor, udp))
        };

        let (signals, acceptor, udp) = match bring_up.await {
            Ok(parts) => parts,
            Err(err) => {
                tracing::error!(error = %err, exit_code = err.exit_code(), "startup failed");
                lifecycle.fail();
                if let Err(release_err) = daemon.release_pid_file() {
                    tracing::warn!(error = %release_err, "failed to remove PID file");
                }
                daemon.notify_failure(err.exit_code());
                let _ = sink.flush();
                return Err(err);
            }
        };

        let local_addr = acceptor.local_addr();
        let udp_addr = udp.as_ref().map(UdpEcho::local_addr);
        let acceptor_task = tokio::spawn(acceptor.run(shutdown_tx.subscribe()));
        let udp_task = udp.map(|udp| tokio::spawn(udp.run(shutdown_tx.subscribe())));

        lifecycle.transition(DaemonState::Running)?;
        tracing::info!(
            pid = daemon.pid(),
            addr = %local_addr,
            udp = ?udp_addr,
            log_level = %levels.current(),
            "daemon running"
        );
        daemon.notify_ready();

        let control_loop = ControlLoop {
            config,
            daemon,
            sink,
            levels,
            source,
            registry,
            lifecycle: lifecycle.clone(),
            control_rx,
            shutdown_tx,
            started,
            reloads: 0,
            _signals: signals,
            acceptor_task,
            udp_task,
        };

        Ok(RunningDaemon {
            local_addr,
            udp_addr,
            control: control_tx,
            lifecycle,
            task: tokio::spawn(control_loop.run()),
        })
    }
}

/// A daemon in `Running` (or later) state.
pub struct RunningDaemon {
    local_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    control: ControlSender,
    lifecycle: Lifecycle,
    task: JoinHandle<Result<ShutdownReport, DaemonError>>,
}

impl RunningDaemon {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn control(&self) -> ControlSender {
        self.control.clone()
    }

    pub fn state(&self) -> DaemonState {
        self.lifecycle.current()
    }

    /// Wait for the control loop to finish.
    pub async fn wait(self) -> Result<ShutdownReport, DaemonError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "control loop terminated abnormally");
                self.lifecycle.fail();
                Err(DaemonError::Fault(format!("control loop: {err}")))
            }
        }
    }
}

struct ControlLoop {
    config: DaemonConfig,
    daemon: DaemonHandle,
    sink: Arc<LogSink>,
    levels: LogLevelHandle,
    source: Box<dyn ConfigSource>,
    registry: ConnectionRegistry,
    lifecycle: Lifecycle,
    control_rx: ControlReceiver,
    shutdown_tx: broadcast::Sender<()>,
    started: Instant,
    reloads: u64,
    _signals: Option<SignalRouter>,
    acceptor_task: JoinHandle<Result<JoinSet<()>, DaemonError>>,
    udp_task: Option<JoinHandle<Result<(), DaemonError>>>,
}

impl ControlLoop {
    async fn run(mut self) -> Result<ShutdownReport, DaemonError> {
        match self.serve().await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn serve(&mut self) -> Result<ShutdownReport, DaemonError> {
        loop {
            tokio::select! {
                command = self.control_rx.recv() => match command {
                    Some(ControlCommand::ReloadRequested) => self.reload(),
                    Some(ControlCommand::StatusDumpRequested) => self.dump_status(),
                    Some(ControlCommand::ShutdownRequested) => return self.drain().await,
                    None => {
                        tracing::info!("control channel closed, shutting down");
                        return self.drain().await;
                    }
                },
                joined = &mut self.acceptor_task => {
                    return Err(unexpected_exit("acceptor", joined.map(|result| result.map(drop))));
                }
                joined = join_optional(&mut self.udp_task) => {
                    return Err(unexpected_exit("udp echo", joined));
                }
            }
        }
    }

    fn reload(&mut self) {
        let loaded = self
            .source
            .load()
            .and_then(|next| next.validate().map(|()| next));
        let next = match loaded {
            Ok(next) => next,
            Err(err) => {
                tracing::error!(
                    source = %self.source.describe(),
                    error = %err,
                    "reload rejected, keeping current configuration"
                );
                return;
            }
        };

        if let Err(err) = self.sink.reopen() {
            tracing::warn!(error = %err, "log reopen failed, continuing with current file");
        }

        let delta = self.config.reload_delta(&next);
        if delta.is_empty() {
            tracing::debug!("configuration unchanged");
        }
        if let Some(level) = delta.log_level {
            match self.levels.set(level) {
                Ok(()) => {
                    tracing::info!(from = %self.config.log_level, to = %level, "log level changed");
                    self.config.log_level = level;
                }
                Err(err) => tracing::warn!(error = %err, "log level change failed"),
            }
        }
        for field in &delta.restart_required {
            tracing::warn!(setting = *field, "change requires a restart, ignored");
        }

        if let Err(err) = self.lifecycle.transition(DaemonState::Running) {
            tracing::error!(error = %err, "reload in unexpected state");
            return;
        }
        self.reloads += 1;
        tracing::info!(
            source = %self.source.describe(),
            reloads = self.reloads,
            "configuration reloaded"
        );
    }

    fn dump_status(&self) {
        let connections = self.registry.snapshot();
        tracing::info!(
            state = %self.lifecycle.current(),
            pid = self.daemon.pid(),
            uptime_secs = self.started.elapsed().as_secs(),
            connections = connections.len(),
            max_connections = self.config.max_connections,
            log_level = %self.levels.current(),
            log_generation = self.sink.generation(),
            rotation_failures = self.sink.rotation_failures(),
            reloads = self.reloads,
            "status"
        );
        for conn in &connections {
            tracing::info!(
                id = %conn.id,
                remote = %conn.remote,
                connected_at = %conn.connected_at.to_rfc3339(),
                age_ms = conn.age.as_millis() as u64,
                bytes_in = conn.bytes_in,
                bytes_out = conn.bytes_out,
                "connection"
            );
        }
    }

    /// Stop accepting, give in-flight workers the grace period, abort the rest.
    async fn drain(&mut self) -> Result<ShutdownReport, DaemonError> {
        self.lifecycle.transition(DaemonState::Draining)?;
        let grace = self.config.shutdown_grace();
        tracing::info!(
            connections = self.registry.len(),
            grace_ms = grace.as_millis() as u64,
            "draining"
        );
        let _ = self.shutdown_tx.send(());

        let mut workers = match (&mut self.acceptor_task).await {
            Ok(Ok(workers)) => workers,
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(DaemonError::Fault(format!("acceptor task: {err}"))),
        };
        if let Some(udp_task) = self.udp_task.take() {
            match udp_task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "udp echo ended with error"),
                Err(err) => tracing::warn!(error = %err, "udp echo task failed"),
            }
        }

        let forced_connections = if workers.is_empty() {
            0
        } else {
            let drained = timeout(grace, async {
                while let Some(joined) = workers.join_next().await {
                    log_worker_exit(joined);
                }
            })
            .await;
            match drained {
                Ok(()) => 0,
                Err(_) => {
                    let remaining = workers.len();
                    tracing::warn!(remaining, "grace period elapsed, force-closing connections");
                    workers.shutdown().await;
                    remaining
                }
            }
        };

        self.lifecycle.transition(DaemonState::Stopped)?;
        self.release_pid_file();
        let report = ShutdownReport {
            forced_connections,
            reloads: self.reloads,
            uptime: self.started.elapsed(),
        };
        tracing::info!(
            forced_connections,
            reloads = report.reloads,
            uptime_secs = report.uptime.as_secs(),
            "daemon stopped"
        );
        let _ = self.sink.flush();
        Ok(report)
    }

    fn fail(&mut self, err: &DaemonError) {
        tracing::error!(error = %err, exit_code = err.exit_code(), "daemon failed");
        let _ = self.shutdown_tx.send(());
        self.acceptor_task.abort();
        if let Some(udp_task) = &self.udp_task {
            udp_task.abort();
        }
        self.lifecycle.fail();
        self.release_pid_file();
        let _ = self.sink.flush();
    }

    fn release_pid_file(&mut self) {
        if let Err(err) = self.daemon.release_pid_file() {
            tracing::warn!(error = %err, "failed to remove PID file");
        }
    }
}

async fn join_optional<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn unexpected_exit(
    task: &str,
    joined: Result<Result<(), DaemonError>, JoinError>,
) -> DaemonError {
    match joined {
        Ok(Err(err)) => err,
        Ok(Ok(())) => DaemonError::Fault(format!("{task} stopped without a shutdown request")),
        Err(err) => DaemonError::Fault(format!("{task} task: {err}")),
    }
}
