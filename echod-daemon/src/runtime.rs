use std::sync::Arc;

use echod_core::{ConfigSource, DaemonConfig};

use crate::daemonizer::{Background, DaemonHandle, Daemonizer, Foreground};
use crate::error::DaemonError;
use crate::log_sink::LogSink;
use crate::logging;
use crate::supervisor::{ShutdownReport, Supervisor};

/// Daemonize, open the log, build the runtime, and run until stopped.
///
/// Daemonization happens before any thread exists; the tokio runtime is built
/// afterwards. In background mode only the final daemon process returns.
pub fn start_blocking(
    config: DaemonConfig,
    foreground: bool,
    source: Box<dyn ConfigSource>,
) -> Result<ShutdownReport, DaemonError> {
    let daemonizer: Box<dyn Daemonizer> = if foreground {
        Box::new(Foreground)
    } else {
        Box::new(Background)
    };
    let mut daemon = daemonizer.daemonize(&config)?;

    let sink = match LogSink::from_config(&config) {
        Ok(sink) => Arc::new(sink),
        Err(err) => return Err(abort_startup(&mut daemon, err)),
    };
    let levels = match logging::init(sink.clone(), config.log_level, foreground) {
        Ok(levels) => levels,
        Err(err) => return Err(abort_startup(&mut daemon, err)),
    };
    tracing::info!(
        pid = daemon.pid(),
        config = %source.describe(),
        log_file = %sink.path().display(),
        foreground,
        "starting echod"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("echod-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let err = DaemonError::Fault(format!("tokio runtime: {err}"));
            return Err(abort_startup(&mut daemon, err));
        }
    };

    runtime.block_on(async move {
        let running = Supervisor::new(config, daemon, sink, levels)
            .with_config_source(source)
            .start()
            .await?;
        running.wait().await
    })
}

fn abort_startup(daemon: &mut DaemonHandle, err: DaemonError) -> DaemonError {
    tracing::error!(error = %err, exit_code = err.exit_code(), "startup failed");
    if let Err(release_err) = daemon.release_pid_file() {
        tracing::warn!(error = %release_err, "failed to remove PID file");
    }
    daemon.notify_failure(err.exit_code());
    err
}
