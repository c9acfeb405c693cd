//! Process-wide `tracing` subscriber writing LogRecord lines into the [`LogSink`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{reload, EnvFilter, Registry};

use echod_core::LogLevel;

use crate::error::DaemonError;
use crate::log_sink::{push_single_line, write_prefix, LogSink, SinkWriter};

/// Formats events as `timestamp | LEVEL | component | message fields`.
///
/// The component is the last path segment of the event target, so
/// `echod_daemon::acceptor` logs as `acceptor`.
pub struct RecordFormat;

impl<S, N> FormatEvent<S, N> for RecordFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut fields = String::new();
        ctx.field_format()
            .format_fields(Writer::new(&mut fields), event)?;

        let mut line = String::with_capacity(fields.len() + 64);
        write_prefix(&mut line, Utc::now(), *meta.level(), component_of(meta.target()))?;
        push_single_line(&mut line, &fields);
        writeln!(writer, "{line}")
    }
}

pub fn component_of(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::new(level.as_str())
}

/// Live handle on the active log level.
#[derive(Clone)]
pub struct LogLevelHandle {
    current: Arc<Mutex<LogLevel>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogLevelHandle {
    /// A handle not wired to any subscriber; `set` only records the level.
    pub fn detached(level: LogLevel) -> Self {
        Self {
            current: Arc::new(Mutex::new(level)),
            reload: None,
        }
    }

    pub fn current(&self) -> LogLevel {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, level: LogLevel) -> Result<(), DaemonError> {
        if let Some(handle) = &self.reload {
            handle
                .reload(filter_for(level))
                .map_err(|err| DaemonError::Logging(err.to_string()))?;
        }
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = level;
        Ok(())
    }
}

/// Build the subscriber without installing it.
pub fn subscriber(
    sink: Arc<LogSink>,
    level: LogLevel,
    echo_stderr: bool,
) -> (Box<dyn Subscriber + Send + Sync>, LogLevelHandle) {
    let (filter, reload_handle) = reload::Layer::new(filter_for(level));

    let file_layer = tracing_subscriber::fmt::layer()
        .event_format(RecordFormat)
        .with_ansi(false)
        .with_writer(SinkWriter::new(sink));
    let stderr_layer = echo_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .event_format(RecordFormat)
            .with_ansi(false)
            .with_writer(std::io::stderr)
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer);

    let handle = LogLevelHandle {
        current: Arc::new(Mutex::new(level)),
        reload: Some(reload_handle),
    };
    (Box::new(subscriber), handle)
}

/// Install the process-wide subscriber. Fails if one is already installed.
pub fn init(
    sink: Arc<LogSink>,
    level: LogLevel,
    echo_stderr: bool,
) -> Result<LogLevelHandle, DaemonError> {
    let (subscriber, handle) = subscriber(sink, level, echo_stderr);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| DaemonError::Logging(err.to_string()))?;
    Ok(handle)
}
