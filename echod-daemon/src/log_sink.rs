//! Append-only, size-rotated log file shared by every task in the process.
//!
//! Each record is one line:
//!
//! ```text
//! 2026-10-19T08:15:02.114Z | INFO  | acceptor | connection closed id=#3 ...
//! ```
//!
//! Before each write, if the active file has reached the rotation threshold,
//! it is renamed to `<name>.<generation>` and a fresh file is opened:
//!   echod.log → echod.log.1, later echod.log → echod.log.2, …
//! Generations start after the highest backup already on disk and are never
//! reused. At most `keep_backups` backups are kept (0 keeps all).
//!
//! A failed rotation never loses the record: it is appended to the current,
//! oversized file and the failure is returned to the caller and counted. The
//! sink also writes a `WARN | log_sink` record about it on the first failure
//! and whenever the failure count reaches a power of two.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use echod_core::DaemonConfig;

use crate::error::DaemonError;
use crate::paths::{ensure_parent_dir, list_backups, rotated_path};

#[derive(Debug, Error)]
pub enum LogSinkError {
    #[error("log rotation at {path} failed: {source}")]
    Rotation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("log write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One log line: timestamp, severity, component tag, message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub component: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
        }
    }

    /// The record as written to disk, trailing newline included.
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        // Writing into a String cannot fail.
        let _ = write_prefix(&mut line, self.timestamp, self.level, &self.component);
        push_single_line(&mut line, &self.message);
        line.push('\n');
        line
    }
}

/// `timestamp | LEVEL | component | `, shared by [`LogRecord`] and the tracing formatter.
pub fn write_prefix(
    out: &mut impl std::fmt::Write,
    timestamp: DateTime<Utc>,
    level: Level,
    component: &str,
) -> std::fmt::Result {
    write!(
        out,
        "{} | {:<5} | {} | ",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        level.as_str(),
        component
    )
}

/// Append `text` with line breaks escaped so a record never spans lines.
pub fn push_single_line(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

struct SinkState {
    file: File,
    size: u64,
    /// Last generation successfully rotated out (0 before the first rotation).
    generation: u64,
    next_generation: u64,
}

pub struct LogSink {
    path: PathBuf,
    threshold: u64,
    keep_backups: usize,
    state: Mutex<SinkState>,
    rotation_failures: AtomicU64,
}

impl LogSink {
    /// Open (or create) the active log file in append mode.
    pub fn open(path: &Path, threshold: u64, keep_backups: usize) -> io::Result<Self> {
        ensure_parent_dir(path)?;
        let file = open_append(path)?;
        let size = file.metadata()?.len();
        let last_on_disk = list_backups(path)?
            .last()
            .map(|(generation, _)| *generation)
            .unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            threshold,
            keep_backups,
            state: Mutex::new(SinkState {
                file,
                size,
                generation: last_on_disk,
                next_generation: last_on_disk + 1,
            }),
            rotation_failures: AtomicU64::new(0),
        })
    }

    /// Open the sink described by `config`; failure is a fatal startup error.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, DaemonError> {
        Self::open(
            &config.log_file,
            config.log_rotate_bytes,
            config.log_keep_backups,
        )
        .map_err(|source| DaemonError::LogUnavailable {
            path: config.log_file.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the active file in bytes.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    /// Highest generation rotated out so far (including backups found at open).
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of rotation or pruning failures since the sink was opened.
    pub fn rotation_failures(&self) -> u64 {
        self.rotation_failures.load(Ordering::Relaxed)
    }

    pub fn write_record(&self, record: &LogRecord) -> Result<(), LogSinkError> {
        self.append(record.to_line().as_bytes())
    }

    /// Append one already-formatted record and sync it to disk.
    ///
    /// Returns `LogSinkError::Rotation` when rotation failed but the record was
    /// still written to the current file.
    pub fn append(&self, line: &[u8]) -> Result<(), LogSinkError> {
        let mut state = self.lock();

        let rotation = if state.size >= self.threshold {
            self.rotate(&mut state)
        } else {
            Ok(())
        };

        let failures = rotation
            .is_err()
            .then(|| self.rotation_failures.fetch_add(1, Ordering::Relaxed) + 1);

        self.write_line(&mut state, line)?;

        if let (Err(err), Some(failures)) = (&rotation, failures) {
            if failures.is_power_of_two() {
                let warning = LogRecord::new(
                    Level::WARN,
                    "log_sink",
                    format!("{err}; rotation_failures={failures}, writing to the current file"),
                );
                self.write_line(&mut state, warning.to_line().as_bytes())?;
            }
        }

        rotation
    }

    pub fn flush(&self) -> Result<(), LogSinkError> {
        let mut state = self.lock();
        state
            .file
            .flush()
            .and_then(|()| state.file.sync_all())
            .map_err(|source| LogSinkError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Reopen the active path, picking up a file moved away by an external tool.
    pub fn reopen(&self) -> Result<(), LogSinkError> {
        let file = open_append(&self.path).map_err(|source| LogSinkError::Write {
            path: self.path.clone(),
            source,
        })?;
        let size = file.metadata().map(|meta| meta.len()).unwrap_or(0);

        let mut state = self.lock();
        state.file = file;
        state.size = size;
        Ok(())
    }

    fn write_line(&self, state: &mut SinkState, line: &[u8]) -> Result<(), LogSinkError> {
        state
            .file
            .write_all(line)
            .and_then(|()| state.file.sync_data())
            .map_err(|source| LogSinkError::Write {
                path: self.path.clone(),
                source,
            })?;
        state.size += line.len() as u64;
        Ok(())
    }

    fn rotate(&self, state: &mut SinkState) -> Result<(), LogSinkError> {
        let generation = state.next_generation;
        let backup = rotated_path(&self.path, generation);

        let renamed = match fs::rename(&self.path, &backup) {
            Ok(()) => true,
            // Active file removed behind our back; just start a fresh one.
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(source) => return Err(LogSinkError::Rotation { path: backup, source }),
        };

        let file = match open_append(&self.path) {
            Ok(file) => file,
            Err(source) => {
                if renamed {
                    self.roll_back_rename(state, &backup, generation);
                }
                return Err(LogSinkError::Rotation {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if renamed {
            state.next_generation += 1;
            state.generation = generation;
        }
        state.file = file;
        state.size = 0;

        self.prune()
    }

    /// The open handle still refers to the renamed file. Move it back under the
    /// active name so the fallback write lands in the active file.
    ///
    /// The generation number is skipped either way; if the move back fails the
    /// backup stays and counts as rotated out.
    fn roll_back_rename(&self, state: &mut SinkState, backup: &Path, generation: u64) {
        state.next_generation = generation + 1;
        if fs::rename(backup, &self.path).is_err() {
            state.generation = generation;
        }
    }

    fn prune(&self) -> Result<(), LogSinkError> {
        if self.keep_backups == 0 {
            return Ok(());
        }
        let backups = list_backups(&self.path).map_err(|source| LogSinkError::Rotation {
            path: self.path.clone(),
            source,
        })?;
        let excess = backups.len().saturating_sub(self.keep_backups);
        for (_, path) in backups.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(LogSinkError::Rotation { path, source }),
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `MakeWriter` over a shared [`LogSink`]; every formatted tracing event is one `append`.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<LogSink>,
}

impl SinkWriter {
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.append(buf) {
            // The sink counts it and writes its own warning record.
            Ok(()) | Err(LogSinkError::Rotation { .. }) => Ok(buf.len()),
            Err(LogSinkError::Write { source, .. }) => Err(source),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush().map_err(|err| match err {
            LogSinkError::Write { source, .. } | LogSinkError::Rotation { source, .. } => source,
        })
    }
}

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
