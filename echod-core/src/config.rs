//! Daemon configuration: YAML file format, defaults, validation.
//!
//! # File format
//!
//! ```yaml
//! bind_host: 127.0.0.1
//! port: 7007
//! udp_port: 7008          # optional
//! pid_file: /var/run/echod.pid
//! log_file: /var/log/echod/echod.log
//! log_level: info
//! log_rotate_bytes: 10485760
//! log_keep_backups: 5
//! max_connections: 64
//! buffer_size: 4096
//! idle_timeout_ms: 300000
//! shutdown_grace_ms: 5000
//! ```
//!
//! Every field is optional; missing fields take the defaults below. Unknown
//! fields are rejected so typos surface at startup instead of being ignored.
//!
//! A loaded config is never trusted until [`DaemonConfig::validate`] passes.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{invalid, ConfigError};

pub const DEFAULT_PORT: u16 = 7007;
pub const DEFAULT_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_LOG_KEEP_BACKUPS: usize = 5;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Upper bound on the per-connection read buffer.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

pub const PID_FILE_NAME: &str = "echod.pid";
pub const LOG_FILE_NAME: &str = "echod.log";

// ---------------------------------------------------------------------------
// Log level
// ---------------------------------------------------------------------------

/// Log severity threshold. The only setting that can change without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "unknown log level '{other}'; expected: trace, debug, info, warn, error"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

/// Immutable daemon configuration, loaded once before startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub bind_host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub log_level: LogLevel,
    /// Active log file size (bytes) that triggers rotation before the next write.
    pub log_rotate_bytes: u64,
    /// Number of rotated backups kept on disk; `0` keeps every generation.
    pub log_keep_backups: usize,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub idle_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let root = runtime_root();
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            udp_port: None,
            pid_file: root.join("run").join(PID_FILE_NAME),
            log_file: root.join("logs").join(LOG_FILE_NAME),
            log_level: LogLevel::Info,
            log_rotate_bytes: DEFAULT_LOG_ROTATE_BYTES,
            log_keep_backups: DEFAULT_LOG_KEEP_BACKUPS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl DaemonConfig {
    /// Parse a config from YAML text. Does not validate.
    pub fn from_yaml_str(path: &Path, yaml: &str) -> Result<Self, ConfigError> {
        // An empty document means "all defaults".
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load, resolve relative paths against the file's directory, and validate.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(path, &contents)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Render as YAML (used by `echod check-config`).
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Make `pid_file` and `log_file` absolute relative to `base`.
    ///
    /// Must run before daemonization: the daemon changes its working directory
    /// to `/`, after which relative paths would point somewhere else.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.pid_file.is_relative() {
            self.pid_file = base.join(&self.pid_file);
        }
        if self.log_file.is_relative() {
            self.log_file = base.join(&self.log_file);
        }
    }

    /// Check every field. A config that fails here never reaches the daemonizer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host(&self.bind_host)?;

        if self.pid_file.as_os_str().is_empty() {
            return Err(invalid("pid_file", "must not be empty"));
        }
        if self.log_file.as_os_str().is_empty() {
            return Err(invalid("log_file", "must not be empty"));
        }
        if self.log_file.file_name().is_none() {
            return Err(invalid("log_file", "must name a file, not a directory"));
        }
        if self.pid_file == self.log_file {
            return Err(invalid("pid_file", "must differ from log_file"));
        }
        if self.log_rotate_bytes == 0 {
            return Err(invalid("log_rotate_bytes", "must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(invalid(
                "buffer_size",
                format!("must be between 1 and {MAX_BUFFER_SIZE} bytes"),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(invalid("idle_timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// `host:port` label for logs.
    pub fn listen_label(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Compare with a freshly loaded config and split the changes into the
    /// part that can be applied live and the part that needs a restart.
    pub fn reload_delta(&self, next: &DaemonConfig) -> ReloadDelta {
        let mut restart_required = Vec::new();
        let mut check = |field: &'static str, changed: bool| {
            if changed {
                restart_required.push(field);
            }
        };
        check("bind_host", self.bind_host != next.bind_host);
        check("port", self.port != next.port);
        check("udp_port", self.udp_port != next.udp_port);
        check("pid_file", self.pid_file != next.pid_file);
        check("log_file", self.log_file != next.log_file);
        check("log_rotate_bytes", self.log_rotate_bytes != next.log_rotate_bytes);
        check("log_keep_backups", self.log_keep_backups != next.log_keep_backups);
        check("max_connections", self.max_connections != next.max_connections);
        check("buffer_size", self.buffer_size != next.buffer_size);
        check("idle_timeout_ms", self.idle_timeout_ms != next.idle_timeout_ms);
        check("shutdown_grace_ms", self.shutdown_grace_ms != next.shutdown_grace_ms);

        ReloadDelta {
            log_level: (self.log_level != next.log_level).then_some(next.log_level),
            restart_required,
        }
    }
}

/// Outcome of comparing the running config with a reloaded one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReloadDelta {
    /// New log level, if it changed.
    pub log_level: Option<LogLevel>,
    /// Changed fields that are ignored until the daemon restarts.
    pub restart_required: Vec<&'static str>,
}

impl ReloadDelta {
    pub fn is_empty(&self) -> bool {
        self.log_level.is_none() && self.restart_required.is_empty()
    }
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(invalid("bind_host", "must not be empty"));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let hostname_like = host.len() <= 253
        && host
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
    if hostname_like {
        Ok(())
    } else {
        Err(invalid(
            "bind_host",
            format!("'{host}' is neither an IP address nor a host name"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Config sources
// ---------------------------------------------------------------------------

/// Where the supervisor re-reads configuration from on reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<DaemonConfig, ConfigError>;

    /// Human-readable origin for log lines.
    fn describe(&self) -> String;
}

/// A YAML file on disk.
#[derive(Debug, Clone)]
pub struct YamlConfigFile {
    path: PathBuf,
}

impl YamlConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for YamlConfigFile {
    fn load(&self) -> Result<DaemonConfig, ConfigError> {
        DaemonConfig::load_at(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A fixed in-memory config; reloading it is always a no-op.
impl ConfigSource for DaemonConfig {
    fn load(&self) -> Result<DaemonConfig, ConfigError> {
        self.validate()?;
        Ok(self.clone())
    }

    fn describe(&self) -> String {
        "built-in config".to_string()
    }
}

// ---------------------------------------------------------------------------
// Default locations
// ---------------------------------------------------------------------------

/// `<home>/.echod`, or `<tmp>/echod` when no home directory is known.
pub fn runtime_root() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => runtime_root_at(&home),
        None => std::env::temp_dir().join("echod"),
    }
}

/// `<home>/.echod`. Pure, no I/O.
pub fn runtime_root_at(home: &Path) -> PathBuf {
    home.join(".echod")
}

/// `<home>/.echod/config.yaml`, the config file used when `--config` is absent.
pub fn default_config_path() -> PathBuf {
    runtime_root().join("config.yaml")
}
