//! echod core library: configuration, lifecycle types, errors.
//!
//! - [`config`]: [`DaemonConfig`] load / validate / reload diff
//! - [`types`]: [`DaemonState`], [`ControlCommand`], [`ConnectionId`]
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigSource, DaemonConfig, LogLevel, ReloadDelta, YamlConfigFile};
pub use error::ConfigError;
pub use types::{ConnectionId, ControlCommand, DaemonState};
