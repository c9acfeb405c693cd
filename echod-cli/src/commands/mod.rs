pub mod check_config;
pub mod logs;
pub mod signal;
pub mod start;
pub mod status;
pub mod stop;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use echod_core::config::default_config_path;
use echod_core::{ConfigError, ConfigSource, DaemonConfig, YamlConfigFile};
use echod_daemon::{exit_code, DaemonError};

/// Config to run with, and where a reload re-reads it from.
pub struct LoadedConfig {
    pub config: DaemonConfig,
    pub source: Box<dyn ConfigSource>,
}

/// Load and validate the config named by `--config`, or the default file.
///
/// An explicit path must exist. The default path is optional: without it the
/// built-in defaults apply and reload keeps them.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = match explicit {
        Some(path) => absolute(path)?,
        None => {
            let path = default_config_path();
            if !path.exists() {
                let config = DaemonConfig::default();
                config.validate()?;
                return Ok(LoadedConfig {
                    source: Box::new(config.clone()),
                    config,
                });
            }
            path
        }
    };

    let config = DaemonConfig::load_at(&path)?;
    Ok(LoadedConfig {
        config,
        source: Box::new(YamlConfigFile::new(path)),
    })
}

// Relative paths in the config resolve against the config file's directory,
// which must itself be absolute because the daemon changes directory to `/`.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    Ok(cwd.join(path))
}

/// Process exit code for a failed command.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    let code = err
        .chain()
        .find_map(|cause| {
            if let Some(daemon_err) = cause.downcast_ref::<DaemonError>() {
                Some(daemon_err.exit_code())
            } else if cause.downcast_ref::<ConfigError>().is_some() {
                Some(exit_code::INVALID_CONFIG)
            } else {
                None
            }
        })
        .unwrap_or(exit_code::FAULT);
    u8::try_from(code).unwrap_or(1)
}
