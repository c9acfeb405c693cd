//! `echod check-config`: validate and print the effective config.

use std::path::Path;

use anyhow::{Context, Result};

use super::load_config;

pub fn run(config_path: Option<&Path>) -> Result<()> {
    let loaded = load_config(config_path)?;
    let yaml = loaded
        .config
        .to_yaml()
        .context("failed to render config as YAML")?;
    println!("# source: {}", loaded.source.describe());
    print!("{yaml}");
    Ok(())
}
