//! `echod logs`: tail of the active log file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use super::load_config;

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,
}

impl LogsArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let loaded = load_config(config_path)?;
        print_tail(&loaded.config.log_file, self.lines)
    }
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    println!("==> {} <==", path.display());
    for line in tail(BufReader::new(file), lines).with_context(|| format!("read {}", path.display()))? {
        println!("{line}");
    }
    Ok(())
}

fn tail(reader: impl BufRead, lines: usize) -> std::io::Result<VecDeque<String>> {
    let mut tail = VecDeque::with_capacity(lines);
    if lines == 0 {
        return Ok(tail);
    }
    for line in reader.lines() {
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line?);
    }
    Ok(tail)
}
