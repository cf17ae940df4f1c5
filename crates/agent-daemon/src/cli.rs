//! Command-line surface.

use std::path::PathBuf;

use agent_core::CliOverrides;
use clap::Parser;

/// Watches a project directory for file system changes and reports
/// them through `agent/events.log`, `agent/events.jsonl`, and
/// `agent/status.json`.
#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Override the watched path (otherwise read from config.yml).
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Disable recursive watching regardless of config.yml.
    #[arg(long)]
    pub no_recursive: bool,
}

impl Cli {
    /// Converts the parsed CLI flags into the `CliOverrides` the
    /// config loader re-applies on every load, including reloads.
    #[must_use]
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            path: self.path.clone(),
            no_recursive: self.no_recursive,
        }
    }
}
