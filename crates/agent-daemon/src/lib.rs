//! Project file system watcher daemon.
//!
//! Watches a directory tree, classifies raw `notify` events into
//! created/modified/deleted changes, filters them against configured
//! ignore rules, and reports survivors through a text log, a JSONL
//! log, and a periodically published status snapshot. A small
//! file-based command channel supports pausing, adjusting ignore
//! rules, and rotating logs without restarting the process.

pub mod cli;
pub mod error;
pub mod logsink;
pub mod pipeline;
pub mod state;
pub mod workers;

pub use error::{Error, Result};
