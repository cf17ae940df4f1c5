//! Startup-fatal errors.
//!
//! Day-to-day operational failures (a write that fails, a malformed
//! command file) are logged and the affected worker keeps going — only
//! the handful of conditions that make running at all pointless reach
//! here, so they can be reported to the terminal as a `miette`
//! diagnostic instead of a bare error chain.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for daemon startup.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors that abort startup before the watch loop begins.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// The configured or overridden watch path doesn't exist or isn't a directory.
    #[error("invalid watch path: {path}")]
    #[diagnostic(
        code(agent_daemon::invalid_watch_path),
        help("pass an existing directory via --path, or fix watch.path in config.yml")
    )]
    InvalidWatchPath {
        /// The path that failed validation.
        path: String,
    },

    /// The underlying `notify` watcher could not be started.
    #[error("failed to start file system watcher")]
    #[diagnostic(code(agent_daemon::watcher_start_failed))]
    WatcherStart(#[source] notify::Error),

    /// A shared `agent-core` operation failed during startup.
    #[error(transparent)]
    #[diagnostic(code(agent_daemon::core))]
    Core(#[from] agent_core::Error),
}
