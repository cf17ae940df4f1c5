//! Shared types for the project file system agent: configuration
//! loading, the error type, and small I/O helpers reused by both the
//! event pipeline and the daemon's periodic workers.

pub mod atomic;
pub mod config;
pub mod error;
pub mod time;

pub use config::{CliOverrides, EventKind, RuntimeConfig};
pub use error::{Error, Result};
