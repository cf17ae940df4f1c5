//! Background workers spawned by `main`: status heartbeat, config
//! reload, aggregate flush, and the command channel each run as an
//! independent tokio task; the file watcher runs on its own OS thread
//! (see [`watch`]).

pub mod aggregate;
pub mod commands;
pub mod reload;
pub mod status;
pub mod watch;
