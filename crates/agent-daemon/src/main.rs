//! `agent-daemon` CLI entry point.
//!
//! Locates the agent directory (where `config.yml`, `events.log`,
//! `events.jsonl`, `status.json`, and `commands/` all live) next to the
//! running executable, the nearest equivalent of the original agent's
//! "directory the script lives in" once it's a compiled binary rather
//! than a script — the parent of that directory is the default watch
//! path, mirroring the original's `agent_dir.parent()`.

use std::path::PathBuf;
use std::sync::Arc;

use agent_core::{CliOverrides, RuntimeConfig};
use agent_daemon::cli::Cli;
use agent_daemon::error::{Error, Result};
use agent_daemon::logsink::LogSink;
use agent_daemon::pipeline::EventFilterPipeline;
use agent_daemon::state::AgentState;
use agent_daemon::workers::{aggregate, commands, reload, status, watch};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let code: u8 = match run().await {
        Ok(()) => 0,
        Err(err) => {
            let code = match &err {
                Error::InvalidWatchPath { .. } => 2,
                _ => 1,
            };
            eprintln!("{:?}", miette::Report::new(err));
            code
        }
    };
    std::process::ExitCode::from(code)
}

async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();

    let cli = Cli::parse();
    let overrides = cli.overrides();

    let agent_dir = locate_agent_dir()?;
    let project_root = agent_dir.parent().map(PathBuf::from).unwrap_or_else(|| agent_dir.clone());

    let config = RuntimeConfig::load(&agent_dir, &project_root, &overrides);

    if !config.watch_path.is_dir() {
        return Err(Error::InvalidWatchPath {
            path: config.watch_path.display().to_string(),
        });
    }

    tracing::info!(
        watch_path = %config.watch_path.display(),
        recursive = config.recursive,
        "agent starting"
    );

    let log_sink = Arc::new(LogSink::new(
        &config.log_path,
        &config.jsonl_path,
        config.feature_text_log,
        config.feature_jsonl_log,
    ));
    let state = Arc::new(AgentState::new(config.clone()));
    let pipeline = Arc::new(EventFilterPipeline::new(Arc::clone(&state), Arc::clone(&log_sink)));

    let watch_handle = watch::spawn(config.watch_path.clone(), config.recursive, pipeline).map_err(Error::WatcherStart)?;

    run_workers(state, log_sink, agent_dir, project_root, overrides).await;

    watch_handle.shutdown();
    tracing::info!("agent stopped");
    Ok(())
}

async fn run_workers(
    state: Arc<AgentState>,
    log_sink: Arc<LogSink>,
    agent_dir: PathBuf,
    project_root: PathBuf,
    overrides: CliOverrides,
) {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let status_task = tokio::spawn(status::run(Arc::clone(&state), shutdown_rx.clone()));
    let reload_task = tokio::spawn(reload::run(
        Arc::clone(&state),
        Arc::clone(&log_sink),
        agent_dir,
        project_root,
        overrides,
        shutdown_rx.clone(),
    ));
    let aggregate_task = tokio::spawn(aggregate::run(Arc::clone(&state), Arc::clone(&log_sink), shutdown_rx.clone()));
    let commands_task = tokio::spawn(commands::run(state, log_sink, shutdown_rx));

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install ctrl_c handler, shutting down immediately");
    } else {
        tracing::info!("shutdown requested");
    }

    let _ = shutdown_tx.send(true);

    let join_all = async {
        let _ = tokio::join!(status_task, reload_task, aggregate_task, commands_task);
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), join_all).await.is_err() {
        tracing::warn!("one or more workers did not stop within the shutdown timeout");
    }
}

fn locate_agent_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(|e| Error::Core(agent_core::Error::io("locating current executable", e)))?;
    exe.parent()
        .map(PathBuf::from)
        .ok_or_else(|| Error::Core(agent_core::Error::parse("locating agent directory", "executable has no parent directory")))
}
