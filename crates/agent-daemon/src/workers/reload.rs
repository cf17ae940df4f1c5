//! Config hot-reload: watches `config.yml`'s mtime and installs a
//! freshly loaded `RuntimeConfig` when it changes, without restarting
//! the watcher thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use agent_core::{CliOverrides, RuntimeConfig};

use crate::logsink::LogSink;
use crate::state::AgentState;

const TICK: Duration = Duration::from_secs(1);

/// Polls `<agent_dir>/config.yml` every second; on a changed mtime,
/// reloads the config (re-applying `overrides`), swaps it into
/// `state`, and re-points `log_sink` at the new paths/feature flags.
pub async fn run(
    state: Arc<AgentState>,
    log_sink: Arc<LogSink>,
    agent_dir: PathBuf,
    project_root: PathBuf,
    overrides: CliOverrides,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let cfg_path = agent_dir.join("config.yml");
    let mut last_mtime = mtime_of(&cfg_path);

    loop {
        let wait = if cfg_path.exists() {
            let mtime = mtime_of(&cfg_path);
            if mtime != last_mtime {
                let new_config = RuntimeConfig::load(&agent_dir, &project_root, &overrides);
                log_sink.reconfigure(
                    &new_config.log_path,
                    &new_config.jsonl_path,
                    new_config.feature_text_log,
                    new_config.feature_jsonl_log,
                );
                state.update_config(new_config);
                last_mtime = mtime;
                tracing::info!("config reloaded from agent/config.yml");
            }
            TICK
        } else {
            TICK
        };

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn mtime_of(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
