//! Periodic `status.json` heartbeat.

use std::sync::Arc;
use std::time::Duration;

use agent_core::atomic::write_json_atomic;

use crate::state::AgentState;

/// Publishes a status snapshot every `status_interval_secs` (minimum
/// 1.0s) until `shutdown` fires.
pub async fn run(state: Arc<AgentState>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        let config = state.config();
        if config.feature_status {
            if let Err(err) = write_json_atomic(&config.status_path, &state.snapshot()) {
                tracing::error!(error = %err, "failed to write status.json");
            }
        }

        let interval = Duration::from_secs_f64(config.status_interval_secs.max(1.0));
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
