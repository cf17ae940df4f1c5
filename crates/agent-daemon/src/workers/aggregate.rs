//! Aggregate window flushing and debounce-map pruning.
//!
//! Both housekeeping jobs ride the same tick: they're unrelated in
//! purpose but both cheap, periodic, and keyed off the current config,
//! so a dedicated thread for pruning alone would be wasted overhead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agent_core::time::system_time_iso8601;

use crate::logsink::LogSink;
use crate::state::AgentState;

/// Runs until `shutdown` fires. A shutdown signal observed mid-wait
/// ends the loop immediately without flushing a partial window, same
/// as the agent this was modeled on.
pub async fn run(state: Arc<AgentState>, log_sink: Arc<LogSink>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        let config = state.config();
        state.prune_debounce(config.debounce_ms * 10.0);

        if !config.feature_jsonl_log || config.aggregate_window_ms <= 0.0 {
            if wait_or_stop(&mut shutdown, Duration::from_secs(1)).await {
                return;
            }
            continue;
        }

        let window = Duration::from_secs_f64((config.aggregate_window_ms / 1000.0).max(0.1));
        if wait_or_stop(&mut shutdown, window).await {
            return;
        }

        let report = state.aggregate_drain();
        if report.total() == 0 {
            continue;
        }

        let counts: BTreeMap<&'static str, u64> = report
            .counts
            .into_iter()
            .map(|(kind, n)| (kind_token(kind), n))
            .collect();

        let now_iso = system_time_iso8601(report.window_end);
        let debounced = config.aggregate_include_debounced.then_some(report.debounced_skipped);

        if let Err(err) = log_sink.write_jsonl_aggregate(
            &now_iso,
            config.aggregate_window_ms,
            &system_time_iso8601(report.window_start),
            &system_time_iso8601(report.window_end),
            &counts,
            debounced,
        ) {
            tracing::error!(error = %err, "failed to append aggregate jsonl record");
        }
    }
}

async fn wait_or_stop(shutdown: &mut tokio::sync::watch::Receiver<bool>, dur: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(dur) => false,
        result = shutdown.changed() => result.is_err() || *shutdown.borrow(),
    }
}

fn kind_token(kind: agent_core::EventKind) -> &'static str {
    match kind {
        agent_core::EventKind::Created => "created",
        agent_core::EventKind::Modified => "modified",
        agent_core::EventKind::Deleted => "deleted",
    }
}
