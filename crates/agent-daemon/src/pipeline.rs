//! Event classification and filtering: turns a raw `notify` event into
//! zero or one reported change, applying ignore rules, per-kind
//! toggles, and debouncing before anything is written out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use agent_core::{time::now_iso8601, EventKind, RuntimeConfig};
use globset::GlobSet;

use crate::logsink::LogSink;
use crate::state::AgentState;

/// Applies ignore rules, debouncing, and the configured output
/// features to one classified file system change.
pub struct EventFilterPipeline {
    state: Arc<AgentState>,
    log_sink: Arc<LogSink>,
}

impl EventFilterPipeline {
    /// Builds a pipeline bound to shared state and the product log sink.
    #[must_use]
    pub fn new(state: Arc<AgentState>, log_sink: Arc<LogSink>) -> Self {
        Self { state, log_sink }
    }

    /// Processes one raw change. `abs_path` need not exist (deletions
    /// don't). `is_dir` drops directory entries before any other
    /// filter runs, per the directory-filter step. No-ops silently on
    /// any filtered-out or paused case, as does the original agent.
    pub fn handle_event(&self, kind: EventKind, abs_path: &Path, is_dir: bool) {
        if is_dir {
            return;
        }

        if self.state.is_paused() {
            return;
        }

        let config = self.state.config();
        if !config.event_types.contains(&kind) {
            return;
        }

        if is_ignored(
            &config,
            &self.state.extra_ignore(),
            &self.state.config_globset(),
            &self.state.extra_globset(),
            abs_path,
        ) {
            return;
        }

        let rel_path = relative_display(&config.watch_path, abs_path);

        if self.state.debounce_should_skip(kind, &rel_path, config.debounce_ms) {
            self.state.aggregate_record_debounced_skip();
            return;
        }

        if config.feature_console_log {
            println!("File: {rel_path}");
            println!("Change: {kind}");
        }

        let now = SystemTime::now();
        if config.feature_text_log {
            if let Err(err) = self.log_sink.write_text_event(now, kind, &rel_path) {
                tracing::warn!(error = %err, "failed to append events.log line");
            }
        }

        let now_iso = now_iso8601();
        if config.feature_jsonl_log {
            let abs_display = abs_path.display().to_string();
            if let Err(err) = self.log_sink.write_jsonl_event(&now_iso, kind, &rel_path, &abs_display) {
                tracing::warn!(error = %err, "failed to append events.jsonl record");
            }
        }

        self.state.aggregate_record(kind);
        self.state.record_event_ts(now_iso);
    }
}

/// True if `abs_path` matches a base or extra ignore rule: an exact
/// match or directory-ancestor match against `ignore_paths`, or a glob
/// match against the watch-relative, forward-slash path using the
/// precompiled `GlobSet`s `AgentState` rebuilds on reload/command
/// (rather than recompiling each pattern per event).
///
/// Ancestor matching uses [`Path::starts_with`], which compares whole
/// path components rather than raw string prefixes — `/a/b` does not
/// spuriously match an ignore rule for `/a/bc`.
fn is_ignored(
    config: &RuntimeConfig,
    extra: &crate::state::ExtraIgnore,
    config_globset: &GlobSet,
    extra_globset: &GlobSet,
    abs_path: &Path,
) -> bool {
    for ignored in config.ignore_paths.iter().chain(extra.paths.iter()) {
        if abs_path == ignored || abs_path.starts_with(ignored) {
            return true;
        }
    }

    let Ok(rel) = abs_path.strip_prefix(&config.watch_path) else {
        return false;
    };
    let rel_posix = to_posix(rel);

    config_globset.is_match(&rel_posix) || extra_globset.is_match(&rel_posix)
}

fn relative_display(base: &Path, abs_path: &Path) -> String {
    match abs_path.strip_prefix(base) {
        Ok(rel) => to_posix(rel),
        Err(_) => abs_path.display().to_string(),
    }
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolves a raw `notify` event path to the form the pipeline expects:
/// absolute, with any Windows extended-length `\\?\` prefix stripped.
#[must_use]
pub fn normalize_event_path(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    let stripped = s.strip_prefix(r"\\?\").unwrap_or(&s);
    PathBuf::from(stripped)
}
