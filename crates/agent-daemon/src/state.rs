//! Shared, concurrently-accessed agent state.
//!
//! Each field is guarded by the narrowest primitive that fits its
//! access pattern rather than one big lock: the config is an
//! `RwLock<Arc<RuntimeConfig>>` so readers never block on a reload, the
//! pause flag is a bare `AtomicBool`, and the debounce map, aggregate
//! window, and command retry counters each get their own `Mutex` since
//! they are written from different workers and shouldn't contend with
//! each other.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};

use agent_core::{time::system_time_iso8601, EventKind, RuntimeConfig};
use globset::{GlobSet, GlobSetBuilder};
use serde::Serialize;

/// Compiles a set of glob patterns into a matcher, dropping (and
/// logging) any pattern that fails to parse rather than failing the
/// whole set — one bad pattern in `extra_ignore_globs` from a command
/// shouldn't take every other ignore rule down with it.
fn build_glob_set(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        match globset::Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => tracing::warn!(pattern, error = %err, "ignoring invalid glob pattern"),
        }
    }
    builder.build().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "failed to compile glob set, falling back to empty set");
        GlobSetBuilder::new().build().expect("empty glob set always compiles")
    })
}

/// Bumped by hand; reported in `status.json` and in `ping` responses.
pub const AGENT_VERSION: &str = "1.0.0";

/// Ignore rules layered on top of the config-file base rules by the
/// `set_ignored` / `add_ignored` / `clear_ignored` commands.
#[derive(Debug, Default, Clone)]
pub struct ExtraIgnore {
    /// Additional absolute paths to ignore.
    pub paths: BTreeSet<PathBuf>,
    /// Additional glob patterns to ignore.
    pub globs: BTreeSet<String>,
}

/// The rolling aggregate window tracked by the aggregate worker.
struct AggregateWindow {
    counts: HashMap<EventKind, u64>,
    debounced_skipped: u64,
    window_start: SystemTime,
}

impl AggregateWindow {
    fn new() -> Self {
        Self {
            counts: zeroed_counts(),
            debounced_skipped: 0,
            window_start: SystemTime::now(),
        }
    }
}

/// A fresh counts map with every `EventKind` seeded at zero, so a
/// drained window always reports `created`/`modified`/`deleted` even
/// when one of them saw nothing, per spec scenario 5.
fn zeroed_counts() -> HashMap<EventKind, u64> {
    [EventKind::Created, EventKind::Modified, EventKind::Deleted]
        .into_iter()
        .map(|kind| (kind, 0))
        .collect()
}

/// A drained aggregate window, ready to be written as a JSONL record.
pub struct AggregateReport {
    /// Event counts by kind accumulated during the window.
    pub counts: HashMap<EventKind, u64>,
    /// Number of events dropped by debouncing during the window.
    pub debounced_skipped: u64,
    /// When the window started.
    pub window_start: SystemTime,
    /// When the window ended (now).
    pub window_end: SystemTime,
}

impl AggregateReport {
    /// Total events recorded across all kinds in the window.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// JSON shape written to `status.json` and embedded in `ping` command
/// responses. Field names and order are part of the agent's external
/// contract; do not rename without a corresponding external consumer
/// update.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub alive: bool,
    pub pid: u32,
    pub uptime_sec: u64,
    pub watch_path: Option<String>,
    pub recursive: bool,
    pub paused: bool,
    pub ignored: Vec<String>,
    pub ignored_extra: Vec<String>,
    pub last_event_ts: Option<String>,
    pub version: &'static str,
}

/// All mutable state shared between the watcher callback and the
/// background workers. Cheaply cloneable via `Arc`; every worker holds
/// its own `Arc<AgentState>`.
pub struct AgentState {
    start: Instant,
    pid: u32,
    config: RwLock<Arc<RuntimeConfig>>,
    config_globset: RwLock<Arc<GlobSet>>,
    paused: AtomicBool,
    last_event_ts: Mutex<Option<String>>,
    extra_ignore: RwLock<ExtraIgnore>,
    extra_globset: RwLock<Arc<GlobSet>>,
    debounce_last: Mutex<HashMap<(EventKind, String), Instant>>,
    aggregate: Mutex<AggregateWindow>,
    command_retries: Mutex<HashMap<String, u32>>,
}

impl AgentState {
    /// Builds fresh state around an initial configuration.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let globset = build_glob_set(config.ignore_globs.iter());
        Self {
            start: Instant::now(),
            pid: std::process::id(),
            config: RwLock::new(Arc::new(config)),
            config_globset: RwLock::new(Arc::new(globset)),
            paused: AtomicBool::new(false),
            last_event_ts: Mutex::new(None),
            extra_ignore: RwLock::new(ExtraIgnore::default()),
            extra_globset: RwLock::new(Arc::new(GlobSetBuilder::new().build().expect("empty glob set always compiles"))),
            debounce_last: Mutex::new(HashMap::new()),
            aggregate: Mutex::new(AggregateWindow::new()),
            command_retries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the currently active configuration (cheap `Arc` clone).
    #[must_use]
    pub fn config(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Returns the glob matcher compiled from the current config's
    /// `ignore_globs`, rebuilt only on reload (see [`Self::update_config`]),
    /// never per event.
    #[must_use]
    pub fn config_globset(&self) -> Arc<GlobSet> {
        Arc::clone(&self.config_globset.read().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Returns the glob matcher compiled from the current
    /// `extra_ignore` rules, rebuilt only when a command changes them.
    #[must_use]
    pub fn extra_globset(&self) -> Arc<GlobSet> {
        Arc::clone(&self.extra_globset.read().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Installs a freshly loaded configuration, replacing the old one
    /// wholesale, and recompiles its `GlobSet`. Does not touch
    /// `extra_ignore`, `paused`, or any noise-reduction state — those
    /// persist across a reload.
    pub fn update_config(&self, config: RuntimeConfig) {
        let globset = build_glob_set(config.ignore_globs.iter());
        *self.config.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(config);
        *self.config_globset.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(globset);
    }

    /// Sets the pause flag.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Whether event processing is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Records the ISO-8601 timestamp of the most recently processed event.
    pub fn record_event_ts(&self, iso_ts: String) {
        *self.last_event_ts.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(iso_ts);
    }

    /// Returns the current extra-ignore rule set (a clone; cheap, only
    /// read on command dispatch and on each filtered event).
    #[must_use]
    pub fn extra_ignore(&self) -> ExtraIgnore {
        self.extra_ignore.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Replaces the extra-ignore rule set wholesale (`set_ignored`).
    pub fn set_extra_ignore(&self, paths: BTreeSet<PathBuf>, globs: BTreeSet<String>) {
        let globset = build_glob_set(globs.iter());
        let mut guard = self.extra_ignore.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.paths = paths;
        guard.globs = globs;
        drop(guard);
        *self.extra_globset.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(globset);
    }

    /// Unions new rules into the extra-ignore rule set (`add_ignored`).
    pub fn add_extra_ignore(&self, paths: BTreeSet<PathBuf>, globs: BTreeSet<String>) {
        let mut guard = self.extra_ignore.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.paths.extend(paths);
        guard.globs.extend(globs);
        let globset = build_glob_set(guard.globs.iter());
        drop(guard);
        *self.extra_globset.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(globset);
    }

    /// Empties the extra-ignore rule set (`clear_ignored`).
    pub fn clear_extra_ignore(&self) {
        let mut guard = self.extra_ignore.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.paths.clear();
        guard.globs.clear();
        drop(guard);
        *self.extra_globset.write().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Arc::new(GlobSetBuilder::new().build().expect("empty glob set always compiles"));
    }

    /// Checks and updates the per-`(kind, path)` debounce window.
    /// Returns `true` if this event should be dropped as a repeat
    /// inside the debounce interval.
    pub fn debounce_should_skip(&self, kind: EventKind, rel_path: &str, debounce_ms: f64) -> bool {
        if debounce_ms <= 0.0 {
            return false;
        }
        let key = (kind, rel_path.to_ascii_lowercase());
        let now = Instant::now();
        let mut map = self.debounce_last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(last) = map.get(&key) {
            if now.duration_since(*last).as_secs_f64() < debounce_ms / 1000.0 {
                return true;
            }
        }
        map.insert(key, now);
        false
    }

    /// Drops debounce entries older than `max_age_ms`, keeping the map
    /// from growing without bound over a long-lived watch.
    pub fn prune_debounce(&self, max_age_ms: f64) {
        if max_age_ms <= 0.0 {
            return;
        }
        let max_age = std::time::Duration::from_secs_f64(max_age_ms / 1000.0);
        let now = Instant::now();
        let mut map = self.debounce_last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.retain(|_, last| now.duration_since(*last) < max_age);
    }

    /// Increments the aggregate count for `kind`.
    pub fn aggregate_record(&self, kind: EventKind) {
        let mut agg = self.aggregate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *agg.counts.entry(kind).or_insert(0) += 1;
    }

    /// Increments the aggregate debounced-skip counter.
    pub fn aggregate_record_debounced_skip(&self) {
        let mut agg = self.aggregate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        agg.debounced_skipped += 1;
    }

    /// Drains the aggregate window and starts a new one.
    pub fn aggregate_drain(&self) -> AggregateReport {
        let mut agg = self.aggregate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let window_end = SystemTime::now();
        let report = AggregateReport {
            counts: std::mem::replace(&mut agg.counts, zeroed_counts()),
            debounced_skipped: agg.debounced_skipped,
            window_start: agg.window_start,
            window_end,
        };
        agg.debounced_skipped = 0;
        agg.window_start = window_end;
        report
    }

    /// Increments and returns the retry count for a command file name.
    pub fn command_retry_increment(&self, name: &str) -> u32 {
        let mut map = self.command_retries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = map.entry(name.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Clears the retry count for a command file name (called on
    /// successful parse, and after the file is moved to `invalid/`).
    pub fn command_retry_reset(&self, name: &str) {
        self.command_retries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
    }

    /// Builds the `status.json` / `ping` snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let config = self.config();
        let extra = self.extra_ignore();
        StatusSnapshot {
            alive: true,
            pid: self.pid,
            uptime_sec: self.start.elapsed().as_secs(),
            watch_path: Some(config.watch_path.display().to_string()),
            recursive: config.recursive,
            paused: self.is_paused(),
            ignored: config.ignore_paths.iter().map(|p| p.display().to_string()).collect(),
            ignored_extra: extra.paths.iter().map(|p| p.display().to_string()).collect(),
            last_event_ts: self
                .last_event_ts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
            version: AGENT_VERSION,
        }
    }
}

/// Formats a `SystemTime` as ISO-8601, used for aggregate window
/// boundaries in JSONL records.
#[must_use]
pub fn iso_ts(t: SystemTime) -> String {
    system_time_iso8601(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            watch_path: PathBuf::from("/proj"),
            recursive: true,
            ignore_paths: BTreeSet::new(),
            ignore_globs: BTreeSet::new(),
            feature_console_log: true,
            feature_text_log: true,
            feature_jsonl_log: true,
            feature_status: true,
            event_types: [EventKind::Created, EventKind::Modified, EventKind::Deleted].into(),
            log_path: PathBuf::from("events.log"),
            jsonl_path: PathBuf::from("events.jsonl"),
            status_path: PathBuf::from("status.json"),
            status_interval_secs: 5.0,
            commands_enabled: false,
            inbox_dir: PathBuf::from("inbox"),
            outbox_dir: PathBuf::from("outbox"),
            command_poll_interval_secs: 0.5,
            debounce_ms: 0.0,
            aggregate_window_ms: 0.0,
            aggregate_include_debounced: false,
        }
    }

    #[test]
    fn debounce_suppresses_repeat_within_window() {
        let state = AgentState::new(config());
        assert!(!state.debounce_should_skip(EventKind::Modified, "a.txt", 1000.0));
        assert!(state.debounce_should_skip(EventKind::Modified, "a.txt", 1000.0));
    }

    #[test]
    fn debounce_disabled_when_zero() {
        let state = AgentState::new(config());
        assert!(!state.debounce_should_skip(EventKind::Modified, "a.txt", 0.0));
        assert!(!state.debounce_should_skip(EventKind::Modified, "a.txt", 0.0));
    }

    #[test]
    fn aggregate_drain_resets_counts_and_window() {
        let state = AgentState::new(config());
        state.aggregate_record(EventKind::Created);
        state.aggregate_record(EventKind::Created);
        state.aggregate_record(EventKind::Deleted);
        state.aggregate_record_debounced_skip();

        let report = state.aggregate_drain();
        assert_eq!(report.total(), 3);
        assert_eq!(report.debounced_skipped, 1);

        let empty = state.aggregate_drain();
        assert_eq!(empty.total(), 0);
        assert_eq!(empty.debounced_skipped, 0);
    }

    #[test]
    fn aggregate_drain_reports_kinds_that_saw_no_events() {
        let state = AgentState::new(config());
        state.aggregate_record(EventKind::Created);
        state.aggregate_record(EventKind::Created);
        state.aggregate_record(EventKind::Created);
        state.aggregate_record(EventKind::Deleted);

        let report = state.aggregate_drain();
        assert_eq!(report.counts.get(&EventKind::Created), Some(&3));
        assert_eq!(report.counts.get(&EventKind::Modified), Some(&0));
        assert_eq!(report.counts.get(&EventKind::Deleted), Some(&1));

        // The next window starts zero-seeded too, not empty.
        let next = state.aggregate_drain();
        assert_eq!(next.counts.get(&EventKind::Created), Some(&0));
        assert_eq!(next.counts.get(&EventKind::Modified), Some(&0));
        assert_eq!(next.counts.get(&EventKind::Deleted), Some(&0));
    }

    #[test]
    fn extra_ignore_set_add_clear_round_trip() {
        let state = AgentState::new(config());
        let mut paths = BTreeSet::new();
        paths.insert(PathBuf::from("/proj/tmp"));
        state.set_extra_ignore(paths, BTreeSet::from(["*.log".to_string()]));
        assert_eq!(state.extra_ignore().paths.len(), 1);

        let mut more = BTreeSet::new();
        more.insert(PathBuf::from("/proj/cache"));
        state.add_extra_ignore(more, BTreeSet::new());
        assert_eq!(state.extra_ignore().paths.len(), 2);

        state.clear_extra_ignore();
        assert!(state.extra_ignore().paths.is_empty());
        assert!(state.extra_ignore().globs.is_empty());
    }

    #[test]
    fn command_retry_increments_and_resets() {
        let state = AgentState::new(config());
        assert_eq!(state.command_retry_increment("bad.json"), 1);
        assert_eq!(state.command_retry_increment("bad.json"), 2);
        state.command_retry_reset("bad.json");
        assert_eq!(state.command_retry_increment("bad.json"), 1);
    }

    #[test]
    fn pause_flag_round_trips() {
        let state = AgentState::new(config());
        assert!(!state.is_paused());
        state.set_paused(true);
        assert!(state.is_paused());
    }

    #[test]
    fn snapshot_reflects_current_config_and_state() {
        let state = AgentState::new(config());
        state.record_event_ts("2026-07-27T00:00:00Z".into());
        let snap = state.snapshot();
        assert_eq!(snap.watch_path.as_deref(), Some("/proj"));
        assert!(snap.recursive);
        assert_eq!(snap.last_event_ts.as_deref(), Some("2026-07-27T00:00:00Z"));
    }

    proptest::proptest! {
        // Property: `add_extra_ignore(X)` applied twice leaves the same
        // `extra_*` sets as applying it once — the "ignore idempotence"
        // invariant from the testable-properties list.
        #[test]
        fn add_ignored_is_idempotent(
            paths in proptest::collection::vec("[a-z]{1,8}", 0..4),
            globs in proptest::collection::vec("\\*\\.[a-z]{1,4}", 0..4),
        ) {
            let path_set: BTreeSet<PathBuf> = paths.iter().map(|p| PathBuf::from(format!("/proj/{p}"))).collect();
            let glob_set: BTreeSet<String> = globs.into_iter().collect();

            let state = AgentState::new(config());
            state.add_extra_ignore(path_set.clone(), glob_set.clone());
            let once = state.extra_ignore();

            state.add_extra_ignore(path_set, glob_set);
            let twice = state.extra_ignore();

            proptest::prop_assert_eq!(once.paths, twice.paths);
            proptest::prop_assert_eq!(once.globs, twice.globs);
        }

        // Property: over any sequence of recorded counts and debounced
        // skips, draining the aggregate window reports exactly what was
        // recorded since the last drain — the "aggregate conservation"
        // invariant. `u8` keeps totals small so `HashMap` summation in
        // `AggregateReport::total` can't silently overflow during the test.
        #[test]
        fn aggregate_drain_conserves_recorded_totals(
            created in 0u8..20,
            modified in 0u8..20,
            deleted in 0u8..20,
            debounced in 0u8..20,
        ) {
            let state = AgentState::new(config());
            for _ in 0..created { state.aggregate_record(EventKind::Created); }
            for _ in 0..modified { state.aggregate_record(EventKind::Modified); }
            for _ in 0..deleted { state.aggregate_record(EventKind::Deleted); }
            for _ in 0..debounced { state.aggregate_record_debounced_skip(); }

            let report = state.aggregate_drain();
            proptest::prop_assert_eq!(report.total(), u64::from(created) + u64::from(modified) + u64::from(deleted));
            proptest::prop_assert_eq!(report.debounced_skipped, u64::from(debounced));

            let drained_again = state.aggregate_drain();
            proptest::prop_assert_eq!(drained_again.total(), 0);
            proptest::prop_assert_eq!(drained_again.debounced_skipped, 0);
        }
    }
}
