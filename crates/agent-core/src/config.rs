//! `RuntimeConfig`: the immutable, section-merged configuration snapshot.
//!
//! Loading is infallible from the caller's point of view — a missing or
//! malformed `config.yml` degrades to defaults (spec error class
//! "configuration-degraded") rather than failing the agent's startup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// One of the three raw filesystem change kinds the agent classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new file or directory entry appeared.
    Created,
    /// An existing entry's contents or metadata changed.
    Modified,
    /// An entry was removed.
    Deleted,
}

impl EventKind {
    /// The upper-case token used in `events.log` lines (`CREATED`, …).
    #[must_use]
    pub fn log_token(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// CLI overrides layered on top of every config load (initial and
/// reload), so a reload never silently reverts them.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `--path <dir>`, overrides `watch.path`.
    pub path: Option<PathBuf>,
    /// `--no-recursive`, forces `recursive = false`.
    pub no_recursive: bool,
}

/// Immutable, fully resolved agent configuration.
///
/// Produced by [`RuntimeConfig::load`]. A new `RuntimeConfig` value
/// replaces the old one wholesale on every reload — there is no partial
/// mutation of a live config.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Absolute directory being watched.
    pub watch_path: PathBuf,
    /// Whether subdirectories are watched too.
    pub recursive: bool,
    /// Absolute paths to ignore (exact or ancestor match).
    pub ignore_paths: BTreeSet<PathBuf>,
    /// Glob patterns matched against the watch-relative path.
    pub ignore_globs: BTreeSet<String>,
    /// Whether to print two lines per event to stdout.
    pub feature_console_log: bool,
    /// Whether to append lines to `events.log`.
    pub feature_text_log: bool,
    /// Whether to append records to `events.jsonl`.
    pub feature_jsonl_log: bool,
    /// Whether `status.json` is published.
    pub feature_status: bool,
    /// Which event kinds are processed at all.
    pub event_types: BTreeSet<EventKind>,
    /// Absolute path of the text log.
    pub log_path: PathBuf,
    /// Absolute path of the JSONL log.
    pub jsonl_path: PathBuf,
    /// Absolute path of the status snapshot.
    pub status_path: PathBuf,
    /// Status publish cadence in seconds (effective minimum enforced by caller: 1.0).
    pub status_interval_secs: f64,
    /// Whether the file-based command channel is active.
    pub commands_enabled: bool,
    /// Directory commands are dropped into.
    pub inbox_dir: PathBuf,
    /// Directory responses are written into.
    pub outbox_dir: PathBuf,
    /// Command poll cadence in seconds (effective minimum enforced by caller: 0.1).
    pub command_poll_interval_secs: f64,
    /// Per-`(kind, path)` debounce window in milliseconds; 0 disables debouncing.
    pub debounce_ms: f64,
    /// Aggregate flush window in milliseconds; 0 disables aggregation.
    pub aggregate_window_ms: f64,
    /// Whether aggregate records also report `debounced_skipped`.
    pub aggregate_include_debounced: bool,
}

impl RuntimeConfig {
    /// Loads configuration from `<agent_dir>/config.yml`, falling back
    /// to defaults (derived from `agent_dir`/`project_root`) for a
    /// missing file or parse failure, applies `overrides`, and resolves
    /// every path to absolute.
    #[must_use]
    pub fn load(agent_dir: &Path, project_root: &Path, overrides: &CliOverrides) -> Self {
        let defaults = default_raw(agent_dir, project_root);
        let cfg_path = agent_dir.join("config.yml");

        let merged = if cfg_path.exists() {
            match std::fs::read_to_string(&cfg_path) {
                Ok(text) => match serde_yaml::from_str::<Value>(&text) {
                    Ok(file_value) => merge_sections(defaults, file_value),
                    Err(err) => {
                        tracing::warn!(
                            path = %cfg_path.display(),
                            error = %err,
                            "failed to parse config.yml, using defaults"
                        );
                        defaults
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        path = %cfg_path.display(),
                        error = %err,
                        "failed to read config.yml, using defaults"
                    );
                    defaults
                }
            }
        } else {
            defaults
        };

        let raw: RawConfig = serde_yaml::from_value(merged).unwrap_or_default();
        let mut resolved = resolve(raw);
        apply_overrides(&mut resolved, overrides);
        resolved
    }
}

fn apply_overrides(cfg: &mut RuntimeConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.path {
        cfg.watch_path = absolutize(path);
    }
    if overrides.no_recursive {
        cfg.recursive = false;
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Section-wise merge: each of the seven known top-level sections is
/// merged key-by-key (file keys override default keys within the
/// section); a file value for a section that isn't a mapping replaces
/// the section wholesale; unknown top-level sections from the file are
/// preserved in the result (ignored by the typed deserializer above,
/// per spec §6 "unused").
fn merge_sections(mut defaults: Value, file: Value) -> Value {
    let Value::Mapping(file_map) = file else {
        return defaults;
    };
    let Value::Mapping(defaults_map) = &mut defaults else {
        return defaults;
    };

    for (key, file_section) in file_map {
        match (defaults_map.get(&key).cloned(), &file_section) {
            (Some(Value::Mapping(default_section)), Value::Mapping(file_section_map)) => {
                let mut merged_section = default_section;
                for (k, v) in file_section_map {
                    merged_section.insert(k.clone(), v.clone());
                }
                defaults_map.insert(key, Value::Mapping(merged_section));
            }
            _ => {
                defaults_map.insert(key, file_section);
            }
        }
    }

    defaults
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    watch: RawWatch,
    ignore: RawIgnore,
    features: RawFeatures,
    logging: RawLogging,
    jsonl: RawJsonl,
    status: RawStatus,
    commands: RawCommands,
}

impl Default for RawConfig {
    fn default() -> Self {
        // Only reached if the merged value somehow fails the typed
        // deserialize entirely (defaults always round-trip cleanly in
        // practice); falls back to an empty-ish agent rooted at CWD.
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        serde_yaml::from_value(default_raw(&cwd.join("agent"), &cwd)).unwrap_or(RawConfig {
            watch: RawWatch { path: cwd.display().to_string(), recursive: true },
            ignore: RawIgnore { paths: vec![], globs: vec![] },
            features: RawFeatures::default(),
            logging: RawLogging { level: "INFO".into(), file: "events.log".into() },
            jsonl: RawJsonl { file: "events.jsonl".into() },
            status: RawStatus { file: "status.json".into(), interval_sec: 5.0 },
            commands: RawCommands::default(),
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RawWatch {
    path: String,
    #[serde(default = "default_true")]
    recursive: bool,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct RawIgnore {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    globs: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawFeatures {
    #[serde(default = "default_true")]
    console_log: bool,
    #[serde(default = "default_true")]
    text_log: bool,
    #[serde(default = "default_true")]
    jsonl_log: bool,
    #[serde(default = "default_true")]
    status: bool,
    #[serde(default = "default_event_types")]
    event_types: Vec<String>,
    #[serde(default)]
    debounce_ms: f64,
    #[serde(default)]
    aggregate_window_ms: f64,
    #[serde(default)]
    aggregate_include_debounced: bool,
}

impl Default for RawFeatures {
    fn default() -> Self {
        Self {
            console_log: true,
            text_log: true,
            jsonl_log: true,
            status: true,
            event_types: default_event_types(),
            debounce_ms: 0.0,
            aggregate_window_ms: 0.0,
            aggregate_include_debounced: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RawLogging {
    #[serde(default = "default_level")]
    level: String,
    file: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawJsonl {
    file: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawStatus {
    file: String,
    #[serde(default = "default_status_interval")]
    interval_sec: f64,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawCommands {
    #[serde(default)]
    enabled: bool,
    inbox: String,
    outbox: String,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: f64,
}

impl Default for RawCommands {
    fn default() -> Self {
        Self {
            enabled: false,
            inbox: "commands/inbox".into(),
            outbox: "commands/outbox".into(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "INFO".into()
}

fn default_status_interval() -> f64 {
    5.0
}

fn default_poll_interval_ms() -> f64 {
    500.0
}

fn default_event_types() -> Vec<String> {
    vec!["created".into(), "modified".into(), "deleted".into()]
}

fn default_raw(agent_dir: &Path, project_root: &Path) -> Value {
    let raw = RawConfig {
        watch: RawWatch {
            path: project_root.display().to_string(),
            recursive: true,
        },
        ignore: RawIgnore {
            paths: vec![
                agent_dir.join("events.log").display().to_string(),
                agent_dir.join("events.jsonl").display().to_string(),
                agent_dir.join("status.json").display().to_string(),
                agent_dir.join("status.json.tmp").display().to_string(),
                agent_dir.join("commands").display().to_string(),
            ],
            globs: vec![".git/**".into(), "agent/commands/**".into()],
        },
        features: RawFeatures::default(),
        logging: RawLogging {
            level: default_level(),
            file: agent_dir.join("events.log").display().to_string(),
        },
        jsonl: RawJsonl {
            file: agent_dir.join("events.jsonl").display().to_string(),
        },
        status: RawStatus {
            file: agent_dir.join("status.json").display().to_string(),
            interval_sec: default_status_interval(),
        },
        commands: RawCommands {
            enabled: false,
            inbox: agent_dir.join("commands/inbox").display().to_string(),
            outbox: agent_dir.join("commands/outbox").display().to_string(),
            poll_interval_ms: default_poll_interval_ms(),
        },
    };
    serde_yaml::to_value(SerializableRaw(&raw)).unwrap_or(Value::Mapping(Default::default()))
}

/// `RawConfig` itself only derives `Deserialize` (its fields use
/// `#[serde(default = ...)]`, which `Serialize` ignores anyway); this
/// thin wrapper lets [`default_raw`] turn a `RawConfig` back into a
/// `Value` for section-merging without deriving `Serialize` on the
/// public-facing type.
struct SerializableRaw<'a>(&'a RawConfig);

impl Serialize for SerializableRaw<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(7))?;
        map.serialize_entry("watch", &self.0.watch)?;
        map.serialize_entry("ignore", &self.0.ignore)?;
        map.serialize_entry("features", &self.0.features)?;
        map.serialize_entry("logging", &self.0.logging)?;
        map.serialize_entry("jsonl", &self.0.jsonl)?;
        map.serialize_entry("status", &self.0.status)?;
        map.serialize_entry("commands", &self.0.commands)?;
        map.end()
    }
}

impl Serialize for RawFeatures {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(8))?;
        map.serialize_entry("console_log", &self.console_log)?;
        map.serialize_entry("text_log", &self.text_log)?;
        map.serialize_entry("jsonl_log", &self.jsonl_log)?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("event_types", &self.event_types)?;
        map.serialize_entry("debounce_ms", &self.debounce_ms)?;
        map.serialize_entry("aggregate_window_ms", &self.aggregate_window_ms)?;
        map.serialize_entry("aggregate_include_debounced", &self.aggregate_include_debounced)?;
        map.end()
    }
}

fn resolve(raw: RawConfig) -> RuntimeConfig {
    let event_types = raw
        .features
        .event_types
        .iter()
        .filter_map(|s| match s.as_str() {
            "created" => Some(EventKind::Created),
            "modified" => Some(EventKind::Modified),
            "deleted" => Some(EventKind::Deleted),
            other => {
                tracing::warn!(kind = other, "ignoring unknown event type in config");
                None
            }
        })
        .collect();

    RuntimeConfig {
        watch_path: absolutize(Path::new(&raw.watch.path)),
        recursive: raw.watch.recursive,
        ignore_paths: raw.ignore.paths.iter().map(|p| absolutize(Path::new(p))).collect(),
        ignore_globs: raw.ignore.globs.into_iter().collect(),
        feature_console_log: raw.features.console_log,
        feature_text_log: raw.features.text_log,
        feature_jsonl_log: raw.features.jsonl_log,
        feature_status: raw.features.status,
        event_types,
        log_path: absolutize(Path::new(&raw.logging.file)),
        jsonl_path: absolutize(Path::new(&raw.jsonl.file)),
        status_path: absolutize(Path::new(&raw.status.file)),
        status_interval_secs: raw.status.interval_sec,
        commands_enabled: raw.commands.enabled,
        inbox_dir: absolutize(Path::new(&raw.commands.inbox)),
        outbox_dir: absolutize(Path::new(&raw.commands.outbox)),
        command_poll_interval_secs: raw.commands.poll_interval_ms / 1000.0,
        debounce_ms: raw.features.debounce_ms,
        aggregate_window_ms: raw.features.aggregate_window_ms,
        aggregate_include_debounced: raw.features.aggregate_include_debounced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agent");
        std::fs::create_dir_all(&agent_dir).unwrap();

        let cfg = RuntimeConfig::load(&agent_dir, dir.path(), &CliOverrides::default());

        assert_eq!(cfg.watch_path, dir.path());
        assert!(cfg.recursive);
        assert!(cfg.feature_console_log);
        assert_eq!(cfg.event_types.len(), 3);
        assert_eq!(cfg.debounce_ms, 0.0);
    }

    #[test]
    fn section_merge_keeps_untouched_keys() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agent");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("config.yml"),
            "features:\n  status: false\n",
        )
        .unwrap();

        let cfg = RuntimeConfig::load(&agent_dir, dir.path(), &CliOverrides::default());

        assert!(!cfg.feature_status);
        // Untouched sibling key in the same section keeps its default.
        assert!(cfg.feature_console_log);
    }

    #[test]
    fn malformed_yaml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agent");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(agent_dir.join("config.yml"), "not: [valid: yaml").unwrap();

        let cfg = RuntimeConfig::load(&agent_dir, dir.path(), &CliOverrides::default());
        assert_eq!(cfg.watch_path, dir.path());
    }

    #[test]
    fn cli_overrides_apply_on_top_of_file_config() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agent");
        std::fs::create_dir_all(&agent_dir).unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let overrides = CliOverrides {
            path: Some(other_dir.path().to_path_buf()),
            no_recursive: true,
        };
        let cfg = RuntimeConfig::load(&agent_dir, dir.path(), &overrides);

        assert_eq!(cfg.watch_path, other_dir.path());
        assert!(!cfg.recursive);
    }

    #[test]
    fn unknown_event_type_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agent");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("config.yml"),
            "features:\n  event_types: [created, teleported]\n",
        )
        .unwrap();

        let cfg = RuntimeConfig::load(&agent_dir, dir.path(), &CliOverrides::default());
        assert_eq!(cfg.event_types.len(), 1);
        assert!(cfg.event_types.contains(&EventKind::Created));
    }
}
