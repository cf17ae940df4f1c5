//! The file-based command channel: `<inbox>/*.json` in, a matching
//! `<outbox>/<id>.response.json` out.
//!
//! Command files are polled rather than watched, since they live
//! inside the same tree the agent may itself be watching (and are
//! excluded from event reporting via the default ignore globs, not via
//! any special-casing here).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_core::{atomic::write_json_atomic, time::now_iso8601, Error};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::logsink::LogSink;
use crate::state::AgentState;

/// Runs the command poll loop until `shutdown` fires.
pub async fn run(state: Arc<AgentState>, log_sink: Arc<LogSink>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        let config = state.config();
        if !config.commands_enabled {
            if wait_or_stop(&mut shutdown, Duration::from_secs(1)).await {
                return;
            }
            continue;
        }

        if let Err(err) = process_once(&state, &log_sink, &config.inbox_dir, &config.outbox_dir) {
            tracing::error!(error = %err, "command worker error");
        }

        let poll = Duration::from_secs_f64(config.command_poll_interval_secs.max(0.1));
        if wait_or_stop(&mut shutdown, poll).await {
            return;
        }
    }
}

async fn wait_or_stop(shutdown: &mut tokio::sync::watch::Receiver<bool>, dur: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(dur) => false,
        result = shutdown.changed() => result.is_err() || *shutdown.borrow(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CommandFile {
    id: Option<String>,
    op: Option<String>,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    globs: Vec<String>,
}

fn process_once(state: &AgentState, log_sink: &LogSink, inbox: &Path, outbox: &Path) -> agent_core::Result<()> {
    std::fs::create_dir_all(inbox).map_err(|e| Error::io(format!("creating {}", inbox.display()), e))?;
    std::fs::create_dir_all(outbox).map_err(|e| Error::io(format!("creating {}", outbox.display()), e))?;
    let processed_dir = inbox.join("processed");
    let invalid_dir = inbox.join("invalid");
    std::fs::create_dir_all(&processed_dir).map_err(|e| Error::io(format!("creating {}", processed_dir.display()), e))?;
    std::fs::create_dir_all(&invalid_dir).map_err(|e| Error::io(format!("creating {}", invalid_dir.display()), e))?;

    let entries = match std::fs::read_dir(inbox) {
        Ok(entries) => entries,
        Err(err) => return Err(Error::io(format!("reading {}", inbox.display()), err)),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        // Skip files still being written: require they be at least
        // 50ms old, mirroring the original agent's debounce against
        // reading a half-written command file.
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                if modified.elapsed().map(|e| e.as_millis() < 50).unwrap_or(false) {
                    continue;
                }
            }
        }

        handle_command_file(state, log_sink, &path, &processed_dir, &invalid_dir, outbox);
    }

    Ok(())
}

fn handle_command_file(
    state: &AgentState,
    log_sink: &LogSink,
    path: &Path,
    processed_dir: &Path,
    invalid_dir: &Path,
    outbox: &Path,
) {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            record_invalid(state, path, invalid_dir, &name, "unicode_decode", &err.to_string());
            return;
        }
    };

    let parsed: Result<CommandFile, _> = serde_json::from_str(&text);
    let cmd = match parsed {
        Ok(cmd) => {
            state.command_retry_reset(&name);
            cmd
        }
        Err(err) => {
            record_invalid(state, path, invalid_dir, &name, "json_decode", &err.to_string());
            return;
        }
    };

    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| name.clone());
    let cmd_id = cmd.id.clone().unwrap_or(stem);
    let op = cmd.op.clone().unwrap_or_default().to_ascii_lowercase();

    let mut resp = Map::new();
    resp.insert("id".into(), json!(cmd_id));
    resp.insert("op".into(), json!(op));
    resp.insert("ts".into(), json!(now_iso8601()));

    let (ok, msg) = dispatch(state, log_sink, &op, &cmd, &mut resp);
    resp.insert("ok".into(), json!(ok));
    if let Some(msg) = msg {
        resp.insert("msg".into(), json!(msg));
    }

    let out = outbox.join(format!("{cmd_id}.response.json"));
    if let Err(err) = write_json_atomic(&out, &Value::Object(resp)) {
        tracing::error!(error = %err, "failed to write command response");
    }

    let dest = processed_dir.join(format!("{name}.done"));
    if std::fs::rename(path, &dest).is_err() {
        let _ = std::fs::remove_file(path);
    }
}

fn dispatch(state: &AgentState, log_sink: &LogSink, op: &str, cmd: &CommandFile, resp: &mut Map<String, Value>) -> (bool, Option<String>) {
    match op {
        "pause" => {
            state.set_paused(true);
            (true, Some("paused".into()))
        }
        "resume" => {
            state.set_paused(false);
            (true, Some("resumed".into()))
        }
        "ping" => {
            resp.insert("pong".into(), json!(true));
            resp.insert("status".into(), serde_json::to_value(state.snapshot()).unwrap_or(Value::Null));
            (true, None)
        }
        "set_ignored" => {
            let paths = resolve_paths(&cmd.paths);
            let globs: BTreeSet<String> = cmd.globs.iter().cloned().collect();
            state.set_extra_ignore(paths.clone(), globs.clone());
            resp.insert("ignored_paths".into(), json!(paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()));
            resp.insert("ignored_globs".into(), json!(globs.into_iter().collect::<Vec<_>>()));
            (true, Some("ignored rules updated".into()))
        }
        "add_ignored" => {
            let paths = resolve_paths(&cmd.paths);
            let globs: BTreeSet<String> = cmd.globs.iter().cloned().collect();
            state.add_extra_ignore(paths, globs);
            let extra = state.extra_ignore();
            resp.insert("ignored_paths".into(), json!(extra.paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()));
            resp.insert("ignored_globs".into(), json!(extra.globs.into_iter().collect::<Vec<_>>()));
            (true, Some("ignored rules added".into()))
        }
        "clear_ignored" => {
            state.clear_extra_ignore();
            resp.insert("ignored_paths".into(), json!(Vec::<String>::new()));
            resp.insert("ignored_globs".into(), json!(Vec::<String>::new()));
            (true, Some("ignored rules cleared".into()))
        }
        "get_ignored" => {
            let config = state.config();
            let extra = state.extra_ignore();
            resp.insert("base_ignored_paths".into(), json!(config.ignore_paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()));
            resp.insert("base_ignored_globs".into(), json!(config.ignore_globs.iter().cloned().collect::<Vec<_>>()));
            resp.insert("extra_ignored_paths".into(), json!(extra.paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()));
            resp.insert("extra_ignored_globs".into(), json!(extra.globs.into_iter().collect::<Vec<_>>()));
            (true, Some("ignored rules returned".into()))
        }
        "rotate_logs" => rotate_logs(log_sink, resp),
        _ => (false, Some("unknown op".into())),
    }
}

fn rotate_logs(log_sink: &LogSink, resp: &mut Map<String, Value>) -> (bool, Option<String>) {
    let ts_suffix = rotate_timestamp_suffix();
    match log_sink.rotate(&ts_suffix) {
        Ok(rotated) => {
            let mut rotated_obj = Map::new();
            if let Some(log) = rotated.log {
                rotated_obj.insert("log".into(), json!(log.display().to_string()));
            }
            if let Some(jsonl) = rotated.jsonl {
                rotated_obj.insert("jsonl".into(), json!(jsonl.display().to_string()));
            }
            resp.insert("rotated".into(), Value::Object(rotated_obj));
            (true, Some("logs rotated".into()))
        }
        Err(err) => (false, Some(format!("rotate failed: {err}"))),
    }
}

fn rotate_timestamp_suffix() -> String {
    // `YYYYMMDD-HHMMSS`, local rotation-file naming only; not a
    // reported timestamp, so seconds resolution is enough.
    let now = agent_core::time::now_iso8601();
    now.chars().filter(|c| c.is_ascii_digit()).take(14).collect()
}

fn resolve_paths(raw: &[String]) -> BTreeSet<PathBuf> {
    raw.iter()
        .map(|p| {
            let path = PathBuf::from(p);
            if path.is_absolute() {
                path
            } else {
                std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
            }
        })
        .collect()
}

fn record_invalid(state: &AgentState, path: &Path, invalid_dir: &Path, name: &str, error_kind: &str, msg: &str) {
    let retries = state.command_retry_increment(name);
    if retries < 3 {
        return;
    }

    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| name.to_string());
    let err = json!({
        "ts": now_iso8601(),
        "filename": name,
        "error": error_kind,
        "msg": msg,
    });
    let err_path = invalid_dir.join(format!("{stem}.error.json"));
    if let Err(e) = write_json_atomic(&err_path, &err) {
        tracing::error!(error = %e, "failed to write command error report");
    }

    let dest = invalid_dir.join(name);
    if std::fs::rename(path, &dest).is_err() {
        let _ = std::fs::remove_file(path);
    }
    state.command_retry_reset(name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::{EventKind, RuntimeConfig};
    use std::collections::BTreeSet;

    fn test_config(dir: &Path) -> RuntimeConfig {
        RuntimeConfig {
            watch_path: dir.to_path_buf(),
            recursive: true,
            ignore_paths: BTreeSet::new(),
            ignore_globs: BTreeSet::new(),
            feature_console_log: false,
            feature_text_log: false,
            feature_jsonl_log: true,
            feature_status: true,
            event_types: [EventKind::Created, EventKind::Modified, EventKind::Deleted].into(),
            log_path: dir.join("events.log"),
            jsonl_path: dir.join("events.jsonl"),
            status_path: dir.join("status.json"),
            status_interval_secs: 5.0,
            commands_enabled: true,
            inbox_dir: dir.join("commands/inbox"),
            outbox_dir: dir.join("commands/outbox"),
            command_poll_interval_secs: 0.1,
            debounce_ms: 0.0,
            aggregate_window_ms: 0.0,
            aggregate_include_debounced: false,
        }
    }

    fn test_log_sink(dir: &Path) -> LogSink {
        LogSink::new(&dir.join("events.log"), &dir.join("events.jsonl"), true, true)
    }

    fn response_for(outbox: &Path, id: &str) -> Value {
        let text = std::fs::read_to_string(outbox.join(format!("{id}.response.json"))).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn ping_returns_pong_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        let processed = dir.path().join("processed");
        let invalid = dir.path().join("invalid");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::create_dir_all(&invalid).unwrap();
        std::fs::create_dir_all(&outbox).unwrap();

        let cmd_path = dir.path().join("ping.json");
        std::fs::write(&cmd_path, r#"{"id":"ping","op":"ping"}"#).unwrap();

        handle_command_file(&state, &log_sink, &cmd_path, &processed, &invalid, &outbox);

        let resp = response_for(&outbox, "ping");
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["pong"], true);
        assert!(resp["status"]["alive"].as_bool().unwrap());
        assert!(processed.join("ping.json.done").exists());
        assert!(!cmd_path.exists());
    }

    #[test]
    fn pause_then_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        let processed = dir.path().join("processed");
        let invalid = dir.path().join("invalid");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::create_dir_all(&invalid).unwrap();
        std::fs::create_dir_all(&outbox).unwrap();

        let pause_path = dir.path().join("p1.json");
        std::fs::write(&pause_path, r#"{"id":"p1","op":"pause"}"#).unwrap();
        handle_command_file(&state, &log_sink, &pause_path, &processed, &invalid, &outbox);
        assert!(state.is_paused());
        assert_eq!(response_for(&outbox, "p1")["msg"], "paused");

        let resume_path = dir.path().join("p2.json");
        std::fs::write(&resume_path, r#"{"id":"p2","op":"resume"}"#).unwrap();
        handle_command_file(&state, &log_sink, &resume_path, &processed, &invalid, &outbox);
        assert!(!state.is_paused());
        assert_eq!(response_for(&outbox, "p2")["msg"], "resumed");
    }

    #[test]
    fn ignore_commands_set_add_clear_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        let processed = dir.path().join("processed");
        let invalid = dir.path().join("invalid");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::create_dir_all(&invalid).unwrap();
        std::fs::create_dir_all(&outbox).unwrap();

        let set_path = dir.path().join("c1.json");
        std::fs::write(&set_path, format!(r#"{{"id":"c1","op":"set_ignored","globs":["*.tmp"],"paths":["{}"]}}"#, dir.path().join("x").display())).unwrap();
        handle_command_file(&state, &log_sink, &set_path, &processed, &invalid, &outbox);
        assert_eq!(state.extra_ignore().globs.len(), 1);

        let add_path = dir.path().join("c2.json");
        std::fs::write(&add_path, r#"{"id":"c2","op":"add_ignored","globs":["*.bak"]}"#).unwrap();
        handle_command_file(&state, &log_sink, &add_path, &processed, &invalid, &outbox);
        assert_eq!(state.extra_ignore().globs.len(), 2);

        let get_path = dir.path().join("c3.json");
        std::fs::write(&get_path, r#"{"id":"c3","op":"get_ignored"}"#).unwrap();
        handle_command_file(&state, &log_sink, &get_path, &processed, &invalid, &outbox);
        let resp = response_for(&outbox, "c3");
        assert_eq!(resp["extra_ignored_globs"].as_array().unwrap().len(), 2);

        let clear_path = dir.path().join("c4.json");
        std::fs::write(&clear_path, r#"{"id":"c4","op":"clear_ignored"}"#).unwrap();
        handle_command_file(&state, &log_sink, &clear_path, &processed, &invalid, &outbox);
        assert!(state.extra_ignore().globs.is_empty());
    }

    #[test]
    fn unknown_op_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        let processed = dir.path().join("processed");
        let invalid = dir.path().join("invalid");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::create_dir_all(&invalid).unwrap();
        std::fs::create_dir_all(&outbox).unwrap();

        let path = dir.path().join("u1.json");
        std::fs::write(&path, r#"{"id":"u1","op":"levitate"}"#).unwrap();
        handle_command_file(&state, &log_sink, &path, &processed, &invalid, &outbox);

        let resp = response_for(&outbox, "u1");
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["msg"], "unknown op");
    }

    #[test]
    fn rotate_logs_renames_existing_files_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        log_sink.write_text_event(std::time::SystemTime::now(), EventKind::Created, "a.txt").unwrap();
        let processed = dir.path().join("processed");
        let invalid = dir.path().join("invalid");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::create_dir_all(&invalid).unwrap();
        std::fs::create_dir_all(&outbox).unwrap();

        let path = dir.path().join("r1.json");
        std::fs::write(&path, r#"{"id":"r1","op":"rotate_logs"}"#).unwrap();
        handle_command_file(&state, &log_sink, &path, &processed, &invalid, &outbox);

        let resp = response_for(&outbox, "r1");
        assert_eq!(resp["ok"], true);
        assert!(resp["rotated"]["log"].as_str().is_some());
    }

    #[test]
    fn malformed_json_is_quarantined_after_three_retries() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        let processed = dir.path().join("processed");
        let invalid = dir.path().join("invalid");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::create_dir_all(&invalid).unwrap();
        std::fs::create_dir_all(&outbox).unwrap();

        for _ in 0..2 {
            let path = dir.path().join("bad.json");
            std::fs::write(&path, "{").unwrap();
            handle_command_file(&state, &log_sink, &path, &processed, &invalid, &outbox);
            // First two failed parses are retried in place, not quarantined.
            assert!(!invalid.join("bad.json").exists());
        }

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();
        handle_command_file(&state, &log_sink, &path, &processed, &invalid, &outbox);

        assert!(invalid.join("bad.json").exists());
        assert!(invalid.join("bad.error.json").exists());
        assert!(!path.exists());
    }

    #[test]
    fn unreadable_file_is_quarantined_after_three_retries() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        let processed = dir.path().join("processed");
        let invalid = dir.path().join("invalid");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::create_dir_all(&invalid).unwrap();
        std::fs::create_dir_all(&outbox).unwrap();

        // A directory at the command path can never be decoded as
        // UTF-8 JSON text, exercising the read-failure arm the same
        // way a genuine non-UTF-8 byte sequence would.
        let path = dir.path().join("unreadable.json");
        std::fs::create_dir_all(&path).unwrap();

        for _ in 0..2 {
            handle_command_file(&state, &log_sink, &path, &processed, &invalid, &outbox);
            assert!(!invalid.join("unreadable.json").exists());
        }

        handle_command_file(&state, &log_sink, &path, &processed, &invalid, &outbox);

        assert!(invalid.join("unreadable.json").exists());
        assert!(invalid.join("unreadable.error.json").exists());
        assert!(!path.exists());
    }

    #[test]
    fn process_once_skips_files_younger_than_age_gate() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(test_config(dir.path()));
        let log_sink = test_log_sink(dir.path());
        let inbox = dir.path().join("inbox");
        let outbox = dir.path().join("outbox");
        std::fs::create_dir_all(&inbox).unwrap();

        std::fs::write(inbox.join("fresh.json"), r#"{"id":"fresh","op":"ping"}"#).unwrap();
        process_once(&state, &log_sink, &inbox, &outbox).unwrap();
        // Written just now: the 50ms age gate defers it to the next cycle.
        assert!(inbox.join("fresh.json").exists());
        assert!(!outbox.join("fresh.response.json").exists());

        std::thread::sleep(Duration::from_millis(60));
        process_once(&state, &log_sink, &inbox, &outbox).unwrap();
        assert!(!inbox.join("fresh.json").exists());
        assert!(outbox.join("fresh.response.json").exists());
    }
}
