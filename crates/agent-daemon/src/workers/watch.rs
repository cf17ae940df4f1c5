//! The file system watcher bridge.
//!
//! `notify`'s callback fires synchronously from its own internal
//! thread, so this module gives it a dedicated OS thread rather than
//! trying to bridge it into the async runtime: the callback pushes raw
//! events onto a `std::sync::mpsc` channel, and a loop on that thread
//! drains the channel and calls straight into [`EventFilterPipeline`],
//! which is itself synchronous (plain file I/O, no `.await`).
//!
//! Shutdown is a plain `AtomicBool` the loop polls between
//! `recv_timeout` calls — a `tokio::sync::watch` channel can't be
//! awaited from a non-async thread, so this is the simplest thing that
//! reliably unblocks the loop without relying on channel disconnection
//! alone (which only fires once the `Watcher` itself is dropped).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use agent_core::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::pipeline::{normalize_event_path, EventFilterPipeline};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Handle to the running watcher thread.
pub struct WatchHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// How long `shutdown` waits for the watcher thread before giving up,
/// per the shutdown sequence's "join with 5s timeout" step.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

impl WatchHandle {
    /// Signals the watcher thread to stop and waits up to
    /// [`SHUTDOWN_JOIN_TIMEOUT`] for it to exit.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        let Some(join) = self.join.take() else { return };

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = join.join();
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(SHUTDOWN_JOIN_TIMEOUT).is_err() {
            tracing::warn!("watcher thread did not stop within shutdown timeout");
        }
    }
}

/// Starts watching `watch_path` on a dedicated thread, dispatching
/// every create/modify/remove event through `pipeline`.
///
/// Renames (`notify`'s `ModifyKind::Name`) and pure access events are
/// intentionally dropped before reaching the pipeline: the agent this
/// was modeled on never registered a move/rename handler either, so a
/// renamed file is silently untracked, matching that behavior exactly.
pub fn spawn(watch_path: PathBuf, recursive: bool, pipeline: Arc<EventFilterPipeline>) -> notify::Result<WatchHandle> {
    let (tx, rx) = channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;

    let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
    watcher.watch(&watch_path, mode)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let thread_shutdown = Arc::clone(&shutdown);

    let join = std::thread::Builder::new()
        .name("agent-watch".into())
        .spawn(move || {
            // Keep the watcher alive for the lifetime of the loop; it is
            // dropped (and teardown happens) when this closure returns.
            let _watcher = watcher;
            loop {
                if thread_shutdown.load(Ordering::Acquire) {
                    break;
                }
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(Ok(event)) => dispatch(&pipeline, event),
                    Ok(Err(err)) => tracing::warn!(error = %err, "watch error"),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("failed to spawn agent-watch thread");

    Ok(WatchHandle { shutdown, join: Some(join) })
}

fn dispatch(pipeline: &EventFilterPipeline, event: Event) {
    let Some(kind) = classify(&event.kind) else {
        return;
    };
    let is_dir = known_is_dir(&event.kind);
    for path in event.paths {
        let path = normalize_event_path(&path);
        let is_dir = is_dir.unwrap_or_else(|| path.is_dir());
        pipeline.handle_event(kind, &path, is_dir);
    }
}

fn classify(kind: &notify::EventKind) -> Option<EventKind> {
    use notify::event::{ModifyKind, RenameMode};
    match kind {
        notify::EventKind::Create(_) => Some(EventKind::Created),
        notify::EventKind::Remove(_) => Some(EventKind::Deleted),
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::To | RenameMode::Both)) => None,
        notify::EventKind::Modify(_) => Some(EventKind::Modified),
        notify::EventKind::Access(_) | notify::EventKind::Other | notify::EventKind::Any => None,
    }
}

/// Directory-ness the backend already tells us for create/remove
/// events, without touching the filesystem. `None` means the backend
/// didn't say (most modify events, and some platforms' create/remove
/// events), leaving the caller to fall back to an `fs::metadata` probe
/// — which for a remove event will almost always fail (the path is
/// gone) and fail open (treated as a file, not dropped), matching the
/// fail-open discipline used elsewhere in the pipeline.
fn known_is_dir(kind: &notify::EventKind) -> Option<bool> {
    use notify::event::{CreateKind, RemoveKind};
    match kind {
        notify::EventKind::Create(CreateKind::Folder) | notify::EventKind::Remove(RemoveKind::Folder) => Some(true),
        notify::EventKind::Create(CreateKind::File) | notify::EventKind::Remove(RemoveKind::File) => Some(false),
        _ => None,
    }
}
