//! Filesystem watcher feeding the scheduler.
//!
//! Watches each registered module directory (for configuration changes) and
//! the datadir artifacts inside it (for manifest and plugin-lock changes).
//! The underlying OS facility reports more than byte changes, so events pass
//! through two filters before any work is enqueued: an event-kind filter
//! that drops pure metadata events, and a content fingerprint that drops
//! writes which did not change any bytes.
//!
//! Artifact paths often do not exist yet when a module is registered; those
//! are parked as pending and picked up once events show their parent
//! directories coming into existence.

use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, event::ModifyKind};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    datadir::{self, Artifact, DataDirSummary},
    error::{EngineError, Result},
    module::{Module, OpKind},
    registry::ModuleRegistry,
    scheduler::Scheduler,
    syntax::is_ignored_file,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct WatchState {
    fs_watcher: Option<RecommendedWatcher>,
    watched: HashSet<PathBuf>,
    pending: HashSet<PathBuf>,
    fingerprints: HashMap<PathBuf, blake3::Hash>,
}

impl WatchState {
    /// Watch `path` if it exists, otherwise park it as pending and anchor a
    /// watch on its deepest existing ancestor so we learn when it appears.
    fn watch_or_defer(&mut self, path: &Path) {
        if self.watched.contains(path) {
            return;
        }
        if path.exists() {
            self.watch(path);
            return;
        }

        trace!(path = %path.display(), "deferring watch for missing path");
        self.pending.insert(path.to_path_buf());
        if let Some(anchor) = deepest_existing_ancestor(path) {
            self.watch(&anchor);
        }
    }

    fn watch(&mut self, path: &Path) {
        if self.watched.contains(path) {
            return;
        }
        let Some(fs_watcher) = self.fs_watcher.as_mut() else {
            return;
        };
        match fs_watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                trace!(path = %path.display(), "watching path");
                self.watched.insert(path.to_path_buf());
            }
            Err(err) => {
                debug!(path = %path.display(), %err, "failed to watch path");
            }
        }
    }
}

fn deepest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
}

/// Watches module directories and datadir artifacts, translating change
/// events into scheduler enqueues.
pub struct ModuleWatcher {
    registry: Arc<ModuleRegistry>,
    scheduler: Scheduler,
    state: Arc<Mutex<WatchState>>,
    events: Mutex<Option<mpsc::Receiver<Event>>>,
    started: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ModuleWatcher {
    pub(crate) fn new(registry: Arc<ModuleRegistry>, scheduler: Scheduler) -> Result<Self> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let fs_watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) if is_content_event(&event.kind) => {
                    // the engine tolerates dropped events under burst; the
                    // next write produces another one
                    let _ = tx.blocking_send(event);
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "watch error"),
            }
        })
        .map_err(|err| EngineError::Io {
            path: PathBuf::new(),
            source: Arc::new(io::Error::other(err)),
        })?;

        Ok(Self {
            registry,
            scheduler,
            state: Arc::new(Mutex::new(WatchState {
                fs_watcher: Some(fs_watcher),
                watched: HashSet::new(),
                pending: HashSet::new(),
                fingerprints: HashMap::new(),
            })),
            events: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Begin watching a module: its directory for configuration changes,
    /// the artifacts present in `summary` for datadir changes, and every
    /// other artifact candidate as a deferred watch.
    pub async fn add_module(&self, module: &Module, summary: &DataDirSummary) {
        let module_path = module.path().as_path().to_path_buf();

        let mut to_prime = Vec::new();
        {
            let mut state = self.state.lock();
            state.watch_or_defer(&module_path);
            for path in summary
                .module_manifest_path
                .iter()
                .chain(summary.plugin_lock_file_path.iter())
            {
                state.watch_or_defer(path);
                to_prime.push(path.clone());
            }
            for candidate in datadir::paths_to_watch(&module_path) {
                state.watch_or_defer(&candidate);
            }
        }

        // prime fingerprints for files we can already read, so later
        // events that change no bytes are dropped
        if let Ok(mut entries) = tokio::fs::read_dir(&module_path).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(".tf") && !is_ignored_file(name) {
                    to_prime.push(module_path.join(name));
                }
            }
        }
        for path in to_prime {
            if let Ok(bytes) = tokio::fs::read(&path).await {
                let fingerprint = blake3::hash(&bytes);
                self.state
                    .lock()
                    .fingerprints
                    .entry(path)
                    .or_insert(fingerprint);
            }
        }
    }

    /// Start the event dispatch loop. Calling twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("watcher already started");
            return;
        }
        let Some(events) = self.events.lock().take() else {
            return;
        };

        debug!("watching for changes");
        let registry = Arc::clone(&self.registry);
        let scheduler = self.scheduler.clone();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(run(registry, scheduler, state, events, cancel));
        *self.task.lock() = Some(task);
    }

    /// Stop the dispatch loop and release the OS watcher. A no-op when the
    /// watcher was never started. The watcher is not restartable.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        // dropping the OS watcher releases its resources
        self.state.lock().fs_watcher.take();
        debug!("watcher stopped");
    }
}

/// Only events that can change file content survive the first filter.
fn is_content_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

async fn run(
    registry: Arc<ModuleRegistry>,
    scheduler: Scheduler,
    state: Arc<Mutex<WatchState>>,
    mut events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(&registry, &scheduler, &state, event).await;
            }
        }
    }
    debug!("watcher dispatch loop stopped");
}

async fn handle_event(
    registry: &Arc<ModuleRegistry>,
    scheduler: &Scheduler,
    state: &Arc<Mutex<WatchState>>,
    event: Event,
) {
    trace!(kind = ?event.kind, paths = ?event.paths, "filesystem event");

    // some pending artifact may have just come into existence
    let mut changed = promote_pending(state).await;

    let removed = matches!(event.kind, EventKind::Remove(_));
    for path in event.paths {
        if content_changed(state, &path, removed).await {
            changed.push(path);
        }
    }

    for path in changed {
        for (module, kind) in map_to_operations(registry, &path) {
            scheduler.enqueue(module, kind);
        }
    }
}

/// Watch pending paths that now exist and report them as changed so their
/// creation is processed like any other create event.
async fn promote_pending(state: &Arc<Mutex<WatchState>>) -> Vec<PathBuf> {
    let pending: Vec<PathBuf> = state.lock().pending.iter().cloned().collect();
    if pending.is_empty() {
        return Vec::new();
    }

    let mut promoted = Vec::new();
    for path in pending {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            promoted.push(path);
        } else {
            // re-anchor: a deeper ancestor may exist now
            let anchor = deepest_existing_ancestor(&path);
            if let Some(anchor) = anchor {
                state.lock().watch(&anchor);
            }
        }
    }

    let mut changed = Vec::new();
    if !promoted.is_empty() {
        let mut guard = state.lock();
        for path in promoted {
            guard.pending.remove(&path);
            guard.watch(&path);
            changed.push(path);
        }
    }
    changed
}

/// Second filter: drop events whose target bytes did not actually change.
async fn content_changed(state: &Arc<Mutex<WatchState>>, path: &Path, removed: bool) -> bool {
    if removed {
        state.lock().fingerprints.remove(path);
        return true;
    }

    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let fingerprint = blake3::hash(&bytes);
            let mut guard = state.lock();
            if guard.fingerprints.get(path) == Some(&fingerprint) {
                trace!(path = %path.display(), "dropping no-op event");
                false
            } else {
                guard.fingerprints.insert(path.to_path_buf(), fingerprint);
                true
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // the file vanished between the event and the read
            state.lock().fingerprints.remove(path);
            true
        }
        Err(err) if err.kind() == io::ErrorKind::IsADirectory => {
            // directory events carry no content; mapping ignores them but
            // they still drive pending promotion
            false
        }
        Err(err) => {
            debug!(path = %path.display(), %err, "failed to fingerprint; propagating");
            true
        }
    }
}

/// Map an event path to the operations it invalidates. Paths that belong to
/// no registered module map to nothing.
fn map_to_operations(
    registry: &Arc<ModuleRegistry>,
    path: &Path,
) -> Vec<(Arc<Module>, OpKind)> {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if name.ends_with(".tf") && !is_ignored_file(name) {
            let Some(parent) = path.parent() else {
                return Vec::new();
            };
            return match registry.by_path(parent) {
                Ok(module) => vec![(module, OpKind::ParseConfiguration)],
                Err(_) => Vec::new(),
            };
        }
    }

    if let Some((module_path, artifact)) = datadir::module_path(path) {
        if let Ok(module) = registry.by_path(module_path.as_path()) {
            return match artifact {
                Artifact::ModuleManifest => vec![(module, OpKind::ParseModuleManifest)],
                Artifact::PluginLock => vec![
                    (Arc::clone(&module), OpKind::GetVersion),
                    (module, OpKind::ObtainSchema),
                ],
            };
        }
    }

    Vec::new()
}
