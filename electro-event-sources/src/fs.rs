use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use watchexec::{Config, WatchedPath};
use watchexec_filterer_globset::GlobsetFilterer;

/// A change to one of the watched paths, keyed by its canonical absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    pub path: PathBuf,
}

pub struct FileWatcherConfig<'a> {
    pub paths: &'a [PathBuf],
    /// Glob patterns to ignore (e.g., "node_modules", "*.map").
    pub ignore: &'a [String],
    /// Watch directories recursively. When false, every path is treated as an
    /// individual file and only changes to exactly those files are reported.
    pub recursive: bool,
    /// Events arriving within this window after the first one are delivered
    /// as a single batch, with duplicate paths collapsed.
    pub throttle: Duration,
}

impl Default for FileWatcherConfig<'_> {
    fn default() -> Self {
        Self {
            paths: &[],
            ignore: &[],
            recursive: false,
            throttle: Duration::from_millis(50),
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Default)]
struct WatchSet {
    paths: HashSet<PathBuf>,
    recursive: bool,
}

impl WatchSet {
    fn matches(&self, path: &Path) -> bool {
        if self.recursive {
            self.paths.iter().any(|root| path.starts_with(root))
        } else {
            self.paths.contains(path)
        }
    }

    /// Directories handed to the OS watcher.
    fn watched_dirs(&self) -> Vec<WatchedPath> {
        if self.recursive {
            return self.paths.iter().map(WatchedPath::recursive).collect();
        }
        // FSEvents works at directory granularity, so single files are
        // watched through their parent and filtered afterwards.
        let parents: HashSet<&Path> = self.paths.iter().filter_map(|p| p.parent()).collect();
        parents.into_iter().map(WatchedPath::non_recursive).collect()
    }
}

/// Clone-able handle for adding and removing watched paths at runtime.
///
/// Always valid: when no watcher is running, the path set is tracked but no
/// events fire.
#[derive(Clone)]
pub struct WatcherHandle {
    set: Arc<Mutex<WatchSet>>,
    config: Option<Arc<Config>>,
}

impl WatcherHandle {
    fn with_set<R>(&self, f: impl FnOnce(&mut WatchSet) -> R) -> R {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut set);
        if let Some(config) = &self.config {
            config.pathset(set.watched_dirs());
        }
        result
    }

    /// Start reporting changes for `path`.
    pub fn watch(&self, path: &Path) {
        let path = canonical(path);
        debug!(path = %path.display(), "watching");
        self.with_set(|set| {
            set.paths.insert(path);
        });
    }

    /// Stop reporting changes for `path`. Returns whether it was watched.
    pub fn unwatch(&self, path: &Path) -> bool {
        let path = canonical(path);
        self.with_set(|set| set.paths.remove(&path))
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        let set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        set.matches(&canonical(path))
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        set.paths.iter().cloned().collect()
    }
}

/// File watcher built on watchexec's fs worker.
///
/// Only the fs worker is spawned; filtering and throttling happen in a second
/// task that forwards matching paths to `recv()`. Dropping the watcher aborts
/// both tasks and releases the OS handles.
pub struct FileWatcher {
    rx: mpsc::Receiver<FileChangeEvent>,
    // Keeps `recv()` pending instead of returning None when no task runs.
    _tx: mpsc::Sender<FileChangeEvent>,
    handle: WatcherHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl FileWatcher {
    /// Create a new file watcher.
    ///
    /// Infallible: when `paths` is empty or setup fails, `recv()` pends
    /// forever and the handle still tracks paths.
    pub async fn new(config: FileWatcherConfig<'_>, name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<FileChangeEvent>(100);

        let set = Arc::new(Mutex::new(WatchSet {
            paths: config.paths.iter().map(|p| canonical(p)).collect(),
            recursive: config.recursive,
        }));

        let idle = |set: Arc<Mutex<WatchSet>>, rx, tx| Self {
            rx,
            _tx: tx,
            handle: WatcherHandle { set, config: None },
            tasks: Vec::new(),
        };

        if config.paths.is_empty() {
            return idle(set, rx, tx);
        }

        let watch_name = name.to_owned();
        let origin = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .paths
            .iter()
            .next()
            .and_then(|p| if config.recursive { Some(p.as_path()) } else { p.parent() })
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let ignores: Vec<(String, Option<PathBuf>)> = config
            .ignore
            .iter()
            .map(|pattern| {
                if pattern.contains('/') || pattern.starts_with("**") {
                    (pattern.clone(), None)
                } else {
                    (format!("**/{pattern}"), None)
                }
            })
            .collect();

        let filterer = match GlobsetFilterer::new(
            &origin,
            std::iter::empty::<(String, Option<PathBuf>)>(),
            ignores,
            std::iter::empty::<PathBuf>(),
            std::iter::empty(),
            std::iter::empty::<std::ffi::OsString>(),
        )
        .await
        {
            Ok(f) => Arc::new(f),
            Err(e) => {
                warn!("Failed to create filterer for {}: {}", watch_name, e);
                return idle(set, rx, tx);
            }
        };

        let wx_config = Arc::new(Config::default());
        let handle = WatcherHandle {
            set: set.clone(),
            config: Some(wx_config.clone()),
        };
        // Applies the initial path set to the watchexec config.
        handle.with_set(|_| ());

        info!(
            "File watcher started for {} watching {:?}",
            watch_name,
            handle.watched_paths()
        );

        let (ev_s, ev_r) = async_priority_channel::bounded(4096);
        let (er_s, _er_r) = mpsc::channel(64);

        let fs_name = watch_name.clone();
        let fs_task = tokio::spawn(async move {
            if let Err(e) = watchexec::sources::fs::worker(wx_config, er_s, ev_s).await {
                warn!("fs worker for {} stopped: {}", fs_name, e);
            }
        });

        let throttle = config.throttle;
        let forward_tx = tx.clone();
        let forward_task = tokio::spawn(async move {
            use watchexec::filter::Filterer;

            while let Ok(first) = ev_r.recv().await {
                let mut batch = vec![first];
                let deadline = Instant::now() + throttle;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match tokio::time::timeout(remaining, ev_r.recv()).await {
                        Ok(Ok(next)) => batch.push(next),
                        _ => break,
                    }
                }

                let mut changed: Vec<PathBuf> = Vec::new();
                for (event, priority) in &batch {
                    if !filterer.check_event(event, *priority).unwrap_or(true) {
                        continue;
                    }
                    for (path, _) in event.paths() {
                        let path = canonical(path);
                        if !changed.contains(&path) {
                            changed.push(path);
                        }
                    }
                }

                let matching: Vec<PathBuf> = {
                    let set = set.lock().unwrap_or_else(PoisonError::into_inner);
                    changed.into_iter().filter(|p| set.matches(p)).collect()
                };
                for path in matching {
                    debug!(watcher = %watch_name, path = %path.display(), "file changed");
                    let _ = forward_tx.try_send(FileChangeEvent { path });
                }
            }
        });

        // Let the spawned tasks start the OS watcher before the caller's next
        // await point, so early writes are not missed on a current-thread runtime.
        tokio::task::yield_now().await;

        Self {
            rx,
            _tx: tx,
            handle,
            tasks: vec![fs_task, forward_task],
        }
    }

    pub fn handle(&self) -> WatcherHandle {
        self.handle.clone()
    }

    pub async fn recv(&mut self) -> Option<FileChangeEvent> {
        self.rx.recv().await
    }
}
