//! Long-running watch builds and their "first build ready" latch.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::SessionError;
use crate::latch::OneShotLatch;
use crate::session::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineKind {
    /// The UI bundle served live to the app's views.
    Renderer,
    Preload,
    Main,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Renderer => "renderer",
            PipelineKind::Preload => "preload",
            PipelineKind::Main => "main",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backend needs to start one watch build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub kind: PipelineKind,
    pub root: PathBuf,
    pub entries: Vec<PathBuf>,
    /// Compiled output. `None` for the renderer, which serves its bundle.
    pub output: Option<PathBuf>,
    pub externals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// A build finished. `changed` is the file that triggered it, when known.
    Complete { changed: Option<PathBuf> },
    Error { message: String },
}

/// Closes the backend's watch build.
pub trait WatchControl: Send + Sync {
    fn close(&self);
}

/// Pushes a full reload to clients connected to the renderer.
pub trait LiveReload: Send + Sync {
    fn broadcast_full_reload(&self);
}

/// A running watch build as handed out by a [`BuildBackend`].
pub struct WatchBuild {
    pub events: mpsc::UnboundedReceiver<BuildEvent>,
    pub control: Box<dyn WatchControl>,
    pub live_reload: Option<Arc<dyn LiveReload>>,
}

#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Start watching. Resolves once the watch is set up, not after the first build.
    async fn start_watch(&self, spec: &PipelineSpec) -> miette::Result<WatchBuild>;
}

/// Outcome of a pipeline's first build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialBuild {
    Ready,
    Failed(String),
}

pub struct PipelineWatcher;

impl PipelineWatcher {
    /// Start `spec` on `backend` and route its later rebuilds to `events`.
    pub async fn start(
        backend: &dyn BuildBackend,
        spec: &PipelineSpec,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> miette::Result<PipelineHandle> {
        let build = backend.start_watch(spec).await?;
        let kind = spec.kind;
        let latch = OneShotLatch::new(format!("{kind} initial build"));
        let last_reason = Arc::new(Mutex::new(None));

        let task = tokio::spawn(forward_events(
            kind,
            build.events,
            latch.clone(),
            Arc::clone(&last_reason),
            events,
        ));
        debug!(pipeline = %kind, "watch build started");

        Ok(PipelineHandle {
            kind,
            latch,
            control: Mutex::new(Some(build.control)),
            live_reload: build.live_reload,
            last_reason,
            task,
        })
    }
}

async fn forward_events(
    kind: PipelineKind,
    mut builds: mpsc::UnboundedReceiver<BuildEvent>,
    latch: OneShotLatch<InitialBuild>,
    last_reason: Arc<Mutex<Option<PathBuf>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(event) = builds.recv().await {
        match event {
            BuildEvent::Complete { changed } => {
                if latch.signal(InitialBuild::Ready) {
                    info!(pipeline = %kind, "initial build ready");
                    continue;
                }
                if let Some(path) = &changed {
                    *last_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(path.clone());
                }
                debug!(pipeline = %kind, reason = ?changed, "rebuilt");
                let rebuilt = SessionEvent::PipelineRebuilt {
                    pipeline: kind,
                    reason: changed,
                };
                if events.send(rebuilt).is_err() {
                    break;
                }
            }
            BuildEvent::Error { message } => {
                if latch.signal(InitialBuild::Failed(message.clone())) {
                    error!(pipeline = %kind, "initial build failed: {message}");
                } else {
                    error!(pipeline = %kind, "rebuild failed, keeping previous output: {message}");
                }
            }
        }
    }
    latch.signal(InitialBuild::Failed(
        "watch build ended before its first build completed".to_string(),
    ));
}

/// One started pipeline. Closing it is idempotent.
pub struct PipelineHandle {
    kind: PipelineKind,
    latch: OneShotLatch<InitialBuild>,
    control: Mutex<Option<Box<dyn WatchControl>>>,
    live_reload: Option<Arc<dyn LiveReload>>,
    last_reason: Arc<Mutex<Option<PathBuf>>>,
    task: JoinHandle<()>,
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("kind", &self.kind)
            .field("latch", &self.latch)
            .field("last_reason", &self.last_rebuild_reason())
            .finish_non_exhaustive()
    }
}

impl PipelineHandle {
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.latch.value() == Some(InitialBuild::Ready)
    }

    pub async fn wait_initial_build(&self, timeout: Duration) -> Result<(), SessionError> {
        match self.latch.wait_timeout(timeout).await {
            Ok(InitialBuild::Ready) => Ok(()),
            Ok(InitialBuild::Failed(message)) => Err(SessionError::InitialBuildFailed {
                pipeline: self.kind,
                message,
            }),
            Err(source) => Err(SessionError::InitialBuildTimeout {
                pipeline: self.kind,
                source,
            }),
        }
    }

    pub fn last_rebuild_reason(&self) -> Option<PathBuf> {
        self.last_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `false` when the backend offers no live reload for this pipeline.
    pub fn broadcast_full_reload(&self) -> bool {
        match &self.live_reload {
            Some(live_reload) => {
                debug!(pipeline = %self.kind, "broadcasting full reload");
                live_reload.broadcast_full_reload();
                true
            }
            None => false,
        }
    }

    pub fn stop(&self) {
        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(control) = control {
            debug!(pipeline = %self.kind, "closing watch build");
            control.close();
        }
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
