//! Composition root of a dev session.
//!
//! Startup is strictly ordered: config, codegen, renderer, externals, preload,
//! main, both initial builds, process launch, config watch. Every component
//! installed along the way is torn down by [`SessionController::stop`], which
//! runs at most once no matter how many times or from where it is called.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use miette::{Result, WrapErr};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::coalescer::RestartCoalescer;
use crate::config_watcher::ConfigWatcher;
use crate::error::SessionError;
use crate::options::SessionOptions;
use crate::pipeline::{PipelineHandle, PipelineKind, PipelineSpec, PipelineWatcher};
use crate::services::{LoadedConfig, Services};
use crate::session::{Session, SessionEvent, SessionFlags};
use crate::supervisor::ProcessSupervisor;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// `stop()` was called.
    Stopped,
    /// The app process exited with this non-zero code.
    Crashed(i32),
    /// A config source changed; the caller should start a new session.
    Reload,
}

type RestartCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Parts {
    session: Option<Session>,
    renderer: Option<Arc<PipelineHandle>>,
    preload: Option<Arc<PipelineHandle>>,
    main: Option<Arc<PipelineHandle>>,
    supervisor: Option<ProcessSupervisor>,
    timers: Timers,
}

/// Owners of the restart and reload timers. Moved aside on teardown so their
/// state can still be inspected once the session is gone.
#[derive(Default)]
struct Timers {
    coalescer: Option<RestartCoalescer>,
    config_watcher: Option<ConfigWatcher>,
}

impl Timers {
    fn cancel(&self) {
        if let Some(coalescer) = &self.coalescer {
            coalescer.cancel();
        }
        if let Some(config_watcher) = &self.config_watcher {
            config_watcher.stop();
        }
    }

    fn is_pending(&self) -> bool {
        self.coalescer
            .as_ref()
            .is_some_and(RestartCoalescer::is_debouncing)
            || self
                .config_watcher
                .as_ref()
                .is_some_and(ConfigWatcher::is_pending)
    }
}

impl Parts {
    fn pipeline(&self, kind: PipelineKind) -> Option<&Arc<PipelineHandle>> {
        match kind {
            PipelineKind::Renderer => self.renderer.as_ref(),
            PipelineKind::Preload => self.preload.as_ref(),
            PipelineKind::Main => self.main.as_ref(),
        }
    }

    fn pipeline_slot(&mut self, kind: PipelineKind) -> &mut Option<Arc<PipelineHandle>> {
        match kind {
            PipelineKind::Renderer => &mut self.renderer,
            PipelineKind::Preload => &mut self.preload,
            PipelineKind::Main => &mut self.main,
        }
    }
}

struct ControllerInner {
    config_path: PathBuf,
    options: SessionOptions,
    renderer_only: bool,
    services: Services,
    started: AtomicBool,
    flags: Arc<SessionFlags>,
    parts: Mutex<Parts>,
    retired: Mutex<Timers>,
    on_restart: Mutex<Option<RestartCallback>>,
    exit: watch::Sender<Option<SessionExit>>,
    token: CancellationToken,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl ControllerInner {
    fn lock_parts(&self) -> MutexGuard<'_, Parts> {
        self.parts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_retired(&self) -> MutexGuard<'_, Timers> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a freshly started component, or undo it if the session was
    /// stopped while it was starting.
    fn install(
        &self,
        set: impl FnOnce(&mut Parts),
        undo: impl FnOnce(),
    ) -> std::result::Result<(), SessionError> {
        let mut parts = self.lock_parts();
        if self.flags.is_cleaned_up() {
            drop(parts);
            undo();
            return Err(SessionError::StoppedDuringStartup);
        }
        set(&mut parts);
        Ok(())
    }

    /// Release every component. Returns `true` only for the call that did it.
    fn teardown(&self) -> bool {
        if !self.flags.begin_teardown() {
            return false;
        }
        self.token.cancel();
        let parts = std::mem::take(&mut *self.lock_parts());

        parts.timers.cancel();
        for handle in [&parts.main, &parts.preload, &parts.renderer]
            .into_iter()
            .flatten()
        {
            handle.stop();
        }
        if let Some(supervisor) = &parts.supervisor {
            supervisor.stop();
        }
        *self.lock_retired() = parts.timers;
        info!("session stopped");
        true
    }

    /// Record how the session ended. Only the first outcome is kept.
    fn finish(&self, outcome: SessionExit) -> bool {
        self.exit.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(outcome);
            true
        })
    }

    fn route(&self, event: SessionEvent) {
        match event {
            SessionEvent::PipelineRebuilt {
                pipeline: PipelineKind::Main,
                reason,
            } => {
                if self.flags.is_shutting_down() {
                    return;
                }
                let coalescer = self.lock_parts().timers.coalescer.clone();
                match coalescer {
                    Some(coalescer) => coalescer.notify(reason),
                    None => debug!("main rebuilt before the app process started"),
                }
            }
            SessionEvent::PipelineRebuilt { pipeline, .. } => {
                let renderer = self.lock_parts().renderer.clone();
                if let Some(renderer) = renderer
                    && !renderer.broadcast_full_reload()
                {
                    debug!(pipeline = %pipeline, "renderer has no live reload");
                }
            }
            SessionEvent::ProcessCrashed { code } => {
                error!(code, "app process crashed, stopping session");
                self.teardown();
                self.finish(SessionExit::Crashed(code));
            }
            SessionEvent::ConfigChanged { path } => {
                info!(path = %path.display(), "restarting session");
                self.teardown();
                if self.finish(SessionExit::Reload) {
                    let callback = self
                        .on_restart
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            }
        }
    }
}

async fn run_events(
    inner: Weak<ControllerInner>,
    token: CancellationToken,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        inner.route(event);
    }
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        config_path: impl Into<PathBuf>,
        options: SessionOptions,
        renderer_only: bool,
        services: Services,
    ) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            inner: Arc::new(ControllerInner {
                config_path: config_path.into(),
                options,
                renderer_only,
                services,
                started: AtomicBool::new(false),
                flags: SessionFlags::new(),
                parts: Mutex::new(Parts::default()),
                retired: Mutex::new(Timers::default()),
                on_restart: Mutex::new(None),
                exit,
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    /// Run the ordered startup sequence. Any error is fatal for this session;
    /// the caller is expected to `stop()` it and exit.
    #[instrument(skip(self), fields(config = %self.inner.config_path.display()))]
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted.into());
        }
        let inner = &self.inner;
        let (events, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_events(
            Arc::downgrade(inner),
            inner.token.clone(),
            events_rx,
        ));

        let loaded = inner
            .services
            .loader
            .load(&inner.config_path)
            .await
            .wrap_err("loading config")?;
        let session = Session::from_loaded(&loaded, inner.renderer_only);
        inner.install(|parts| parts.session = Some(session), || ())?;

        inner
            .services
            .codegen
            .generate(&loaded)
            .await
            .wrap_err("running codegen")?;

        if loaded.config.has_views() {
            let spec = PipelineSpec {
                kind: PipelineKind::Renderer,
                root: loaded.root.clone(),
                entries: loaded
                    .config
                    .views
                    .iter()
                    .map(|view| loaded.resolve(&view.entry))
                    .collect(),
                output: None,
                externals: Vec::new(),
            };
            self.start_pipeline(&spec, &events).await?;
        }

        if inner.renderer_only {
            info!("renderer-only session started");
            return Ok(());
        }

        let externals = inner
            .services
            .externals
            .resolve(&loaded)
            .await
            .wrap_err("resolving build externals")?;

        let preload = compiled_spec(&loaded, PipelineKind::Preload, &externals.modules);
        let preload = self.start_pipeline(&preload, &events).await?;
        let main = compiled_spec(&loaded, PipelineKind::Main, &externals.modules);
        let main = self.start_pipeline(&main, &events).await?;

        // The app process loads the preload output, so preload must be ready first.
        self.wait_initial_build(&preload).await?;
        self.wait_initial_build(&main).await?;

        let supervisor = ProcessSupervisor::new(
            Arc::clone(&inner.services.launcher),
            loaded.resolve(&loaded.config.main.output),
            loaded.config.env.clone(),
            Arc::clone(&inner.flags),
            events.clone(),
            inner.options.kill_grace,
        );
        supervisor
            .launch()
            .map_err(miette::Report::new)
            .wrap_err("launching app process")?;
        let coalescer = RestartCoalescer::new(
            Arc::new(supervisor.clone()),
            inner.options.restart_debounce,
        );
        inner.install(
            |parts| {
                parts.supervisor = Some(supervisor.clone());
                parts.timers.coalescer = Some(coalescer);
            },
            || supervisor.stop(),
        )?;

        let config_watcher = ConfigWatcher::spawn(
            inner.services.watch.as_ref(),
            loaded.config_source_paths(),
            inner.options.config_debounce,
            events,
        )
        .await
        .wrap_err("watching config files")?;
        inner.install(
            |parts| parts.timers.config_watcher = Some(config_watcher),
            || (),
        )?;

        info!(app = %loaded.config.name, "session started");
        Ok(())
    }

    async fn start_pipeline(
        &self,
        spec: &PipelineSpec,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<PipelineHandle>> {
        let kind = spec.kind;
        let handle = PipelineWatcher::start(self.inner.services.backend.as_ref(), spec, events.clone())
            .await
            .wrap_err_with(|| format!("starting {kind} pipeline"))?;
        let handle = Arc::new(handle);
        self.inner.install(
            |parts| *parts.pipeline_slot(kind) = Some(Arc::clone(&handle)),
            || handle.stop(),
        )?;
        Ok(handle)
    }

    async fn wait_initial_build(&self, handle: &PipelineHandle) -> Result<()> {
        let kind = handle.kind();
        let waited = tokio::select! {
            _ = self.inner.token.cancelled() => Err(SessionError::StoppedDuringStartup),
            waited = handle.wait_initial_build(self.inner.options.initial_build_timeout) => waited,
        };
        waited
            .map_err(miette::Report::new)
            .wrap_err_with(|| format!("waiting for {kind} initial build"))
    }

    /// Tear the session down. Safe to call any number of times from anywhere.
    pub fn stop(&self) {
        self.inner.teardown();
        self.inner.finish(SessionExit::Stopped);
    }

    /// Register the callback invoked after a config change stopped the session.
    pub fn set_on_restart(&self, callback: impl Fn() + Send + Sync + 'static) {
        let previous = self
            .inner
            .on_restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(callback));
        if previous.is_some() {
            warn!("replacing previously registered restart callback");
        }
    }

    /// Resolves once the session has ended, with the reason it ended.
    pub async fn closed(&self) -> SessionExit {
        let mut rx = self.inner.exit.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(SessionExit::Stopped),
            Err(_) => SessionExit::Stopped,
        }
    }

    pub fn exit(&self) -> Option<SessionExit> {
        *self.inner.exit.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.flags.is_cleaned_up()
    }

    /// Whether a restart or reload timer is still scheduled.
    pub fn has_pending_timers(&self) -> bool {
        self.inner.lock_parts().timers.is_pending() || self.inner.lock_retired().is_pending()
    }

    /// Number of restart cycles the app process has gone through.
    pub fn restart_cycles(&self) -> u64 {
        let coalescer = self.inner.lock_parts().timers.coalescer.clone();
        coalescer
            .or_else(|| self.inner.lock_retired().coalescer.clone())
            .map_or(0, |coalescer| coalescer.cycles())
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.lock_parts().session.clone()
    }

    pub fn last_rebuild_reason(&self, kind: PipelineKind) -> Option<PathBuf> {
        self.inner
            .lock_parts()
            .pipeline(kind)
            .and_then(|handle| handle.last_rebuild_reason())
    }
}

fn compiled_spec(loaded: &LoadedConfig, kind: PipelineKind, externals: &[String]) -> PipelineSpec {
    let entry = match kind {
        PipelineKind::Main => &loaded.config.main,
        _ => &loaded.config.preload,
    };
    PipelineSpec {
        kind,
        root: loaded.root.clone(),
        entries: vec![loaded.resolve(&entry.entry)],
        output: Some(loaded.resolve(&entry.output)),
        externals: externals.to_vec(),
    }
}
