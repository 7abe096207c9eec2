#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use electro_session::{
    AppConfig, BuildBackend, BuildEvent, CodeGenerator, ConfigLoader, EntryConfig, ExitReporter,
    Externals, ExternalsResolver, FileWatchProvider, LaunchError, LiveReload, LoadedConfig,
    ManagedProcess, PathWatch, PipelineKind, PipelineSpec, ProcessLauncher, ProcessSignaller,
    Services, SessionController, SessionOptions, ViewConfig, WatchBuild, WatchControl,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const CONFIG_PATH: &str = "/app/electro.config.ts";
pub const MAIN_OUTPUT: &str = "/app/out/main/index.js";

/// Ordered record of every collaborator call.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub fn loaded_config(with_views: bool) -> LoadedConfig {
    let views = if with_views {
        vec![ViewConfig {
            name: "main".into(),
            entry: "src/views/main/index.html".into(),
            config: None,
        }]
    } else {
        Vec::new()
    };
    LoadedConfig {
        config: AppConfig {
            name: "app".into(),
            main: EntryConfig {
                entry: "src/main/index.ts".into(),
                output: "out/main/index.js".into(),
            },
            preload: EntryConfig {
                entry: "src/preload/index.ts".into(),
                output: "out/preload/index.js".into(),
            },
            views,
            out_dir: "out".into(),
            env: HashMap::new(),
        },
        config_path: "electro.config.ts".into(),
        root: "/app".into(),
    }
}

pub struct FakeLoader {
    pub journal: Journal,
    pub loaded: LoadedConfig,
}

#[async_trait]
impl ConfigLoader for FakeLoader {
    async fn load(&self, _path: &Path) -> miette::Result<LoadedConfig> {
        self.journal.push("load config");
        Ok(self.loaded.clone())
    }
}

pub struct FakeCodegen {
    pub journal: Journal,
    pub fail: bool,
}

#[async_trait]
impl CodeGenerator for FakeCodegen {
    async fn generate(&self, _config: &LoadedConfig) -> miette::Result<()> {
        self.journal.push("codegen");
        if self.fail {
            miette::bail!("route manifest is invalid");
        }
        Ok(())
    }
}

pub struct FakeExternals {
    pub journal: Journal,
}

#[async_trait]
impl ExternalsResolver for FakeExternals {
    async fn resolve(&self, _config: &LoadedConfig) -> miette::Result<Externals> {
        self.journal.push("resolve externals");
        Ok(Externals {
            modules: vec!["sqlite3".into()],
        })
    }
}

/// How a scripted pipeline finishes its first build.
#[derive(Debug, Clone)]
pub enum Initial {
    Immediate,
    After(Duration),
    Never,
    Fail(String),
}

struct CountingClose {
    kind: PipelineKind,
    closes: Arc<Mutex<HashMap<PipelineKind, usize>>>,
}

impl WatchControl for CountingClose {
    fn close(&self) {
        *self.closes.lock().unwrap().entry(self.kind).or_default() += 1;
    }
}

struct CountingReload(Arc<AtomicUsize>);

impl LiveReload for CountingReload {
    fn broadcast_full_reload(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ScriptedBackend {
    journal: Journal,
    initial: HashMap<PipelineKind, Initial>,
    senders: Mutex<HashMap<PipelineKind, mpsc::UnboundedSender<BuildEvent>>>,
    closes: Arc<Mutex<HashMap<PipelineKind, usize>>>,
    reloads: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            initial: HashMap::new(),
            senders: Mutex::new(HashMap::new()),
            closes: Arc::new(Mutex::new(HashMap::new())),
            reloads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_initial(mut self, kind: PipelineKind, initial: Initial) -> Self {
        self.initial.insert(kind, initial);
        self
    }

    pub fn rebuild(&self, kind: PipelineKind, changed: Option<&str>) {
        self.emit(
            kind,
            BuildEvent::Complete {
                changed: changed.map(PathBuf::from),
            },
        );
    }

    pub fn emit(&self, kind: PipelineKind, event: BuildEvent) {
        let senders = self.senders.lock().unwrap();
        senders[&kind].send(event).unwrap();
    }

    pub fn closes(&self, kind: PipelineKind) -> usize {
        self.closes.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildBackend for ScriptedBackend {
    async fn start_watch(&self, spec: &PipelineSpec) -> miette::Result<WatchBuild> {
        let kind = spec.kind;
        self.journal.push(format!("start {kind}"));
        let (tx, rx) = mpsc::unbounded_channel();

        match self.initial.get(&kind).cloned().unwrap_or(Initial::Immediate) {
            Initial::Immediate => tx.send(BuildEvent::Complete { changed: None }).unwrap(),
            Initial::After(delay) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(BuildEvent::Complete { changed: None });
                });
            }
            Initial::Never => {}
            Initial::Fail(message) => tx.send(BuildEvent::Error { message }).unwrap(),
        }
        self.senders.lock().unwrap().insert(kind, tx);

        let live_reload = (kind == PipelineKind::Renderer)
            .then(|| Arc::new(CountingReload(self.reloads.clone())) as Arc<dyn LiveReload>);
        Ok(WatchBuild {
            events: rx,
            control: Box::new(CountingClose {
                kind,
                closes: self.closes.clone(),
            }),
            live_reload,
        })
    }
}

struct FakeSignaller {
    index: usize,
    launcher: Arc<LauncherState>,
}

impl ProcessSignaller for FakeSignaller {
    fn terminate(&self) {
        self.launcher.kills.fetch_add(1, Ordering::SeqCst);
        let Some(delay) = *self.launcher.exit_on_kill.lock().unwrap() else {
            return;
        };
        let launcher = self.launcher.clone();
        let index = self.index;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            launcher.report(index, None);
        });
    }

    fn kill(&self) {
        self.launcher.force_kills.fetch_add(1, Ordering::SeqCst);
        self.launcher.report(self.index, None);
    }
}

#[derive(Default)]
struct LauncherState {
    reporters: Mutex<Vec<ExitReporter>>,
    spawned_at: Mutex<Vec<Instant>>,
    kills: AtomicUsize,
    force_kills: AtomicUsize,
    exit_on_kill: Mutex<Option<Duration>>,
}

impl LauncherState {
    fn report(&self, index: usize, code: Option<i32>) {
        self.reporters.lock().unwrap()[index].report(code);
    }
}

/// Launcher whose processes live until killed or told to exit.
#[derive(Clone)]
pub struct RecordingLauncher {
    journal: Journal,
    state: Arc<LauncherState>,
}

impl RecordingLauncher {
    pub fn new(journal: Journal) -> Self {
        let launcher = Self {
            journal,
            state: Arc::default(),
        };
        launcher.exit_on_kill(Some(Duration::ZERO));
        launcher
    }

    /// How long a process takes to exit after SIGTERM; `None` never exits.
    pub fn exit_on_kill(&self, delay: Option<Duration>) {
        *self.state.exit_on_kill.lock().unwrap() = delay;
    }

    pub fn exit(&self, index: usize, code: Option<i32>) {
        self.state.report(index, code);
    }

    pub fn spawns(&self) -> usize {
        self.state.spawned_at.lock().unwrap().len()
    }

    pub fn spawned_at(&self) -> Vec<Instant> {
        self.state.spawned_at.lock().unwrap().clone()
    }

    pub fn kills(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    pub fn force_kills(&self) -> usize {
        self.state.force_kills.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn spawn(&self, entry: &Path, _env: &HashMap<String, String>) -> Result<ManagedProcess, LaunchError> {
        self.journal.push(format!("spawn {}", entry.display()));
        let index = self.spawns();
        let (process, reporter) = ManagedProcess::new(
            Some(1000 + index as u32),
            FakeSignaller {
                index,
                launcher: self.state.clone(),
            },
        );
        self.state.reporters.lock().unwrap().push(reporter);
        self.state.spawned_at.lock().unwrap().push(Instant::now());
        Ok(process)
    }
}

#[derive(Default)]
pub struct FakeWatchProvider {
    sender: Mutex<Option<mpsc::UnboundedSender<PathBuf>>>,
    watched: Arc<Mutex<Vec<PathBuf>>>,
}

struct FakeWatch {
    rx: mpsc::UnboundedReceiver<PathBuf>,
    watched: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeWatchProvider {
    pub fn change(&self, path: &str) {
        let sender = self.sender.lock().unwrap();
        sender.as_ref().unwrap().send(PathBuf::from(path)).unwrap();
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileWatchProvider for FakeWatchProvider {
    async fn watch(&self, paths: &[PathBuf]) -> miette::Result<Box<dyn PathWatch>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        self.watched.lock().unwrap().extend(paths.iter().cloned());
        Ok(Box::new(FakeWatch {
            rx,
            watched: self.watched.clone(),
        }))
    }
}

#[async_trait]
impl PathWatch for FakeWatch {
    async fn next_change(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }

    fn unwatch(&mut self, path: &Path) {
        self.watched.lock().unwrap().retain(|watched| watched != path);
    }
}

/// A controller wired to fakes, with handles to inspect them.
pub struct Harness {
    pub journal: Journal,
    pub backend: Arc<ScriptedBackend>,
    pub launcher: RecordingLauncher,
    pub watch: Arc<FakeWatchProvider>,
    pub controller: SessionController,
}

pub struct HarnessBuilder {
    with_views: bool,
    renderer_only: bool,
    codegen_fails: bool,
    initial: Vec<(PipelineKind, Initial)>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            with_views: true,
            renderer_only: false,
            codegen_fails: false,
            initial: Vec::new(),
        }
    }
}

impl HarnessBuilder {
    pub fn without_views(mut self) -> Self {
        self.with_views = false;
        self
    }

    pub fn renderer_only(mut self) -> Self {
        self.renderer_only = true;
        self
    }

    pub fn codegen_fails(mut self) -> Self {
        self.codegen_fails = true;
        self
    }

    pub fn initial(mut self, kind: PipelineKind, initial: Initial) -> Self {
        self.initial.push((kind, initial));
        self
    }

    pub fn build(self) -> Harness {
        let journal = Journal::default();
        let mut backend = ScriptedBackend::new(journal.clone());
        for (kind, initial) in self.initial {
            backend = backend.with_initial(kind, initial);
        }
        let backend = Arc::new(backend);
        let launcher = RecordingLauncher::new(journal.clone());
        let watch = Arc::new(FakeWatchProvider::default());

        let services = Services {
            loader: Arc::new(FakeLoader {
                journal: journal.clone(),
                loaded: loaded_config(self.with_views),
            }),
            codegen: Arc::new(FakeCodegen {
                journal: journal.clone(),
                fail: self.codegen_fails,
            }),
            externals: Arc::new(FakeExternals {
                journal: journal.clone(),
            }),
            backend: backend.clone(),
            launcher: Arc::new(launcher.clone()),
            watch: watch.clone(),
        };
        let controller = SessionController::new(
            CONFIG_PATH,
            SessionOptions::default(),
            self.renderer_only,
            services,
        );

        Harness {
            journal,
            backend,
            launcher,
            watch,
            controller,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub async fn started() -> Self {
        let harness = Self::builder().build();
        harness.controller.start().await.unwrap();
        harness
    }
}

/// Let spawned tasks run without advancing the paused clock much.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
