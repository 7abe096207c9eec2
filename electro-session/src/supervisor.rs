//! Ownership of the single app-process slot.
//!
//! The supervisor holds at most one "current" [`ManagedProcess`]. Every exit
//! observer captures the process it was spawned for and compares it by
//! identity with the current slot, so exits of superseded processes are
//! ignored. Restarts clear the slot before killing, then wait for the old
//! process to exit before spawning its replacement.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::coalescer::RestartTarget;
use crate::error::LaunchError;
use crate::session::{SessionEvent, SessionFlags};

/// Exit code reported for a crash that carried no code (killed by a signal).
const SIGNALED_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// Exit code, or `None` when the process was terminated by a signal.
    Exited(Option<i32>),
}

/// Delivers termination signals to a running process.
pub trait ProcessSignaller: Send + Sync {
    /// Ask the process to exit (SIGTERM).
    fn terminate(&self);
    /// Force the process to exit (SIGKILL).
    fn kill(&self);
}

/// Publishes the exit of a [`ManagedProcess`]. Only the first report counts.
#[derive(Debug)]
pub struct ExitReporter {
    tx: watch::Sender<ExitState>,
}

impl ExitReporter {
    pub fn report(&self, code: Option<i32>) {
        self.tx.send_if_modified(|state| {
            if *state != ExitState::Running {
                return false;
            }
            *state = ExitState::Exited(code);
            true
        });
    }
}

/// One live child process.
pub struct ManagedProcess {
    pid: Option<u32>,
    signaller: Box<dyn ProcessSignaller>,
    exit: watch::Receiver<ExitState>,
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

impl ManagedProcess {
    pub fn new(pid: Option<u32>, signaller: impl ProcessSignaller + 'static) -> (Self, ExitReporter) {
        let (tx, rx) = watch::channel(ExitState::Running);
        let process = Self {
            pid,
            signaller: Box::new(signaller),
            exit: rx,
        };
        (process, ExitReporter { tx })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn kill(&self) {
        self.signaller.terminate();
    }

    pub fn force_kill(&self) {
        self.signaller.kill();
    }

    pub fn has_exited(&self) -> bool {
        *self.exit.borrow() != ExitState::Running
    }

    /// Resolves with the exit code once the process has exited.
    ///
    /// A reporter dropped without reporting counts as an exit without code.
    pub async fn exited(&self) -> Option<i32> {
        let mut rx = self.exit.clone();
        match rx.wait_for(|state| *state != ExitState::Running).await {
            Ok(state) => match *state {
                ExitState::Exited(code) => code,
                ExitState::Running => None,
            },
            Err(_) => None,
        }
    }
}

/// Spawns the app process.
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, entry: &Path, env: &HashMap<String, String>) -> Result<ManagedProcess, LaunchError>;
}

struct SupervisorInner {
    launcher: Arc<dyn ProcessLauncher>,
    entry: PathBuf,
    env: HashMap<String, String>,
    flags: Arc<SessionFlags>,
    events: mpsc::UnboundedSender<SessionEvent>,
    kill_grace: Option<Duration>,
    current: Mutex<Option<Arc<ManagedProcess>>>,
    launches: AtomicU64,
}

impl SupervisorInner {
    fn take_current(&self) -> Option<Arc<ManagedProcess>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn on_exit(&self, process: &Arc<ManagedProcess>, code: Option<i32>) {
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let is_current = current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, process));
            if !is_current || self.flags.is_shutting_down() {
                debug!(pid = ?process.pid(), ?code, "ignoring exit of superseded app process");
                return;
            }
            *current = None;
        }

        match code {
            Some(0) => info!(pid = ?process.pid(), "app process exited cleanly"),
            other => {
                let code = other.unwrap_or(SIGNALED_EXIT_CODE);
                error!(pid = ?process.pid(), code, "app process crashed");
                let _ = self.events.send(SessionEvent::ProcessCrashed { code });
            }
        }
    }

    async fn wait_for_exit(&self, process: &ManagedProcess) {
        let Some(grace) = self.kill_grace else {
            process.exited().await;
            return;
        };
        if tokio::time::timeout(grace, process.exited()).await.is_err() {
            warn!(
                pid = ?process.pid(),
                "app process still running {}ms after SIGTERM, sending SIGKILL",
                grace.as_millis()
            );
            process.force_kill();
            process.exited().await;
        }
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        entry: PathBuf,
        env: HashMap<String, String>,
        flags: Arc<SessionFlags>,
        events: mpsc::UnboundedSender<SessionEvent>,
        kill_grace: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                launcher,
                entry,
                env,
                flags,
                events,
                kill_grace,
                current: Mutex::new(None),
                launches: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the app process and make it current.
    pub fn launch(&self) -> Result<Arc<ManagedProcess>, LaunchError> {
        let process = Arc::new(self.inner.launcher.spawn(&self.inner.entry, &self.inner.env)?);
        let launch = self.inner.launches.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pid = ?process.pid(), launch, entry = %self.inner.entry.display(), "app process started");

        let previous = self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&process));
        if let Some(previous) = previous {
            warn!(pid = ?previous.pid(), "replacing an app process that was still current");
            previous.kill();
        }

        let inner = Arc::clone(&self.inner);
        let observed = Arc::clone(&process);
        tokio::spawn(async move {
            let code = observed.exited().await;
            inner.on_exit(&observed, code);
        });

        Ok(process)
    }

    /// Replace the current process: clear the slot, kill, wait, relaunch.
    pub async fn restart(&self, reason: Option<&Path>) -> Result<(), LaunchError> {
        if let Some(previous) = self.inner.take_current() {
            debug!(pid = ?previous.pid(), reason = ?reason, "stopping app process for restart");
            previous.kill();
            self.inner.wait_for_exit(&previous).await;
        }
        if self.inner.flags.is_shutting_down() {
            debug!("session shutting down, not relaunching");
            return Ok(());
        }
        self.launch().map(|_| ())
    }

    /// Kill the current process without waiting for it to exit.
    pub fn stop(&self) {
        if let Some(process) = self.inner.take_current() {
            debug!(pid = ?process.pid(), "stopping app process");
            process.kill();
        }
    }

    pub fn current(&self) -> Option<Arc<ManagedProcess>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn launches(&self) -> u64 {
        self.inner.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestartTarget for ProcessSupervisor {
    async fn restart(&self, reason: Option<&Path>) -> miette::Result<()> {
        ProcessSupervisor::restart(self, reason)
            .await
            .map_err(miette::Report::new)
    }
}
