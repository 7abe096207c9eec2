//! Debounced, serialized restarts driven by main-pipeline rebuilds.
//!
//! [`CoalescerState`] is the pure `Idle`/`Restarting` machine with a
//! single-slot mailbox. [`RestartCoalescer`] wires it to a [`Debouncer`] and a
//! [`RestartTarget`], running restart cycles until the mailbox drains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::debounce::Debouncer;

/// Something that can be restarted, one cycle at a time.
#[async_trait]
pub trait RestartTarget: Send + Sync {
    async fn restart(&self, reason: Option<&Path>) -> miette::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescerPhase {
    Idle,
    Restarting,
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run one restart cycle with this reason.
    Run { reason: Option<PathBuf> },
    /// A cycle is in flight; the request was merged into the mailbox.
    Queued,
    /// Nothing left to do.
    Idle,
}

/// Merge rule for pending reasons: the latest known reason wins, but an
/// unknown reason never erases a known one.
fn merge_reason(slot: &mut Option<PathBuf>, reason: Option<PathBuf>) {
    if reason.is_some() {
        *slot = reason;
    }
}

/// Pure state machine: no timers, no I/O.
#[derive(Debug)]
pub struct CoalescerState {
    phase: CoalescerPhase,
    /// `Some` when a request arrived during the current cycle.
    mailbox: Option<Option<PathBuf>>,
}

impl Default for CoalescerState {
    fn default() -> Self {
        Self {
            phase: CoalescerPhase::Idle,
            mailbox: None,
        }
    }
}

impl CoalescerState {
    pub fn phase(&self) -> CoalescerPhase {
        self.phase
    }

    pub fn has_queued(&self) -> bool {
        self.mailbox.is_some()
    }

    pub fn on_request(&mut self, reason: Option<PathBuf>) -> Step {
        match self.phase {
            CoalescerPhase::Idle => {
                self.phase = CoalescerPhase::Restarting;
                Step::Run { reason }
            }
            CoalescerPhase::Restarting => {
                merge_reason(self.mailbox.get_or_insert(None), reason);
                Step::Queued
            }
        }
    }

    pub fn on_cycle_complete(&mut self) -> Step {
        match self.mailbox.take() {
            Some(reason) => Step::Run { reason },
            None => {
                self.phase = CoalescerPhase::Idle;
                Step::Idle
            }
        }
    }

    /// Drop any queued request and return to idle.
    pub fn reset(&mut self) {
        self.mailbox = None;
        self.phase = CoalescerPhase::Idle;
    }
}

struct Inner {
    state: Mutex<CoalescerState>,
    /// Reason accumulated while the debounce timer is running.
    pending_reason: Mutex<Option<PathBuf>>,
    debouncer: Debouncer,
    target: Arc<dyn RestartTarget>,
    closed: AtomicBool,
    cycles: AtomicU64,
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoalescerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request_restart(&self, reason: Option<PathBuf>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut step = self.lock_state().on_request(reason);
        if step == Step::Queued {
            debug!("restart in flight, queued another cycle");
            return;
        }

        while let Step::Run { reason } = step {
            if self.closed.load(Ordering::SeqCst) {
                self.lock_state().reset();
                return;
            }
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            match &reason {
                Some(path) => info!(cycle, reason = %path.display(), "restarting app process"),
                None => info!(cycle, "restarting app process"),
            }
            if let Err(err) = self.target.restart(reason.as_deref()).await {
                error!("restart failed: {err:?}");
            }
            step = self.lock_state().on_cycle_complete();
        }
    }
}

/// Collapses bursts of rebuild notifications into serialized restart cycles.
#[derive(Clone)]
pub struct RestartCoalescer {
    inner: Arc<Inner>,
}

impl RestartCoalescer {
    pub fn new(target: Arc<dyn RestartTarget>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoalescerState::default()),
                pending_reason: Mutex::new(None),
                debouncer: Debouncer::new(debounce),
                target,
                closed: AtomicBool::new(false),
                cycles: AtomicU64::new(0),
            }),
        }
    }

    /// Record a rebuild and (re)start the debounce window.
    pub fn notify(&self, reason: Option<PathBuf>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        merge_reason(
            &mut self
                .inner
                .pending_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            reason,
        );
        let inner = Arc::clone(&self.inner);
        self.inner.debouncer.trigger(async move {
            let reason = inner
                .pending_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            inner.request_restart(reason).await;
        });
    }

    /// Run a restart now, or queue it behind the cycle in flight.
    ///
    /// Returns without waiting when a cycle is already running.
    pub async fn request_restart(&self, reason: Option<PathBuf>) {
        self.inner.request_restart(reason).await;
    }

    /// Stop accepting requests and drop anything scheduled or queued.
    /// A cycle already in flight finishes, but no further cycle starts.
    pub fn cancel(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.debouncer.cancel();
        self.inner
            .pending_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.lock_state().mailbox = None;
    }

    pub fn phase(&self) -> CoalescerPhase {
        self.inner.lock_state().phase()
    }

    pub fn is_debouncing(&self) -> bool {
        self.inner.debouncer.is_pending()
    }

    /// Number of restart cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::SeqCst)
    }
}
