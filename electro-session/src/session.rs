use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::pipeline::PipelineKind;
use crate::services::LoadedConfig;

/// Teardown flags shared by every component of one session.
///
/// `cleaned_up` makes teardown run once; `shutting_down` lets late
/// callbacks (process exits, rebuilds) see that the session is going away.
#[derive(Debug, Default)]
pub struct SessionFlags {
    cleaned_up: AtomicBool,
    shutting_down: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    /// Mark the session as torn down. Returns `true` only for the first call.
    pub fn begin_teardown(&self) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        !self.cleaned_up.swap(true, Ordering::SeqCst)
    }
}

/// Per-start session state, cleared on stop.
#[derive(Debug, Clone)]
pub struct Session {
    pub config_source_paths: BTreeSet<PathBuf>,
    pub output_dir: PathBuf,
    pub renderer_only: bool,
}

impl Session {
    pub fn from_loaded(loaded: &LoadedConfig, renderer_only: bool) -> Self {
        Self {
            config_source_paths: loaded.config_source_paths(),
            output_dir: loaded.root.join(&loaded.config.out_dir),
            renderer_only,
        }
    }
}

/// Notifications routed to the session controller's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A pipeline finished a build after its initial one.
    PipelineRebuilt {
        pipeline: PipelineKind,
        reason: Option<PathBuf>,
    },
    /// The current app process exited with a failure.
    ProcessCrashed { code: i32 },
    /// A config source file changed and the debounce window settled.
    ConfigChanged { path: PathBuf },
}
