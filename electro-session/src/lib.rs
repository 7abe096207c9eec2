//! Orchestration of an electro dev session.
//!
//! A session runs up to three watch builds (renderer, preload and main),
//! launches the app process once the compiled images exist, restarts it when
//! main rebuilds and reloads everything when a config source changes.

pub mod coalescer;
pub mod command;
pub mod config_watcher;
pub mod controller;
pub mod debounce;
pub mod error;
pub mod latch;
pub mod options;
pub mod pipeline;
pub mod services;
pub mod session;
pub mod supervisor;

pub use coalescer::{RestartCoalescer, RestartTarget};
pub use command::{CommandBackend, CommandLauncher, PipelineCommand};
pub use config_watcher::{ConfigWatcher, FileWatchProvider, PathWatch};
pub use controller::{SessionController, SessionExit};
pub use debounce::Debouncer;
pub use error::{BackendError, LaunchError, SessionError};
pub use latch::{LatchTimeout, OneShotLatch};
pub use options::SessionOptions;
pub use pipeline::{
    BuildBackend, BuildEvent, LiveReload, PipelineHandle, PipelineKind, PipelineSpec,
    PipelineWatcher, WatchBuild, WatchControl,
};
pub use services::{
    AppConfig, CodeGenerator, ConfigLoader, EntryConfig, Externals, ExternalsResolver,
    LoadedConfig, Services, ViewConfig,
};
pub use session::{Session, SessionEvent, SessionFlags};
pub use supervisor::{ExitReporter, ManagedProcess, ProcessLauncher, ProcessSignaller, ProcessSupervisor};
