use std::time::Duration;

pub const DEFAULT_INITIAL_BUILD_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_RESTART_DEBOUNCE: Duration = Duration::from_millis(80);
pub const DEFAULT_CONFIG_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(5_000);

/// Timing knobs for a dev session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// How long to wait for each compiled pipeline's first build.
    pub initial_build_timeout: Duration,
    /// Quiet period before main-pipeline rebuilds turn into a restart.
    pub restart_debounce: Duration,
    /// Quiet period before a config change recreates the session.
    pub config_debounce: Duration,
    /// Time a restarting process gets between SIGTERM and SIGKILL.
    /// `None` waits for the exit indefinitely.
    pub kill_grace: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            initial_build_timeout: DEFAULT_INITIAL_BUILD_TIMEOUT,
            restart_debounce: DEFAULT_RESTART_DEBOUNCE,
            config_debounce: DEFAULT_CONFIG_DEBOUNCE,
            kill_grace: Some(DEFAULT_KILL_GRACE),
        }
    }
}
