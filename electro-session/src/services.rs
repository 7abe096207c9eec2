//! Collaborators the session drives but does not implement.
//!
//! Config loading, code generation and externals resolution are supplied by
//! the embedding tool; the build backend and process launcher live behind
//! their own traits in [`crate::pipeline`] and [`crate::supervisor`].

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use miette::Result;

use crate::config_watcher::FileWatchProvider;
use crate::pipeline::BuildBackend;
use crate::supervisor::ProcessLauncher;

/// One compiled program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryConfig {
    pub entry: PathBuf,
    pub output: PathBuf,
}

/// An interactive view served by the renderer pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewConfig {
    pub name: String,
    pub entry: PathBuf,
    /// Per-view config source, watched for changes alongside the main config.
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub name: String,
    pub main: EntryConfig,
    pub preload: EntryConfig,
    pub views: Vec<ViewConfig>,
    pub out_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl AppConfig {
    pub fn has_views(&self) -> bool {
        !self.views.is_empty()
    }
}

/// Result of loading the app config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub config_path: PathBuf,
    pub root: PathBuf,
}

impl LoadedConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// The config entry file and every per-view config source, as absolute paths.
    pub fn config_source_paths(&self) -> BTreeSet<PathBuf> {
        let mut paths = BTreeSet::new();
        paths.insert(self.resolve(&self.config_path));
        for view in &self.config.views {
            if let Some(config) = &view.config {
                paths.insert(self.resolve(config));
            }
        }
        paths
    }
}

/// Modules left out of the compiled images and resolved at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Externals {
    pub modules: Vec<String>,
}

#[async_trait]
pub trait ConfigLoader: Send + Sync {
    /// Load and validate the config at `path`. Must fail if the main entry is missing.
    async fn load(&self, path: &Path) -> Result<LoadedConfig>;
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, config: &LoadedConfig) -> Result<()>;
}

#[async_trait]
pub trait ExternalsResolver: Send + Sync {
    async fn resolve(&self, config: &LoadedConfig) -> Result<Externals>;
}

/// Everything a [`crate::SessionController`] needs from the outside world.
#[derive(Clone)]
pub struct Services {
    pub loader: Arc<dyn ConfigLoader>,
    pub codegen: Arc<dyn CodeGenerator>,
    pub externals: Arc<dyn ExternalsResolver>,
    pub backend: Arc<dyn BuildBackend>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub watch: Arc<dyn FileWatchProvider>,
}
