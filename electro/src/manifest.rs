//! The `electro.yaml` app manifest and the session services built from it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use electro_session::options::{
    DEFAULT_CONFIG_DEBOUNCE, DEFAULT_INITIAL_BUILD_TIMEOUT, DEFAULT_KILL_GRACE,
    DEFAULT_RESTART_DEBOUNCE,
};
use electro_session::{
    AppConfig, CodeGenerator, CommandBackend, CommandLauncher, ConfigLoader, EntryConfig,
    Externals, ExternalsResolver, LoadedConfig, PipelineCommand, PipelineKind, Services,
    SessionOptions, ViewConfig,
};
use miette::{Diagnostic, IntoDiagnostic, WrapErr, bail};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::watch::EventSourceWatchProvider;

#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}", path.display())]
    #[diagnostic(help("see the manifest reference for the expected layout"))]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("main entry {} does not exist", path.display())]
    MissingEntry { path: PathBuf },
    #[error("failed to parse {}", path.display())]
    PackageJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub name: String,
    /// Project root, relative to the manifest's directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    pub runtime: Runtime,
    pub main: CompiledPipeline,
    pub preload: CompiledPipeline,
    #[serde(default)]
    pub renderer: Option<RendererPipeline>,
    /// Shell command run before the pipelines start.
    #[serde(default)]
    pub codegen: Option<String>,
    #[serde(default)]
    pub externals: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timings: Timings,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Runtime {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompiledPipeline {
    pub entry: PathBuf,
    pub output: PathBuf,
    /// Watch-mode build command.
    pub watch: String,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RendererPipeline {
    pub watch: String,
    /// Command that tells the dev server to reload its clients.
    #[serde(default)]
    pub reload: Option<String>,
    #[serde(default)]
    pub views: Vec<View>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct View {
    pub name: String,
    pub entry: PathBuf,
    #[serde(default)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timings {
    pub initial_build_timeout_ms: u64,
    pub restart_debounce_ms: u64,
    pub config_debounce_ms: u64,
    /// `null` waits for a restarting process indefinitely.
    pub kill_grace_ms: Option<u64>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            initial_build_timeout_ms: DEFAULT_INITIAL_BUILD_TIMEOUT.as_millis() as u64,
            restart_debounce_ms: DEFAULT_RESTART_DEBOUNCE.as_millis() as u64,
            config_debounce_ms: DEFAULT_CONFIG_DEBOUNCE.as_millis() as u64,
            kill_grace_ms: Some(DEFAULT_KILL_GRACE.as_millis() as u64),
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    pub fn parse(path: &Path, contents: &str) -> Result<Self, ManifestError> {
        serde_yaml::from_str(contents).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Absolute project root for a manifest located at `manifest_path`.
    pub fn root_dir(&self, manifest_path: &Path) -> PathBuf {
        let dir = manifest_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let root = match &self.root {
            Some(root) => dir.join(root),
            None => dir.to_path_buf(),
        };
        root.canonicalize()
            .or_else(|_| std::path::absolute(&root))
            .unwrap_or(root)
    }

    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            initial_build_timeout: Duration::from_millis(self.timings.initial_build_timeout_ms),
            restart_debounce: Duration::from_millis(self.timings.restart_debounce_ms),
            config_debounce: Duration::from_millis(self.timings.config_debounce_ms),
            kill_grace: self.timings.kill_grace_ms.map(Duration::from_millis),
        }
    }

    pub fn app_config(&self) -> AppConfig {
        let views = self
            .renderer
            .iter()
            .flat_map(|renderer| &renderer.views)
            .map(|view| ViewConfig {
                name: view.name.clone(),
                entry: view.entry.clone(),
                config: view.config.clone(),
            })
            .collect();
        AppConfig {
            name: self.name.clone(),
            main: EntryConfig {
                entry: self.main.entry.clone(),
                output: self.main.output.clone(),
            },
            preload: EntryConfig {
                entry: self.preload.entry.clone(),
                output: self.preload.output.clone(),
            },
            views,
            out_dir: self.out_dir.clone(),
            env: self.env.clone(),
        }
    }

    fn pipeline_commands(&self, root: &Path) -> HashMap<PipelineKind, PipelineCommand> {
        let compiled = |pipeline: &CompiledPipeline| PipelineCommand {
            command: pipeline.watch.clone(),
            sources: pipeline.sources.iter().map(|source| root.join(source)).collect(),
            reload_command: None,
        };
        let mut commands = HashMap::new();
        commands.insert(PipelineKind::Main, compiled(&self.main));
        commands.insert(PipelineKind::Preload, compiled(&self.preload));
        if let Some(renderer) = &self.renderer {
            commands.insert(
                PipelineKind::Renderer,
                PipelineCommand {
                    command: renderer.watch.clone(),
                    sources: Vec::new(),
                    reload_command: renderer.reload.clone(),
                },
            );
        }
        commands
    }

    /// Wire a session for the manifest at `manifest_path`.
    pub fn services(&self, manifest_path: &Path) -> Services {
        let root = self.root_dir(manifest_path);
        Services {
            loader: Arc::new(ManifestLoader {
                manifest: self.clone(),
                root: root.clone(),
            }),
            codegen: Arc::new(ShellCodegen {
                command: self.codegen.clone(),
                root: root.clone(),
            }),
            externals: Arc::new(ManifestExternals {
                root: root.clone(),
                modules: self.externals.clone(),
            }),
            backend: Arc::new(CommandBackend::new(
                root.clone(),
                self.pipeline_commands(&root),
                self.env.clone(),
            )),
            launcher: Arc::new(CommandLauncher::new(
                self.runtime.command.clone(),
                self.runtime.args.clone(),
                Some(root),
            )),
            watch: Arc::new(EventSourceWatchProvider),
        }
    }
}

/// Hands the already parsed manifest to the session, checking it against the disk.
pub struct ManifestLoader {
    manifest: Manifest,
    root: PathBuf,
}

#[async_trait]
impl ConfigLoader for ManifestLoader {
    async fn load(&self, path: &Path) -> miette::Result<LoadedConfig> {
        let entry = self.root.join(&self.manifest.main.entry);
        if !tokio::fs::try_exists(&entry).await.unwrap_or(false) {
            return Err(ManifestError::MissingEntry { path: entry }.into());
        }
        let config_path = std::path::absolute(path).into_diagnostic()?;
        debug!(config = %config_path.display(), root = %self.root.display(), "manifest loaded");
        Ok(LoadedConfig {
            config: self.manifest.app_config(),
            config_path,
            root: self.root.clone(),
        })
    }
}

pub struct ShellCodegen {
    command: Option<String>,
    root: PathBuf,
}

#[async_trait]
impl CodeGenerator for ShellCodegen {
    async fn generate(&self, config: &LoadedConfig) -> miette::Result<()> {
        let Some(command) = &self.command else {
            return Ok(());
        };
        debug!(command, "running codegen");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .env("ELECTRO_CONFIG", &config.config_path)
            .env("ELECTRO_OUT_DIR", config.resolve(&config.config.out_dir))
            .status()
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to run `{command}`"))?;
        if !status.success() {
            bail!("codegen command `{command}` failed: {status}");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
}

/// Externals are the manifest's list plus the runtime `dependencies` of `package.json`.
pub struct ManifestExternals {
    root: PathBuf,
    modules: Vec<String>,
}

#[async_trait]
impl ExternalsResolver for ManifestExternals {
    async fn resolve(&self, _config: &LoadedConfig) -> miette::Result<Externals> {
        let mut modules: BTreeSet<String> = self.modules.iter().cloned().collect();

        let path = self.root.join("package.json");
        let read = tokio::fs::read_to_string(&path).await;
        match read {
            Ok(contents) => {
                let package: PackageJson = serde_json::from_str(&contents)
                    .map_err(|source| ManifestError::PackageJson { path, source })?;
                modules.extend(package.dependencies.into_keys());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ManifestError::Read { path, source }.into()),
        }

        Ok(Externals {
            modules: modules.into_iter().collect(),
        })
    }
}
