//! Process launcher and build backend backed by external commands.
//!
//! Both spawn their children in a fresh process group so that a SIGTERM sent
//! to the group also reaches anything the command forked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use electro_event_sources::{FileWatcher, FileWatcherConfig};
use miette::IntoDiagnostic;
use nix::sys::signal::{self as nix_signal, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::error::{BackendError, LaunchError};
use crate::pipeline::{
    BuildBackend, BuildEvent, LiveReload, PipelineKind, PipelineSpec, WatchBuild, WatchControl,
};
use crate::supervisor::{ManagedProcess, ProcessLauncher, ProcessSignaller};

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    if let Err(err) = nix_signal::killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, "failed to signal process group: {err}");
    }
}

struct GroupSignaller {
    pid: Option<u32>,
}

impl ProcessSignaller for GroupSignaller {
    fn terminate(&self) {
        signal_group(self.pid, Signal::SIGTERM);
    }

    fn kill(&self) {
        signal_group(self.pid, Signal::SIGKILL);
    }
}

/// Runs `program [args..] <entry>` as the app process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd,
        }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn spawn(&self, entry: &Path, env: &HashMap<String, String>) -> Result<ManagedProcess, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(entry)
            .envs(env)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            entry: entry.to_path_buf(),
            source,
        })?;
        let pid = child.id();
        let (process, reporter) = ManagedProcess::new(pid, GroupSignaller { pid });

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(?pid, "failed to wait for app process: {err}");
                    None
                }
            };
            reporter.report(code);
        });
        Ok(process)
    }
}

/// How one pipeline is built.
#[derive(Debug, Clone, Default)]
pub struct PipelineCommand {
    /// Shell command that builds in watch mode and never exits on its own.
    pub command: String,
    /// Source directories; the most recent change is reported as the rebuild reason.
    pub sources: Vec<PathBuf>,
    /// Shell command that pushes a full reload to connected clients.
    pub reload_command: Option<String>,
}

/// Build backend that runs one watch command per pipeline.
///
/// The command receives its pipeline in `ELECTRO_PIPELINE`, its entries in
/// `ELECTRO_ENTRIES`, its output path in `ELECTRO_OUTPUT` and the externals as
/// a comma-separated `ELECTRO_EXTERNALS`. A build counts as complete when the
/// output file is written.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    root: PathBuf,
    commands: HashMap<PipelineKind, PipelineCommand>,
    env: HashMap<String, String>,
}

impl CommandBackend {
    pub fn new(
        root: PathBuf,
        commands: HashMap<PipelineKind, PipelineCommand>,
        env: HashMap<String, String>,
    ) -> Self {
        Self { root, commands, env }
    }

    fn shell(&self, script: &str) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(&self.root)
            .envs(&self.env)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        command
    }
}

/// Create the output's directory so it can be watched before the first build.
async fn prepare_output(output: &Path) -> Result<PathBuf, BackendError> {
    let Some(parent) = output.parent() else {
        return Ok(output.to_path_buf());
    };
    let prepared = async {
        tokio::fs::create_dir_all(parent).await?;
        tokio::fs::canonicalize(parent).await
    };
    match prepared.await {
        Ok(parent) => Ok(output
            .file_name()
            .map_or_else(|| parent.clone(), |name| parent.join(name))),
        Err(source) => Err(BackendError::OutputDir {
            path: parent.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl BuildBackend for CommandBackend {
    async fn start_watch(&self, spec: &PipelineSpec) -> miette::Result<WatchBuild> {
        let kind = spec.kind;
        let pipeline = self
            .commands
            .get(&kind)
            .ok_or(BackendError::NotConfigured(kind))?;

        let output = match &spec.output {
            Some(output) => Some(prepare_output(output).await?),
            None => None,
        };
        let entries = std::env::join_paths(&spec.entries).into_diagnostic()?;

        let mut command = self.shell(&pipeline.command);
        command
            .env("ELECTRO_PIPELINE", kind.as_str())
            .env("ELECTRO_ENTRIES", entries)
            .env("ELECTRO_EXTERNALS", spec.externals.join(","));
        if let Some(output) = &output {
            command.env("ELECTRO_OUTPUT", output);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        // Watch before spawning so the first build cannot be missed.
        match &output {
            Some(output) => {
                let outputs = [output.clone()];
                let mut output_watcher = FileWatcher::new(
                    FileWatcherConfig {
                        paths: &outputs,
                        ..Default::default()
                    },
                    &format!("{kind}-output"),
                )
                .await;
                let mut source_watcher = FileWatcher::new(
                    FileWatcherConfig {
                        paths: &pipeline.sources,
                        recursive: true,
                        ..Default::default()
                    },
                    &format!("{kind}-sources"),
                )
                .await;

                let tx = tx.clone();
                let task = tokio::spawn(async move {
                    let mut last_source = None;
                    loop {
                        tokio::select! {
                            Some(event) = source_watcher.recv() => last_source = Some(event.path),
                            Some(_) = output_watcher.recv() => {
                                let event = BuildEvent::Complete { changed: last_source.take() };
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                            else => break,
                        }
                    }
                });
                tasks.push(task.abort_handle());
            }
            None => {
                // Serving pipelines are ready once their command is running.
                let _ = tx.send(BuildEvent::Complete { changed: None });
            }
        }

        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            pipeline: kind,
            command: pipeline.command.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(pipeline = %kind, ?pid, "watch command started");

        // Not aborted on close: dropping the child would SIGKILL it.
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn({
            let closed = Arc::clone(&closed);
            async move {
                let status = child.wait().await;
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let message = match status {
                    Ok(status) if status.success() => {
                        format!("{kind} watch command exited unexpectedly")
                    }
                    Ok(status) => format!("{kind} watch command failed: {status}"),
                    Err(err) => format!("failed to wait for {kind} watch command: {err}"),
                };
                let _ = tx.send(BuildEvent::Error { message });
            }
        });

        let live_reload = pipeline.reload_command.as_ref().map(|script| {
            Arc::new(ShellReload {
                backend: self.clone(),
                script: script.clone(),
            }) as Arc<dyn LiveReload>
        });

        Ok(WatchBuild {
            events: rx,
            control: Box::new(CommandWatch { pid, closed, tasks }),
            live_reload,
        })
    }
}

struct CommandWatch {
    pid: Option<u32>,
    closed: Arc<AtomicBool>,
    tasks: Vec<AbortHandle>,
}

impl WatchControl for CommandWatch {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        signal_group(self.pid, Signal::SIGTERM);
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct ShellReload {
    backend: CommandBackend,
    script: String,
}

impl LiveReload for ShellReload {
    fn broadcast_full_reload(&self) {
        let mut command = self.backend.shell(&self.script);
        let script = self.script.clone();
        match command.spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => {}
                        Ok(status) => warn!("reload command `{script}` failed: {status}"),
                        Err(err) => warn!("reload command `{script}` failed: {err}"),
                    }
                });
            }
            Err(err) => error!("failed to run reload command `{script}`: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(kind: PipelineKind, root: &Path, output: Option<PathBuf>) -> PipelineSpec {
        PipelineSpec {
            kind,
            root: root.to_path_buf(),
            entries: vec![root.join("src/index.ts")],
            output,
            externals: vec!["sqlite3".into()],
        }
    }

    fn backend(root: &Path, kind: PipelineKind, command: &str) -> CommandBackend {
        let mut commands = HashMap::new();
        commands.insert(
            kind,
            PipelineCommand {
                command: command.into(),
                ..Default::default()
            },
        );
        CommandBackend::new(root.to_path_buf(), commands, HashMap::new())
    }

    async fn next(build: &mut WatchBuild) -> BuildEvent {
        tokio::time::timeout(Duration::from_secs(10), build.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_launcher_reports_exit_code() {
        let launcher = CommandLauncher::new("sh", vec!["-c".into(), "exit 3".into()], None);
        let process = launcher.spawn(Path::new("ignored"), &HashMap::new()).unwrap();
        assert_eq!(process.exited().await, Some(3));
    }

    #[tokio::test]
    async fn test_launcher_kill_terminates_group() {
        let launcher = CommandLauncher::new("sh", vec!["-c".into(), "sleep 30".into()], None);
        let process = launcher.spawn(Path::new("ignored"), &HashMap::new()).unwrap();
        process.kill();
        let code = tokio::time::timeout(Duration::from_secs(10), process.exited())
            .await
            .unwrap();
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_launcher_spawn_failure() {
        let launcher = CommandLauncher::new("/nonexistent/electron", Vec::new(), None);
        let err = launcher
            .spawn(Path::new("/app/out/main/index.js"), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_backend_reports_output_writes_as_builds() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out/main/index.js");
        let backend = backend(
            dir.path(),
            PipelineKind::Main,
            "sleep 0.5; echo built > \"$ELECTRO_OUTPUT\"; sleep 30",
        );

        let mut build = backend
            .start_watch(&spec(PipelineKind::Main, dir.path(), Some(output)))
            .await
            .unwrap();
        assert_eq!(next(&mut build).await, BuildEvent::Complete { changed: None });
        build.control.close();
    }

    #[tokio::test]
    async fn test_backend_reports_failed_command() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out/preload/index.js");
        let backend = backend(dir.path(), PipelineKind::Preload, "exit 2");

        let mut build = backend
            .start_watch(&spec(PipelineKind::Preload, dir.path(), Some(output)))
            .await
            .unwrap();
        assert!(matches!(next(&mut build).await, BuildEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_close_lets_command_handle_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(
            dir.path(),
            PipelineKind::Renderer,
            "trap 'echo done > stopped; exit 0' TERM; while :; do sleep 0.05; done",
        );

        let mut build = backend
            .start_watch(&spec(PipelineKind::Renderer, dir.path(), None))
            .await
            .unwrap();
        assert_eq!(next(&mut build).await, BuildEvent::Complete { changed: None });
        tokio::time::sleep(Duration::from_millis(300)).await;

        build.control.close();
        let ended = tokio::time::timeout(Duration::from_secs(10), build.events.recv())
            .await
            .unwrap();
        assert_eq!(ended, None);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stopped")).unwrap(),
            "done\n"
        );
    }

    #[tokio::test]
    async fn test_renderer_without_output_is_ready_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), PipelineKind::Renderer, "sleep 30");

        let mut build = backend
            .start_watch(&spec(PipelineKind::Renderer, dir.path(), None))
            .await
            .unwrap();
        assert_eq!(next(&mut build).await, BuildEvent::Complete { changed: None });
        assert!(build.live_reload.is_none());
        build.control.close();
        build.control.close();
    }

    #[tokio::test]
    async fn test_unconfigured_pipeline_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), PipelineKind::Main, "true");
        let err = backend
            .start_watch(&spec(PipelineKind::Preload, dir.path(), None))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "no watch command configured for the preload pipeline"
        );
    }
}
