use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::latch::LatchTimeout;
use crate::pipeline::PipelineKind;

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("{pipeline} pipeline did not finish its initial build")]
    #[diagnostic(help("check the {pipeline} watch command output for a stalled build"))]
    InitialBuildTimeout {
        pipeline: PipelineKind,
        #[source]
        source: LatchTimeout,
    },
    #[error("{pipeline} pipeline failed its initial build: {message}")]
    InitialBuildFailed {
        pipeline: PipelineKind,
        message: String,
    },
    #[error("session was stopped during startup")]
    StoppedDuringStartup,
    #[error("session already started")]
    AlreadyStarted,
}

#[derive(Debug, Error, Diagnostic)]
pub enum LaunchError {
    #[error("failed to spawn `{program}` for {}", entry.display())]
    Spawn {
        program: String,
        entry: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("launcher refused to start {}: {reason}", entry.display())]
    Refused { entry: PathBuf, reason: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum BackendError {
    #[error("no watch command configured for the {0} pipeline")]
    #[diagnostic(help("add a `watch` command for it to the manifest"))]
    NotConfigured(PipelineKind),
    #[error("failed to spawn the {pipeline} watch command `{command}`")]
    Spawn {
        pipeline: PipelineKind,
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare output directory {}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
