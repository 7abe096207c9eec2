mod cli;
mod log;
mod manifest;
mod shutdown;
mod watch;

use std::sync::Arc;

use clap::Parser;
use electro_session::{SessionController, SessionExit};
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::sync::Notify;
use tracing::info;

use crate::cli::Cli;
use crate::manifest::Manifest;
use crate::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init_tracing(cli.level(), cli.log_format);

    let shutdown = Shutdown::new();
    shutdown
        .install_signals()
        .into_diagnostic()
        .wrap_err("installing signal handlers")?;

    match run(&cli, &shutdown).await? {
        SessionExit::Crashed(code) => std::process::exit(code),
        SessionExit::Stopped | SessionExit::Reload => Ok(()),
    }
}

/// Run sessions until one ends for a reason other than a config change.
async fn run(cli: &Cli, shutdown: &Arc<Shutdown>) -> Result<SessionExit> {
    loop {
        let manifest = Manifest::load(&cli.config).wrap_err("loading manifest")?;
        let controller = SessionController::new(
            cli.config.clone(),
            manifest.options(),
            cli.renderer_only,
            manifest.services(&cli.config),
        );
        let reload = Arc::new(Notify::new());
        controller.set_on_restart({
            let reload = Arc::clone(&reload);
            move || reload.notify_one()
        });

        let start = controller.start();
        tokio::pin!(start);
        let started = tokio::select! {
            started = &mut start => started,
            _ = shutdown.wait_for_shutdown() => {
                controller.stop();
                // Let startup observe the stop and release what it holds.
                let _ = start.await;
                return Ok(SessionExit::Stopped);
            }
        };
        if let Err(err) = started {
            controller.stop();
            return Err(err);
        }

        let exit = tokio::select! {
            _ = reload.notified() => SessionExit::Reload,
            exit = controller.closed() => exit,
            _ = shutdown.wait_for_shutdown() => {
                controller.stop();
                SessionExit::Stopped
            }
        };

        match exit {
            SessionExit::Reload if !shutdown.is_cancelled() => {
                info!("starting a new session");
            }
            exit => return Ok(exit),
        }
    }
}
