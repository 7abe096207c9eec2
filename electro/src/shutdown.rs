//! Maps OS signals to a session shutdown request.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self as nix_signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug)]
pub struct Shutdown {
    token: CancellationToken,
    last_signal: AtomicI32,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            last_signal: AtomicI32::new(0),
        })
    }

    /// Request shutdown on SIGINT, SIGTERM or SIGHUP. A second signal exits
    /// immediately with that signal's default disposition.
    pub fn install_signals(self: &Arc<Self>) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => Signal::SIGINT,
                    _ = sigterm.recv() => Signal::SIGTERM,
                    _ = sighup.recv() => Signal::SIGHUP,
                };

                if shutdown.last_signal().is_some() {
                    info!("Received second signal, forcing exit...");
                    shutdown.exit_process();
                }

                info!("Received {received:?}, shutting down...");
                shutdown.set_last_signal(received);
                shutdown.shutdown();
            }
        });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            signal => Signal::try_from(signal).ok(),
        }
    }

    pub fn set_last_signal(&self, signal: Signal) {
        self.last_signal.store(signal as i32, Ordering::Relaxed);
    }

    /// Re-raise the last signal with its default handler so the exit status
    /// reflects it.
    pub fn exit_process(&self) -> ! {
        let signal = self.last_signal().unwrap_or(Signal::SIGTERM);
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: restoring the default disposition installs no Rust handler.
        if let Err(err) = unsafe { nix_signal::sigaction(signal, &action) } {
            error!("Failed to restore default handler for {signal:?}: {err}");
        } else if let Err(err) = nix_signal::kill(unistd::getpid(), signal) {
            error!("Failed to re-raise {signal:?}: {err}");
        }
        std::process::exit(128 + signal as i32);
    }
}
