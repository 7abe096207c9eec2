//! Single-resolution signal with a timed waiter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("timed out after {}ms waiting for {name}", timeout.as_millis())]
pub struct LatchTimeout {
    pub name: String,
    pub timeout: Duration,
}

/// A latch that resolves at most once.
///
/// The first `signal` stores the value and wakes every waiter; later calls
/// are no-ops and the first value is kept. Clones share the same latch.
#[derive(Clone)]
pub struct OneShotLatch<T = ()> {
    name: Arc<str>,
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> fmt::Debug for OneShotLatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotLatch")
            .field("name", &self.name)
            .field("signaled", &self.tx.borrow().is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> OneShotLatch<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            name: name.into(),
            tx: Arc::new(tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve the latch. Returns `true` only for the call that resolved it.
    pub fn signal(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_signaled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current value, if the latch has resolved.
    pub fn value(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until the latch resolves.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        if let Ok(resolved) = rx.wait_for(Option::is_some).await
            && let Some(value) = resolved.as_ref()
        {
            return value.clone();
        }
        // The sender lives as long as `self`, so the channel cannot close here.
        std::future::pending().await
    }

    /// Wait until the latch resolves, failing after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, LatchTimeout> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| LatchTimeout {
                name: self.name.to_string(),
                timeout,
            })
    }
}
