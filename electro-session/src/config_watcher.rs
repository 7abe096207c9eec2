//! Watches config sources and requests a full session reload when they change.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::debounce::Debouncer;
use crate::session::SessionEvent;

/// Source of file-change notifications.
#[async_trait]
pub trait FileWatchProvider: Send + Sync {
    async fn watch(&self, paths: &[PathBuf]) -> miette::Result<Box<dyn PathWatch>>;
}

/// A set of watched paths yielding change events keyed by absolute path.
#[async_trait]
pub trait PathWatch: Send {
    /// Next changed path, or `None` once the watch has ended.
    async fn next_change(&mut self) -> Option<PathBuf>;
    fn unwatch(&mut self, path: &Path);
}

fn hash_file(path: &Path) -> Option<blake3::Hash> {
    let content = std::fs::read(path).ok()?;
    Some(blake3::hash(&content))
}

fn absolute(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}

pub struct ConfigWatcher {
    paths: BTreeSet<PathBuf>,
    debouncer: Arc<Debouncer>,
    token: CancellationToken,
}

impl ConfigWatcher {
    pub async fn spawn(
        provider: &dyn FileWatchProvider,
        paths: BTreeSet<PathBuf>,
        debounce: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> miette::Result<Self> {
        let paths: BTreeSet<PathBuf> = paths.into_iter().map(absolute).collect();
        let watched: Vec<PathBuf> = paths.iter().cloned().collect();
        let mut watch = provider.watch(&watched).await?;

        let debouncer = Arc::new(Debouncer::new(debounce));
        let token = CancellationToken::new();
        let mut hashes: HashMap<PathBuf, Option<blake3::Hash>> = watched
            .iter()
            .map(|path| (path.clone(), hash_file(path)))
            .collect();

        tokio::spawn({
            let debouncer = Arc::clone(&debouncer);
            let token = token.clone();
            async move {
                loop {
                    let changed = tokio::select! {
                        _ = token.cancelled() => break,
                        changed = watch.next_change() => changed,
                    };
                    let Some(path) = changed else { break };
                    if !hashes.contains_key(&path) {
                        continue;
                    }

                    let hash = hash_file(&path);
                    let previous = hashes.insert(path.clone(), hash).flatten();
                    if let (Some(old), Some(new)) = (previous, hash)
                        && old == new
                    {
                        debug!(path = %path.display(), "config content unchanged, ignoring");
                        continue;
                    }
                    if token.is_cancelled() {
                        break;
                    }

                    debug!(path = %path.display(), "config source changed");
                    let events = events.clone();
                    let token = token.clone();
                    debouncer.trigger(async move {
                        if token.is_cancelled() {
                            return;
                        }
                        info!(path = %path.display(), "config changed, reloading session");
                        let _ = events.send(SessionEvent::ConfigChanged { path });
                    });
                }
                for path in &watched {
                    watch.unwatch(path);
                }
            }
        });

        Ok(Self {
            paths,
            debouncer,
            token,
        })
    }

    pub fn paths(&self) -> &BTreeSet<PathBuf> {
        &self.paths
    }

    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Cancel the pending reload, if any, and unwatch every path.
    pub fn stop(&self) {
        self.debouncer.cancel();
        self.token.cancel();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ChannelProvider {
        sender: Mutex<Option<mpsc::UnboundedSender<PathBuf>>>,
        unwatched: Arc<Mutex<Vec<PathBuf>>>,
    }

    struct ChannelWatch {
        rx: mpsc::UnboundedReceiver<PathBuf>,
        unwatched: Arc<Mutex<Vec<PathBuf>>>,
    }

    #[async_trait]
    impl FileWatchProvider for ChannelProvider {
        async fn watch(&self, _paths: &[PathBuf]) -> miette::Result<Box<dyn PathWatch>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.sender.lock().unwrap() = Some(tx);
            Ok(Box::new(ChannelWatch {
                rx,
                unwatched: self.unwatched.clone(),
            }))
        }
    }

    #[async_trait]
    impl PathWatch for ChannelWatch {
        async fn next_change(&mut self) -> Option<PathBuf> {
            self.rx.recv().await
        }

        fn unwatch(&mut self, path: &Path) {
            self.unwatched.lock().unwrap().push(path.to_path_buf());
        }
    }

    impl ChannelProvider {
        fn change(&self, path: &Path) {
            let sender = self.sender.lock().unwrap();
            sender.as_ref().unwrap().send(path.to_path_buf()).unwrap();
        }
    }

    async fn watcher(
        provider: &ChannelProvider,
        paths: &[PathBuf],
    ) -> (ConfigWatcher, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = ConfigWatcher::spawn(
            provider,
            paths.iter().cloned().collect(),
            Duration::from_millis(300),
            tx,
        )
        .await
        .unwrap();
        (watcher, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_changes_reloads_once() {
        let provider = ChannelProvider::default();
        let config = PathBuf::from("/app/electro.config.ts");
        let (watcher, mut events) = watcher(&provider, &[config.clone()]).await;

        for _ in 0..3 {
            provider.change(&config);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(watcher.is_pending());
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::ConfigChanged { path: config }
        );
        assert!(events.try_recv().is_err());
        assert!(!watcher.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatched_paths_are_ignored() {
        let provider = ChannelProvider::default();
        let (_watcher, mut events) = watcher(&provider, &[PathBuf::from("/app/electro.config.ts")]).await;

        provider.change(Path::new("/app/src/main/index.ts"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_content_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("electro.config.ts");
        std::fs::write(&config, "export default {}").unwrap();
        let config = config.canonicalize().unwrap();
        let provider = ChannelProvider::default();
        let (_watcher, mut events) = watcher(&provider, &[config.clone()]).await;

        // Rewritten with identical content.
        std::fs::write(&config, "export default {}").unwrap();
        provider.change(&config);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());

        std::fs::write(&config, "export default { name: 'app' }").unwrap();
        provider.change(&config);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::ConfigChanged { path: config }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reload_and_unwatches() {
        let provider = ChannelProvider::default();
        let config = PathBuf::from("/app/electro.config.ts");
        let (watcher, mut events) = watcher(&provider, &[config.clone()]).await;

        provider.change(&config);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(watcher.is_pending());

        watcher.stop();
        assert!(!watcher.is_pending());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(*provider.unwatched.lock().unwrap(), vec![config]);
    }
}
