use std::path::{Path, PathBuf};

use async_trait::async_trait;
use electro_event_sources::{FileWatcher, FileWatcherConfig};
use electro_session::{FileWatchProvider, PathWatch};

/// Watches individual files with the OS file watcher.
pub struct EventSourceWatchProvider;

#[async_trait]
impl FileWatchProvider for EventSourceWatchProvider {
    async fn watch(&self, paths: &[PathBuf]) -> miette::Result<Box<dyn PathWatch>> {
        let watcher = FileWatcher::new(
            FileWatcherConfig {
                paths,
                ..Default::default()
            },
            "config",
        )
        .await;
        Ok(Box::new(EventSourceWatch { watcher }))
    }
}

struct EventSourceWatch {
    watcher: FileWatcher,
}

#[async_trait]
impl PathWatch for EventSourceWatch {
    async fn next_change(&mut self) -> Option<PathBuf> {
        self.watcher.recv().await.map(|event| event.path)
    }

    fn unwatch(&mut self, path: &Path) {
        self.watcher.handle().unwatch(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reports_change_of_watched_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("electro.yaml");
        std::fs::write(&config, "name: a\n").unwrap();
        let config = config.canonicalize().unwrap();

        let mut watch = EventSourceWatchProvider
            .watch(std::slice::from_ref(&config))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&config, "name: b\n").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(10), watch.next_change())
            .await
            .unwrap();
        assert_eq!(changed, Some(config.clone()));
        watch.unwatch(&config);
    }
}
