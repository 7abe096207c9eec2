pub mod fs;

pub use fs::{FileChangeEvent, FileWatcher, FileWatcherConfig, WatcherHandle};
