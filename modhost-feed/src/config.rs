//! Feed configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default delay between two polls of a monitored feed
pub const DEFAULT_MONITORING_INTERVAL_MS: u64 = 20_000;

/// Where a [`DirectoryFeed`](crate::DirectoryFeed) reads from and how it is polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Feed root: `<source>/<name>/<version>/...`
    pub source: PathBuf,
    /// Whether prerelease versions are offered
    pub include_prereleases: bool,
    /// Milliseconds between polls when monitoring
    pub monitoring_interval_ms: u64,
    /// Lock record file
    pub lock_file: PathBuf,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            include_prereleases: false,
            monitoring_interval_ms: DEFAULT_MONITORING_INTERVAL_MS,
            lock_file: modhost_paths::feed_lock_file(),
        }
    }
}

impl FeedConfig {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_prereleases(mut self, include: bool) -> Self {
        self.include_prereleases = include;
        self
    }

    pub fn with_monitoring_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lock_file(mut self, lock_file: impl Into<PathBuf>) -> Self {
        self.lock_file = lock_file.into();
        self
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms.max(1))
    }

    /// Expand `~` and environment variables in the source, then anchor a
    /// relative source at `content_root`.
    pub fn resolve_source(mut self, content_root: &Path) -> Self {
        let expanded = modhost_core::expand_path(&self.source.to_string_lossy());
        self.source = if expanded.is_absolute() {
            expanded
        } else {
            content_root.join(expanded)
        };
        self
    }
}
