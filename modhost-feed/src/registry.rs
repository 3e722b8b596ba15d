//! FeedRegistry - a [`PluginRegistry`] backed by a directory feed

use std::sync::Arc;

use async_trait::async_trait;
use modhost_core::{
    EntryCallback, EntryStream, PluginRegistry, RegistryEntry, RegistryError,
    RegistrySubscription,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::feed::{DirectoryFeed, FeedEntry};
use crate::lock::{LockRecord, PackageLock};
use crate::monitor::FeedMonitor;

pub struct FeedRegistry {
    feed: Arc<DirectoryFeed>,
    lock: Arc<Mutex<PackageLock>>,
    monitor: Arc<FeedMonitor>,
}

impl FeedRegistry {
    /// Open the feed described by `config`, loading its lock record.
    pub async fn open(config: &FeedConfig) -> Self {
        let feed = Arc::new(DirectoryFeed::new(&config.source, config.include_prereleases));
        let lock = Arc::new(Mutex::new(PackageLock::load(&config.lock_file).await));
        let monitor = Arc::new(FeedMonitor::new(
            feed.clone(),
            lock.clone(),
            config.monitoring_interval(),
        ));
        Self {
            feed,
            lock,
            monitor,
        }
    }

    pub fn feed(&self) -> &DirectoryFeed {
        &self.feed
    }

    /// Snapshot of the lock records
    pub async fn lock_records(&self) -> Vec<LockRecord> {
        self.lock.lock().await.records().to_vec()
    }
}

impl std::fmt::Debug for FeedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRegistry")
            .field("source", &self.feed.source())
            .field("monitoring", &self.monitor.is_running())
            .finish()
    }
}

struct FeedSubscription(Arc<FeedMonitor>);

#[async_trait]
impl RegistrySubscription for FeedSubscription {
    async fn stop(self: Box<Self>) {
        self.0.stop().await;
    }
}

#[async_trait]
impl PluginRegistry for FeedRegistry {
    fn supports_monitoring(&self) -> bool {
        true
    }

    /// Every latest package, recording each in the lock.
    async fn latest_entries(&self, cancel: CancellationToken) -> Result<EntryStream, RegistryError> {
        if cancel.is_cancelled() {
            return Err(FeedError::Cancelled.into());
        }
        let packages = self.feed.list_latest().await?;
        {
            let mut lock = self.lock.lock().await;
            lock.update_all(&packages);
            lock.save().await?;
        }

        let entries: Vec<Result<Arc<dyn RegistryEntry>, RegistryError>> = packages
            .into_iter()
            .map(|package| Ok(Arc::new(FeedEntry::new(package)) as Arc<dyn RegistryEntry>))
            .collect();
        Ok(Box::pin(tokio_stream::iter(entries)))
    }

    async fn start_monitoring(
        &self,
        on_entry_changed: EntryCallback,
    ) -> Result<Box<dyn RegistrySubscription>, RegistryError> {
        self.monitor.start(on_entry_changed)?;
        Ok(Box::new(FeedSubscription(self.monitor.clone())))
    }
}
