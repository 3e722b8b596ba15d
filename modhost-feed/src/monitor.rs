//! Polling feed monitor

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use modhost_core::{EntryCallback, RegistryEntry};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::FeedError;
use crate::feed::{DirectoryFeed, FeedEntry};
use crate::lock::PackageLock;

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Polls a feed and reports packages that moved past the lock record.
pub struct FeedMonitor {
    feed: Arc<DirectoryFeed>,
    lock: Arc<Mutex<PackageLock>>,
    interval: Duration,
    running: StdMutex<Option<Running>>,
}

impl FeedMonitor {
    pub fn new(feed: Arc<DirectoryFeed>, lock: Arc<Mutex<PackageLock>>, interval: Duration) -> Self {
        Self {
            feed,
            lock,
            interval,
            running: StdMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start polling. Every updated package is passed to `callback`.
    pub fn start(&self, callback: EntryCallback) -> Result<(), FeedError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(FeedError::AlreadyStarted);
        }

        info!(
            source = %self.feed.source().display(),
            interval_ms = self.interval.as_millis() as u64,
            "Monitoring plugin feed"
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            self.feed.clone(),
            self.lock.clone(),
            self.interval,
            callback,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop polling and wait for the loop to finish. No-op when not running.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { cancel, task }) = running else {
            return;
        };

        debug!("Stopping feed monitor");
        cancel.cancel();
        if let Err(e) = task.await
            && e.is_panic()
        {
            warn!(error = %e, "Feed monitor panicked");
        }
    }
}

async fn poll_loop(
    feed: Arc<DirectoryFeed>,
    lock: Arc<Mutex<PackageLock>>,
    interval: Duration,
    callback: EntryCallback,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        trace!("Looking for updated plugins");
        match poll_once(&feed, &lock).await {
            Ok(updated) => {
                for entry in updated {
                    if cancel.is_cancelled() {
                        break;
                    }
                    debug!(package = %entry.package(), "Feed package updated");
                    callback(Arc::new(entry) as Arc<dyn RegistryEntry>);
                }
            }
            Err(e) => warn!(source = %feed.source().display(), error = %e, "Feed poll failed"),
        }
    }
    debug!("Feed monitor stopped");
}

async fn poll_once(feed: &DirectoryFeed, lock: &Mutex<PackageLock>) -> Result<Vec<FeedEntry>, FeedError> {
    let latest = feed.list_latest().await?;
    let mut lock = lock.lock().await;
    let updated = lock.update_all(&latest);
    lock.save().await?;
    Ok(updated.into_iter().map(FeedEntry::new).collect())
}
