pub mod list;
pub mod lock;
pub mod serve;

use std::sync::Arc;

use modhost_core::{NoOpRegistry, PluginRegistry};
use modhost_feed::FeedRegistry;
use tracing::debug;

use crate::config::ModhostConfig;

/// The feed registry when a feed is configured, otherwise none.
pub async fn registry(config: &ModhostConfig) -> Arc<dyn PluginRegistry> {
    match config.feed_config() {
        Some(feed) => {
            debug!(source = %feed.source.display(), "Using plugin feed");
            Arc::new(FeedRegistry::open(&feed).await)
        }
        None => Arc::new(NoOpRegistry),
    }
}
