//! External plugin registry collaborator
//!
//! A registry is a source of plugin versions independent of the local root
//! directory. The host only looks at an entry's name and version and asks
//! it to materialize its content into a plugin directory.

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;

/// One available plugin version
#[async_trait]
pub trait RegistryEntry: Send + Sync {
    /// Plugin name; also the directory name under the plugin root
    fn name(&self) -> &str;

    fn version(&self) -> &Version;

    /// Write the plugin's content into `target`, which already exists.
    async fn materialize(&self, target: &Path, cancel: &CancellationToken)
    -> Result<(), RegistryError>;
}

impl fmt::Display for dyn RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name(), self.version())
    }
}

impl fmt::Debug for dyn RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name())
            .field("version", &self.version().to_string())
            .finish()
    }
}

/// Stream of the latest version of every entry
pub type EntryStream =
    Pin<Box<dyn Stream<Item = Result<Arc<dyn RegistryEntry>, RegistryError>> + Send>>;

/// Invoked by a monitoring registry for every changed entry
pub type EntryCallback = Arc<dyn Fn(Arc<dyn RegistryEntry>) + Send + Sync>;

/// A running change subscription
#[async_trait]
pub trait RegistrySubscription: Send {
    /// Stop delivering changes and wait for the monitor to wind down.
    async fn stop(self: Box<Self>);
}

#[async_trait]
pub trait PluginRegistry: Send + Sync {
    /// Whether [`start_monitoring`](Self::start_monitoring) is supported
    fn supports_monitoring(&self) -> bool {
        false
    }

    /// The latest version of every entry the registry knows.
    async fn latest_entries(&self, cancel: CancellationToken) -> Result<EntryStream, RegistryError>;

    /// Start delivering changed entries to `on_entry_changed`.
    async fn start_monitoring(
        &self,
        _on_entry_changed: EntryCallback,
    ) -> Result<Box<dyn RegistrySubscription>, RegistryError> {
        Err(RegistryError::msg("registry does not support monitoring"))
    }
}

/// Registry without entries; the default when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpRegistry;

#[async_trait]
impl PluginRegistry for NoOpRegistry {
    async fn latest_entries(&self, _cancel: CancellationToken) -> Result<EntryStream, RegistryError> {
        Ok(Box::pin(tokio_stream::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    struct Fixed(Version);

    #[async_trait]
    impl RegistryEntry for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn version(&self) -> &Version {
            &self.0
        }
        async fn materialize(
            &self,
            _target: &Path,
            _cancel: &CancellationToken,
        ) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_noop_registry_is_empty_and_not_monitorable() {
        let registry = NoOpRegistry;
        assert!(!registry.supports_monitoring());

        let mut entries = registry
            .latest_entries(CancellationToken::new())
            .await
            .unwrap();
        assert!(entries.next().await.is_none());

        let callback: EntryCallback = Arc::new(|_| {});
        assert!(registry.start_monitoring(callback).await.is_err());
    }

    #[test]
    fn test_entry_display() {
        let entry: Arc<dyn RegistryEntry> = Arc::new(Fixed(Version::new(1, 5, 0)));
        assert_eq!(entry.to_string(), "fixed v1.5.0");
    }
}
