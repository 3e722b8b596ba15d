//! PluginTable - every loaded plugin, keyed by directory

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use semver::Version;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::PluginHostError;
use crate::gate::{GateState, ReadinessGate};
use crate::handle::PluginHandle;
use crate::identity::{ModuleIdentity, PluginDir, QualifiedTypeName};
use crate::loader::Implementation;

/// A module-exported type together with the module that exports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedType {
    pub qualified: QualifiedTypeName,
    pub module: ModuleIdentity,
    pub contract_name: &'static str,
}

/// Thread-safe collection of [`PluginHandle`]s with at most one handle per
/// directory.
///
/// Capability queries wait until [`mark_initial_load_complete`](Self::mark_initial_load_complete)
/// has been called. They work on a snapshot of the handles taken under the
/// read lock, so a handle that is mid-reload never holds up writers.
#[derive(Debug, Default)]
pub struct PluginTable {
    handles: RwLock<HashMap<PluginDir, Arc<PluginHandle>>>,
    initial_load: ReadinessGate,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle`. Returns `false`, leaving the table unchanged, if a
    /// handle for the same directory is already present.
    pub async fn add(&self, handle: Arc<PluginHandle>) -> bool {
        let mut handles = self.handles.write().await;
        if handles.contains_key(handle.dir()) {
            debug!(dir = %handle.dir(), "Plugin already present");
            return false;
        }
        debug!(dir = %handle.dir(), "Plugin added");
        handles.insert(handle.dir().clone(), handle);
        true
    }

    /// Remove the handle residing in `path` and dispose it.
    ///
    /// The handle leaves the table before it is disposed.
    pub async fn remove(&self, path: impl AsRef<Path>) -> bool {
        let key = PluginDir::new(path);
        let removed = self.handles.write().await.remove(&key);
        match removed {
            Some(handle) => {
                handle.dispose().await;
                info!(dir = %key, "Plugin removed");
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.handles.read().await.contains_key(&PluginDir::new(path))
    }

    pub async fn get(&self, path: impl AsRef<Path>) -> Option<Arc<PluginHandle>> {
        self.handles.read().await.get(&PluginDir::new(path)).cloned()
    }

    /// Whether `version` would be an upgrade for the module named `name`.
    ///
    /// `true` when no loaded module has that name, or every loaded module with
    /// that name has a strictly lower version.
    pub async fn is_newer_version(&self, name: &str, version: &Version) -> bool {
        self.handles
            .read()
            .await
            .values()
            .filter_map(|handle| handle.identity().ok())
            .filter(|identity| identity.is_named(name))
            .all(|identity| identity.version < *version)
    }

    /// Every module-exported implementation of `C` across all plugins.
    pub async fn implementations_of<C>(&self) -> Vec<Implementation<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        if self.initial_load.wait().await == GateState::Disposed {
            return Vec::new();
        }

        let mut found = Vec::new();
        for handle in self.handles().await {
            match handle.find_implementations_of::<C>().await {
                Ok(mut implementations) => found.append(&mut implementations),
                Err(e) => debug!(dir = %handle.dir(), error = %e, "Skipping plugin"),
            }
        }
        found
    }

    /// Every module-exported type registered for `C` across all plugins.
    pub async fn types_implementing<C>(&self) -> Vec<ExportedType>
    where
        C: ?Sized + 'static,
    {
        if self.initial_load.wait().await == GateState::Disposed {
            return Vec::new();
        }

        let mut found = Vec::new();
        for handle in self.handles().await {
            let Ok(container) = handle.container().await else {
                continue;
            };
            let module = container.identity().clone();
            found.extend(container.types_implementing::<C>().into_iter().map(|info| {
                ExportedType {
                    qualified: QualifiedTypeName {
                        type_name: info.name().to_string(),
                        module: module.name.clone(),
                    },
                    module: module.clone(),
                    contract_name: info.contract_name(),
                }
            }));
        }
        found
    }

    /// Resolve one implementation by its `"TypeName, ModuleName"` qualified name.
    pub async fn implementation<C>(&self, qualified: &str) -> Result<Implementation<C>, PluginHostError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let name = QualifiedTypeName::parse(qualified)?;
        if self.initial_load.wait().await == GateState::Disposed {
            return Err(PluginHostError::PluginNotFound {
                module: name.module,
            });
        }

        let handle = self
            .handles()
            .await
            .into_iter()
            .find(|handle| {
                handle
                    .identity()
                    .is_ok_and(|identity| identity.is_named(&name.module))
            })
            .ok_or_else(|| PluginHostError::PluginNotFound {
                module: name.module.clone(),
            })?;
        handle.implementation::<C>(&name.type_name).await
    }

    /// Release queries waiting on the initial load. Idempotent.
    pub fn mark_initial_load_complete(&self) {
        if self.initial_load.open() {
            info!("Initial plugin load complete");
        }
    }

    pub fn is_initial_load_complete(&self) -> bool {
        self.initial_load.state() == GateState::Ready
    }

    pub async fn wait_for_initial_load(&self) {
        self.initial_load.wait().await;
    }

    /// Snapshot of every handle
    pub async fn handles(&self) -> Vec<Arc<PluginHandle>> {
        self.handles.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }

    /// Dispose every handle and clear the table. Teardown only.
    pub async fn dispose(&self) {
        let drained: Vec<_> = self.handles.write().await.drain().map(|(_, h)| h).collect();
        self.initial_load.dispose();
        let count = drained.len();
        for handle in drained {
            handle.dispose().await;
        }
        debug!(count, "Plugin table disposed");
    }
}
