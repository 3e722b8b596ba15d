//! Load contexts for modules compiled into the host

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use modhost_plugin_api::PluginModule;
use tracing::debug;

use super::{LoadContext, LoadContextFactory, LoadedModule, ReloadCallback};
use crate::error::PluginHostError;
use crate::identity::PluginDir;

type ModuleFactory = Arc<dyn Fn() -> Box<dyn PluginModule> + Send + Sync>;

/// Serves plugin modules registered in-process, keyed by plugin directory
/// name (case-insensitive).
///
/// Registering a new factory under an existing name models a rebuilt
/// binary; [`notify_changed`](Self::notify_changed) then plays the part of
/// the file change detection a native context performs.
#[derive(Clone, Default)]
pub struct StaticLoader {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    modules: Mutex<HashMap<String, ModuleFactory>>,
    callbacks: Mutex<HashMap<PluginDir, ReloadCallback>>,
    loads: Mutex<HashMap<String, u64>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the module served for plugin directories named `dir_name`.
    pub fn register<F>(&self, dir_name: &str, factory: F) -> &Self
    where
        F: Fn() -> Box<dyn PluginModule> + Send + Sync + 'static,
    {
        self.inner
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dir_name.to_lowercase(), Arc::new(factory));
        self
    }

    pub fn unregister(&self, dir_name: &str) -> bool {
        self.inner
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dir_name.to_lowercase())
            .is_some()
    }

    /// Fire the reload callback registered for `plugin_dir`.
    ///
    /// Returns `false` when no context for that directory is listening.
    pub fn notify_changed(&self, plugin_dir: impl AsRef<Path>) -> bool {
        let key = PluginDir::new(plugin_dir);
        let callback = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        match callback {
            Some(reload) => {
                debug!(dir = %key, "Static module changed");
                reload();
                true
            }
            None => false,
        }
    }

    /// Whether a reload callback is registered for `plugin_dir`
    pub fn is_watching(&self, plugin_dir: impl AsRef<Path>) -> bool {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&PluginDir::new(plugin_dir))
    }

    /// Number of successful loads for plugin directories named `dir_name`
    pub fn load_count(&self, dir_name: &str) -> u64 {
        self.inner
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dir_name.to_lowercase())
            .copied()
            .unwrap_or(0)
    }
}

impl fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modules = self
            .inner
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        f.debug_struct("StaticLoader")
            .field("modules", &modules)
            .finish()
    }
}

impl LoadContextFactory for StaticLoader {
    fn create(
        &self,
        plugin_dir: &PluginDir,
        main_module: &Path,
    ) -> Result<Arc<dyn LoadContext>, PluginHostError> {
        Ok(Arc::new(StaticContext {
            inner: self.inner.clone(),
            plugin_dir: plugin_dir.clone(),
            main_module: main_module.to_path_buf(),
            generation: AtomicU64::new(0),
        }))
    }
}

struct StaticContext {
    inner: Arc<Inner>,
    plugin_dir: PluginDir,
    main_module: PathBuf,
    generation: AtomicU64,
}

impl LoadContext for StaticContext {
    fn main_module(&self) -> &Path {
        &self.main_module
    }

    fn load(&self) -> Result<Arc<LoadedModule>, PluginHostError> {
        let name = self.plugin_dir.name().to_lowercase();
        let factory = self
            .inner
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
            .ok_or_else(|| PluginHostError::LibraryNotFound {
                dir: self.plugin_dir.path().to_path_buf(),
            })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let module = factory();
        *self
            .inner
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_default() += 1;

        Ok(Arc::new(LoadedModule::in_process(
            module,
            self.main_module.clone(),
            generation,
        )))
    }

    fn set_reload_callback(&self, callback: Option<ReloadCallback>) {
        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match callback {
            Some(callback) => {
                callbacks.insert(self.plugin_dir.clone(), callback);
            }
            None => {
                callbacks.remove(&self.plugin_dir);
            }
        }
    }

    fn unload(&self) {
        self.set_reload_callback(None);
    }
}
