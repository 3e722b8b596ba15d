//! PluginHandle - lifecycle of one plugin directory

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use modhost_plugin_api::TypeInfo;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PluginsConfig;
use crate::error::PluginHostError;
use crate::executor::TaskExecutor;
use crate::gate::{GateState, ReadinessGate};
use crate::identity::{ModuleIdentity, PluginDir};
use crate::loader::{
    Implementation, LoadContext, LoadContextFactory, LoadedModule, PluginContainer,
};

const UNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One plugin: its directory, its load context and the container of the
/// currently loaded module generation.
///
/// Identity is the directory path alone. Queries wait while a load is in
/// progress and fail once the handle is disposed.
pub struct PluginHandle {
    dir: PluginDir,
    config: Arc<PluginsConfig>,
    context: Arc<dyn LoadContext>,
    current: RwLock<Option<Arc<PluginContainer>>>,
    gate: ReadinessGate,
    loading: Mutex<()>,
    disposed: AtomicBool,
}

impl PluginHandle {
    /// Create an unloaded handle for `dir`.
    pub fn new(
        dir: impl Into<PluginDir>,
        config: Arc<PluginsConfig>,
        factory: &dyn LoadContextFactory,
    ) -> Result<Arc<Self>, PluginHostError> {
        let dir = dir.into();
        let main_module = config.main_module(dir.path());
        let context = factory.create(&dir, &main_module)?;

        Ok(Arc::new(Self {
            dir,
            config,
            context,
            current: RwLock::new(None),
            gate: ReadinessGate::new(),
            loading: Mutex::new(()),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Reload through `executor` whenever the load context reports a change.
    ///
    /// Does nothing when hot reload is disabled or outside a tokio runtime.
    pub fn enable_hot_reload(self: &Arc<Self>, executor: TaskExecutor) {
        if !self.config.hot_reload() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(dir = %self.dir, "No async runtime, hot reload disabled");
            return;
        };

        let weak = Arc::downgrade(self);
        let label = format!("reload {}", self.dir);
        self.context.set_reload_callback(Some(Arc::new(move || {
            let Some(handle) = weak.upgrade() else {
                return;
            };
            let _runtime = runtime.enter();
            executor.execute(label.clone(), move || {
                let handle = handle.clone();
                async move {
                    match handle.load().await {
                        Err(PluginHostError::Disposed { .. }) => Ok(()),
                        other => other,
                    }
                }
            });
        })));
    }

    pub fn dir(&self) -> &PluginDir {
        &self.dir
    }

    pub fn main_module(&self) -> &Path {
        self.context.main_module()
    }

    /// Case-insensitive path comparison with this handle's directory
    pub fn resides_in(&self, path: impl AsRef<Path>) -> bool {
        self.dir.matches(path)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.current_container().is_some()
    }

    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    /// Load (or reload) the module and swap in a new container.
    ///
    /// The readiness gate is closed for the duration. When a reload fails,
    /// the previous container stays installed.
    pub async fn load(self: &Arc<Self>) -> Result<(), PluginHostError> {
        let _loading = self.loading.lock().await;
        if self.is_disposed() {
            return Err(self.disposed_error());
        }

        let start = Instant::now();
        self.gate.reset();

        let this = Arc::clone(self);
        let built = match tokio::task::spawn_blocking(move || this.build_container()).await {
            Ok(built) => built,
            Err(join) => Err(PluginHostError::Panicked(join.to_string())),
        };

        match built {
            Ok(container) => {
                let container = Arc::new(container);
                let identity = container.identity().clone();
                let generation = container.generation();
                let previous = self.swap(Some(container));
                self.gate.open();

                info!(
                    plugin = %identity.name,
                    version = %identity.version,
                    dir = %self.dir,
                    generation,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Plugin loaded"
                );
                drop(previous);
                Ok(())
            }
            Err(e) => {
                if self.is_loaded() {
                    self.gate.open();
                }
                Err(e)
            }
        }
    }

    /// The current container, waiting until the handle is ready.
    pub async fn container(&self) -> Result<Arc<PluginContainer>, PluginHostError> {
        match self.gate.wait().await {
            GateState::Disposed => Err(self.disposed_error()),
            _ => self.current_container().ok_or_else(|| self.disposed_error()),
        }
    }

    /// Every module-exported implementation of `C`
    pub async fn find_implementations_of<C>(&self) -> Result<Vec<Implementation<C>>, PluginHostError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        Ok(self.container().await?.implementations_of::<C>())
    }

    pub async fn types_implementing<C>(&self) -> Result<Vec<TypeInfo>, PluginHostError>
    where
        C: ?Sized + 'static,
    {
        Ok(self.container().await?.types_implementing::<C>())
    }

    pub async fn find_type(&self, type_name: &str) -> Result<Option<TypeInfo>, PluginHostError> {
        Ok(self.container().await?.find_type(type_name))
    }

    /// The module-exported implementation of `C` registered as `type_name`.
    pub async fn implementation<C>(&self, type_name: &str) -> Result<Implementation<C>, PluginHostError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.container().await?.implementation::<C>(type_name)
    }

    /// Identity of the currently loaded generation. Does not wait.
    pub fn identity(&self) -> Result<ModuleIdentity, PluginHostError> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        self.current_container()
            .map(|c| c.identity().clone())
            .ok_or_else(|| PluginHostError::VersionUnavailable {
                module: self.main_module().to_path_buf(),
            })
    }

    /// Tear down the container, detach from reload notifications, release
    /// the load context and wait a bounded time for the module to be freed.
    ///
    /// Idempotent. Never fails; a module that is still referenced is only
    /// reported.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _loading = self.loading.lock().await;
        self.gate.dispose();

        let container = self.swap(None);
        let module = container.as_ref().map(|c| Arc::downgrade(c.module()));
        drop(container);

        let context = self.context.clone();
        let unloaded = tokio::task::spawn_blocking(move || {
            context.set_reload_callback(None);
            context.unload();
        })
        .await;
        if let Err(e) = unloaded {
            warn!(dir = %self.dir, error = %e, "Load context unload panicked");
        }

        if let Some(module) = module {
            self.confirm_released(module).await;
        }
        debug!(dir = %self.dir, "Plugin disposed");
    }

    async fn confirm_released(&self, module: Weak<LoadedModule>) {
        for _ in 0..self.config.unload_attempts() {
            if module.strong_count() == 0 {
                return;
            }
            tokio::time::sleep(UNLOAD_POLL_INTERVAL).await;
        }

        let references = module.strong_count();
        if references > 0 {
            warn!(
                dir = %self.dir,
                references,
                "Plugin module still referenced after dispose; it stays loaded until released"
            );
        }
    }

    fn build_container(&self) -> Result<PluginContainer, PluginHostError> {
        let module = self.context.load()?;
        PluginContainer::build(module, &self.config, &self.dir)
    }

    fn current_container(&self) -> Option<Arc<PluginContainer>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, next: Option<Arc<PluginContainer>>) -> Option<Arc<PluginContainer>> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }

    fn disposed_error(&self) -> PluginHostError {
        PluginHostError::Disposed {
            dir: self.dir.path().to_path_buf(),
        }
    }
}

impl PartialEq for PluginHandle {
    fn eq(&self, other: &Self) -> bool {
        self.dir == other.dir
    }
}

impl Eq for PluginHandle {}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("dir", &self.dir)
            .field("state", &self.gate.state())
            .field("identity", &self.identity().ok())
            .finish()
    }
}
