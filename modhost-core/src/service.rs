//! PluginService - startup and shutdown of the plugin host
//!
//! # Startup
//!
//! 1. Ensure the plugin root exists
//! 2. Load every plugin directory already present (bounded, retried)
//! 3. Apply the registry's latest entries that are newer than what is loaded
//! 4. Start directory and registry monitoring, unless cancelled
//! 5. Open the table's initial-load gate
//!
//! Startup runs in the background; a failure is logged and leaves the
//! service [`Failed`](ServiceState::Failed) with whatever was loaded. The
//! initial-load gate opens either way.
//!
//! # Shutdown
//!
//! Cancel, stop directory monitoring, stop the registry subscription, wait
//! for startup, drain background operations, dispose the table.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Instant;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PluginsConfig;
use crate::error::PluginHostError;
use crate::executor::{ErrorSink, TaskExecutor, log_errors};
use crate::handle::PluginHandle;
use crate::identity::PluginDir;
use crate::loader::{LoadContextFactory, NativeLoader};
use crate::registry::{
    EntryCallback, NoOpRegistry, PluginRegistry, RegistryEntry, RegistrySubscription,
};
use crate::table::PluginTable;
use crate::watcher::{DirectoryChange, RootDirectory};

/// Lifecycle of a [`PluginService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Startup failed; the service keeps serving what was loaded
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Created => "created",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Builder for [`PluginService`]
pub struct PluginServiceBuilder {
    config: PluginsConfig,
    loader: Option<Arc<dyn LoadContextFactory>>,
    registry: Arc<dyn PluginRegistry>,
    on_error: ErrorSink,
    shutdown: Option<CancellationToken>,
}

impl PluginServiceBuilder {
    /// Load context factory. Defaults to a [`NativeLoader`].
    pub fn loader(mut self, loader: Arc<dyn LoadContextFactory>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// External registry. Defaults to [`NoOpRegistry`].
    pub fn registry(mut self, registry: Arc<dyn PluginRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Receiver of per-item failures. Defaults to logging them.
    pub fn error_sink(mut self, on_error: ErrorSink) -> Self {
        self.on_error = on_error;
        self
    }

    /// External shutdown signal; cancelling it cancels the service.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> PluginService {
        let cancel = match &self.shutdown {
            Some(shutdown) => shutdown.child_token(),
            None => CancellationToken::new(),
        };
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(NativeLoader::new(self.config.hot_reload())));
        let executor = TaskExecutor::new(self.config.executor(), cancel.clone(), self.on_error.clone());
        let (state, _) = watch::channel(ServiceState::Created);

        PluginService {
            inner: Arc::new(Inner {
                root: RootDirectory::new(self.config.root_dir()),
                config: Arc::new(self.config),
                table: Arc::new(PluginTable::new()),
                loader,
                registry: self.registry,
                executor,
                on_error: self.on_error,
                cancel,
                state,
                subscription: Mutex::new(None),
                pump: StdMutex::new(None),
            }),
            startup: StdMutex::new(None),
        }
    }
}

/// Hosts the plugins under the configured root directory.
pub struct PluginService {
    inner: Arc<Inner>,
    startup: StdMutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: Arc<PluginsConfig>,
    root: RootDirectory,
    table: Arc<PluginTable>,
    loader: Arc<dyn LoadContextFactory>,
    registry: Arc<dyn PluginRegistry>,
    executor: TaskExecutor,
    on_error: ErrorSink,
    cancel: CancellationToken,
    state: watch::Sender<ServiceState>,
    subscription: Mutex<Option<Box<dyn RegistrySubscription>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl PluginService {
    pub fn builder(config: PluginsConfig) -> PluginServiceBuilder {
        PluginServiceBuilder {
            config,
            loader: None,
            registry: Arc::new(NoOpRegistry),
            on_error: log_errors(),
            shutdown: None,
        }
    }

    pub fn config(&self) -> &PluginsConfig {
        &self.inner.config
    }

    /// The plugin table consumers query
    pub fn plugins(&self) -> &Arc<PluginTable> {
        &self.inner.table
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    /// Wait until the initial load finished (successfully or not).
    pub async fn wait_for_initial_load(&self) {
        self.inner.table.wait_for_initial_load().await;
    }

    /// Begin startup in the background. Fails only if already started.
    pub async fn start(&self) -> Result<(), PluginHostError> {
        if !self
            .inner
            .transition(&[ServiceState::Created], ServiceState::Starting)
        {
            return Err(PluginHostError::InvalidState {
                expected: ServiceState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(root = %self.inner.root.path().display(), "Starting plugin services");
        let task = tokio::spawn(run_startup(self.inner.clone()));
        *self.startup.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Stop monitoring, wait for in-flight work and dispose every plugin.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let previous = *inner.state.borrow();
        match previous {
            ServiceState::Stopping | ServiceState::Stopped => return,
            ServiceState::Created => {
                inner.transition(&[ServiceState::Created], ServiceState::Stopped);
                return;
            }
            _ => {}
        }
        inner.transition(
            &[ServiceState::Starting, ServiceState::Running, ServiceState::Failed],
            ServiceState::Stopping,
        );

        info!("Stopping plugin services");
        inner.cancel.cancel();

        let subscription = {
            let mut subscription = inner.subscription.lock().await;
            inner.root.stop_monitoring();
            subscription.take()
        };
        let pump = inner.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        if let Some(subscription) = subscription {
            subscription.stop().await;
        }

        let startup = self.startup.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(startup) = startup
            && let Err(e) = startup.await
            && e.is_panic()
        {
            error!(error = %e, "Plugin startup task panicked");
        }

        inner.executor.drain().await;
        inner.table.dispose().await;
        inner.transition(&[ServiceState::Stopping], ServiceState::Stopped);
        info!("Plugin services stopped");
    }
}

impl fmt::Debug for PluginService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginService")
            .field("state", &self.state())
            .field("root", &self.inner.root)
            .finish()
    }
}

async fn run_startup(inner: Arc<Inner>) {
    let start = Instant::now();
    let result = inner.startup().await;
    inner.table.mark_initial_load_complete();

    match result {
        Ok(()) => {
            inner.transition(&[ServiceState::Starting], ServiceState::Running);
            let plugins = inner.table.len().await;
            info!(
                plugins,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Plugin services started"
            );
        }
        Err(PluginHostError::Cancelled) => debug!("Plugin startup cancelled"),
        Err(e) => {
            inner.transition(&[ServiceState::Starting], ServiceState::Failed);
            error!(error = %e, "Failed to start plugin services");
        }
    }
}

impl Inner {
    fn transition(&self, from: &[ServiceState], to: ServiceState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    async fn startup(self: &Arc<Self>) -> Result<(), PluginHostError> {
        let start = Instant::now();
        self.root.ensure_exists()?;

        debug!("Loading plugins in root directory");
        let dirs = self.root.plugin_dirs()?;
        let this = self.clone();
        self.executor
            .parallel(dirs.into_iter().map(PluginDir::new), move |dir| {
                let this = this.clone();
                async move { this.add_or_reload(dir).await }
            })
            .await;

        debug!("Copying latest plugin versions from registry");
        let on_error = self.on_error.clone();
        let entries = self
            .registry
            .latest_entries(self.cancel.clone())
            .await?
            .filter_map(move |entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    on_error("registry", &PluginHostError::Registry(e));
                    None
                }
            });
        let this = self.clone();
        self.executor
            .parallel_stream(entries, move |entry: Arc<dyn RegistryEntry>| {
                let this = this.clone();
                async move { this.apply_entry(entry).await }
            })
            .await;

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Initial plugin loading complete"
        );

        let mut subscription = self.subscription.lock().await;
        if self.cancel.is_cancelled() {
            return Err(PluginHostError::Cancelled);
        }

        if self.config.monitor_root_dir() {
            let changes = self.root.start_monitoring()?;
            let pump = tokio::spawn(pump_changes(Arc::downgrade(self), changes));
            *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);
        }

        if self.registry.supports_monitoring() && self.config.monitor_registry() {
            *subscription = Some(self.registry.start_monitoring(self.entry_callback()).await?);
            debug!("Monitoring plugin registry");
        }
        Ok(())
    }

    /// Load the plugin in `dir`, or reload it if a handle already resides there.
    async fn add_or_reload(self: &Arc<Self>, dir: impl Into<PluginDir>) -> Result<(), PluginHostError> {
        let dir = dir.into();
        if let Some(existing) = self.table.get(&dir).await {
            debug!(dir = %dir, "Plugin already present, reloading");
            return existing.load().await;
        }

        let handle = PluginHandle::new(dir, self.config.clone(), self.loader.as_ref())?;
        if let Err(e) = handle.load().await {
            handle.dispose().await;
            return Err(e);
        }
        handle.enable_hot_reload(self.executor.clone());

        if !self.table.add(handle.clone()).await {
            handle.dispose().await;
        }
        Ok(())
    }

    /// Copy a registry entry into the root if it is newer than what is loaded.
    async fn apply_entry(self: &Arc<Self>, entry: Arc<dyn RegistryEntry>) -> Result<(), PluginHostError> {
        if !self.table.is_newer_version(entry.name(), entry.version()).await {
            debug!(
                plugin = entry.name(),
                version = %entry.version(),
                "Skipped registry entry, newer or equal version already installed"
            );
            return Ok(());
        }

        let dir = self.root.plugin_dir(entry.name());
        tokio::fs::create_dir_all(&dir).await?;

        debug!(plugin = entry.name(), dir = %dir.display(), "Copying plugin from registry");
        entry.materialize(&dir, &self.cancel).await?;

        if self.table.contains(&dir).await {
            debug!(plugin = entry.name(), "Plugin already loaded, will reload automatically");
            Ok(())
        } else {
            debug!(plugin = entry.name(), "Loading new plugin");
            self.add_or_reload(dir).await
        }
    }

    fn on_directory_change(self: &Arc<Self>, change: DirectoryChange) {
        debug!(change = %change, "Root directory changed");
        let this = self.clone();
        self.executor.execute(change.to_string(), move || {
            let this = this.clone();
            let change = change.clone();
            async move {
                match change {
                    DirectoryChange::Added(path) => this.add_or_reload(path).await,
                    DirectoryChange::Removed(path) => {
                        this.table.remove(&path).await;
                        Ok(())
                    }
                    DirectoryChange::Renamed { from, to } => {
                        this.table.remove(&from).await;
                        this.add_or_reload(to).await
                    }
                }
            }
        });
    }

    fn on_entry_changed(self: &Arc<Self>, entry: Arc<dyn RegistryEntry>) {
        debug!(plugin = entry.name(), version = %entry.version(), "Plugin registry changed");
        let this = self.clone();
        self.executor.execute(entry.to_string(), move || {
            let this = this.clone();
            let entry = entry.clone();
            async move { this.apply_entry(entry).await }
        });
    }

    fn entry_callback(self: &Arc<Self>) -> EntryCallback {
        let weak = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();
        Arc::new(move |entry| {
            if let Some(inner) = weak.upgrade() {
                let _runtime = runtime.enter();
                inner.on_entry_changed(entry);
            }
        })
    }
}

/// Forward directory changes until the channel closes or the service is cancelled.
async fn pump_changes(inner: Weak<Inner>, mut changes: mpsc::UnboundedReceiver<DirectoryChange>) {
    let Some(cancel) = inner.upgrade().map(|i| i.cancel.clone()) else {
        return;
    };
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };
        match inner.upgrade() {
            Some(inner) => inner.on_directory_change(change),
            None => break,
        }
    }
}
