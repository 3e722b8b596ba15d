//! Shared fixtures for modhost-core integration tests

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use modhost_core::api::{ModuleMetadata, PluginError, PluginModule, Services};
use modhost_core::{
    EntryCallback, EntryStream, ExecutorSettings, PluginRegistry, PluginsConfig, RegistryEntry,
    RegistryError, RegistrySubscription, StaticLoader,
};
use semver::Version;
use tokio_util::sync::CancellationToken;

pub trait Greeter: Send + Sync {
    fn greet(&self) -> String;
}

struct Hello {
    module: String,
    version: String,
}

impl Greeter for Hello {
    fn greet(&self) -> String {
        format!("hello from {} {}", self.module, self.version)
    }
}

/// Module exporting one `Greeter` named `greet::Hello`
pub struct GreeterModule {
    pub name: String,
    pub version: String,
}

impl PluginModule for GreeterModule {
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata::new(&self.name).with_product_version(&self.version)
    }

    fn configure(&self, services: &mut Services) -> Result<(), PluginError> {
        services.provide::<dyn Greeter>(
            "greet::Hello",
            Arc::new(Hello {
                module: self.name.clone(),
                version: self.version.clone(),
            }),
        );
        Ok(())
    }
}

/// Serve `name` at `version` from `loader`.
pub fn register(loader: &StaticLoader, name: &str, version: &str) {
    let (module, version) = (name.to_string(), version.to_string());
    loader.register(name, move || {
        Box::new(GreeterModule {
            name: module.clone(),
            version: version.clone(),
        })
    });
}

/// Root directory with one subdirectory per name
pub fn plugin_root(names: &[&str]) -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::TempDir::new().unwrap();
    let root = std::fs::canonicalize(tmp.path()).unwrap().join("plugins");
    std::fs::create_dir_all(&root).unwrap();
    for name in names {
        std::fs::create_dir(root.join(name)).unwrap();
    }
    (tmp, root)
}

pub fn config(root: &Path) -> modhost_core::PluginsConfigBuilder {
    PluginsConfig::builder()
        .root_dir(root.to_str().unwrap())
        .unload_attempts(1)
        .executor(ExecutorSettings {
            max_parallelism: 3,
            max_retries: 2,
            backoff_step_ms: 5,
        })
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Registry entry that installs a new module version into a [`StaticLoader`]
/// and reports the directory as changed, the way a file copy would.
pub struct FakeEntry {
    name: String,
    version: Version,
    loader: StaticLoader,
    materialized: Arc<AtomicUsize>,
}

impl FakeEntry {
    pub fn materialized(&self) -> usize {
        self.materialized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryEntry for FakeEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &Version {
        &self.version
    }

    async fn materialize(
        &self,
        target: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), RegistryError> {
        self.materialized.fetch_add(1, Ordering::SeqCst);
        std::fs::write(target.join("VERSION"), self.version.to_string())
            .map_err(RegistryError::new)?;
        register(&self.loader, &self.name, &self.version.to_string());
        self.loader.notify_changed(target);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    entries: Mutex<Vec<Arc<FakeEntry>>>,
    callback: Arc<Mutex<Option<EntryCallback>>>,
    loader: StaticLoader,
}

impl FakeRegistry {
    pub fn new(loader: &StaticLoader) -> Arc<Self> {
        Arc::new(Self {
            loader: loader.clone(),
            ..Default::default()
        })
    }

    pub fn entry(&self, name: &str, version: &str) -> Arc<FakeEntry> {
        Arc::new(FakeEntry {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            loader: self.loader.clone(),
            materialized: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Add an entry returned by `latest_entries`
    pub fn with_entry(&self, name: &str, version: &str) -> Arc<FakeEntry> {
        let entry = self.entry(name, version);
        self.entries.lock().unwrap().push(entry.clone());
        entry
    }

    pub fn is_monitored(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    /// Deliver a change to the monitoring host. Returns `false` if nobody listens.
    pub fn publish(&self, entry: Arc<FakeEntry>) -> bool {
        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(callback) => {
                callback(entry as Arc<dyn RegistryEntry>);
                true
            }
            None => false,
        }
    }
}

struct FakeSubscription(Arc<Mutex<Option<EntryCallback>>>);

#[async_trait]
impl RegistrySubscription for FakeSubscription {
    async fn stop(self: Box<Self>) {
        self.0.lock().unwrap().take();
    }
}

#[async_trait]
impl PluginRegistry for FakeRegistry {
    fn supports_monitoring(&self) -> bool {
        true
    }

    async fn latest_entries(&self, _cancel: CancellationToken) -> Result<EntryStream, RegistryError> {
        let entries: Vec<Result<Arc<dyn RegistryEntry>, RegistryError>> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| Ok(e.clone() as Arc<dyn RegistryEntry>))
            .collect();
        Ok(Box::pin(tokio_stream::iter(entries)))
    }

    async fn start_monitoring(
        &self,
        on_entry_changed: EntryCallback,
    ) -> Result<Box<dyn RegistrySubscription>, RegistryError> {
        *self.callback.lock().unwrap() = Some(on_entry_changed);
        Ok(Box::new(FakeSubscription(self.callback.clone())))
    }
}
