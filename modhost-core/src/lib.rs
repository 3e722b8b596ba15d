//! modhost-core: host side of the modhost plugin system
//!
//! This crate discovers plugin modules under a root directory, loads each into
//! its own isolated context and keeps them current while the host runs:
//!
//! - **Service** - [`PluginService`] runs startup, monitoring and shutdown
//! - **Table** - [`PluginTable`] answers capability queries across all plugins
//! - **Handles** - [`PluginHandle`] owns one plugin directory and hot-swaps its container
//! - **Loaders** - [`NativeLoader`] for shared libraries, [`StaticLoader`] for in-process modules
//! - **Registry** - [`PluginRegistry`] supplies newer plugin versions from elsewhere
//! - **Executor** - [`TaskExecutor`] bounds and retries background plugin work
//!
//! # Quick Start
//!
//! ```no_run
//! use modhost_core::{PluginService, PluginsConfig};
//!
//! # trait Greeter: Send + Sync { fn greet(&self) -> String; }
//! async fn example() -> Result<(), modhost_core::PluginHostError> {
//!     let config = PluginsConfig::builder()
//!         .root_dir("~/.local/share/modhost/plugins")
//!         .monitor_root_dir(true)
//!         .build();
//!
//!     let service = PluginService::builder(config).build();
//!     service.start().await?;
//!
//!     for greeter in service.plugins().implementations_of::<dyn Greeter>().await {
//!         println!("{}", greeter.greet());
//!     }
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                     PluginService                     │
//! │  RootDirectory ──changes──┐     ┌──entries── Registry │
//! │                           ▼     ▼                     │
//! │                        TaskExecutor                   │
//! │                             │                         │
//! │  ┌──────────────────────────▼──────────────────────┐  │
//! │  │                    PluginTable                  │  │
//! │  │   PluginHandle ── LoadContext ── PluginContainer│  │
//! │  └─────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod handle;
pub mod identity;
pub mod loader;
pub mod registry;
pub mod service;
pub mod table;
pub mod watcher;

pub use config::{ExecutorSettings, PluginsConfig, PluginsConfigBuilder, expand_path};
pub use error::{PluginHostError, RegistryError};
pub use executor::{BatchSummary, ErrorSink, RetryPolicy, TaskExecutor, log_errors};
pub use gate::{GateState, ReadinessGate};
pub use handle::PluginHandle;
pub use identity::{ModuleIdentity, PluginDir, QualifiedTypeName, parse_version_lenient};
pub use loader::{
    Implementation, LoadContext, LoadContextFactory, LoadedModule, NativeLoader, PluginContainer,
    ReloadCallback, StaticLoader,
};
pub use registry::{
    EntryCallback, EntryStream, NoOpRegistry, PluginRegistry, RegistryEntry, RegistrySubscription,
};
pub use service::{PluginService, PluginServiceBuilder, ServiceState};
pub use table::{ExportedType, PluginTable};
pub use watcher::{DirectoryChange, RootDirectory};

pub use modhost_plugin_api as api;
