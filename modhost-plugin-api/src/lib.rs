//! modhost-plugin-api - Plugin API for the modhost plugin host
//!
//! This crate provides the traits and types needed to write plugins for
//! modhost. Plugins are native Rust dynamic libraries living in their own
//! directory under the host's plugin root. A plugin registers the contract
//! implementations it provides into [`Services`]; the host resolves them
//! through a [`CapabilityContainer`] and hot-swaps them when the library
//! on disk changes.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use modhost_plugin_api::{
//!     crate_version, export_plugin, ModuleMetadata, PluginError, PluginModule, Services,
//! };
//! use shop_contracts::PriceRule;
//!
//! #[derive(Default)]
//! pub struct Discounts;
//!
//! impl PluginModule for Discounts {
//!     fn metadata(&self) -> ModuleMetadata {
//!         ModuleMetadata::new("discounts").with_crate_version(crate_version!())
//!     }
//!
//!     fn configure(&self, services: &mut Services) -> Result<(), PluginError> {
//!         services.provide::<dyn PriceRule>("discounts::Seasonal", Arc::new(Seasonal));
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(Discounts);
//! ```

pub mod environment;
pub mod error;
pub mod metadata;
pub mod services;

pub use environment::PluginEnvironment;
pub use error::PluginError;
pub use metadata::{CrateVersion, ModuleMetadata};
pub use services::{CapabilityContainer, Origin, Services, TypeInfo};

/// Current plugin API version. Plugins must match this exactly.
pub const API_VERSION: u32 = 1;

/// Symbol of the C ABI function returning [`API_VERSION`].
pub const API_VERSION_SYMBOL: &[u8] = b"_modhost_plugin_api_version";

/// Symbol of the C ABI function creating the module instance.
pub const CREATE_SYMBOL: &[u8] = b"_modhost_plugin_create";

/// The trait every plugin module implements.
pub trait PluginModule: Send + Sync {
    /// Return module metadata (name and version sources)
    fn metadata(&self) -> ModuleMetadata;

    /// Register the implementations this module provides.
    ///
    /// Called once per load generation, with host services already registered.
    fn configure(&self, services: &mut Services) -> Result<(), PluginError>;

    /// Called before this generation of the module is released, either
    /// because it is being replaced by a reload or because the plugin is
    /// being removed.
    fn on_unload(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Export a module type for dynamic loading.
///
/// The type must implement [`PluginModule`] and [`Default`].
///
/// # Generated Functions
///
/// - `_modhost_plugin_create()`: Creates a new module instance
/// - `_modhost_plugin_api_version()`: Returns the API version
#[macro_export]
macro_rules! export_plugin {
    ($module_type:ty) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _modhost_plugin_create() -> *mut dyn $crate::PluginModule {
            let module: Box<dyn $crate::PluginModule> = Box::new(<$module_type>::default());
            Box::into_raw(module)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _modhost_plugin_api_version() -> u32 {
            $crate::API_VERSION
        }
    };
}
