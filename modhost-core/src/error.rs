//! Plugin host error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the plugin host
#[derive(Error, Debug)]
pub enum PluginHostError {
    /// Plugin directory not found
    #[error("Plugin directory not found: {path}")]
    PluginDirNotFound { path: PathBuf },

    /// Plugin library not found in directory
    #[error("Plugin library not found in {dir}")]
    LibraryNotFound { dir: PathBuf },

    /// API version mismatch between host and plugin
    #[error("API version mismatch: host expects {expected}, plugin has {found}")]
    ApiVersionMismatch { expected: u32, found: u32 },

    /// Failed to load dynamic library
    #[error("Failed to load plugin library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// Plugin failed while configuring its services or unloading
    #[error("Plugin initialization failed: {0}")]
    InitFailed(#[from] modhost_plugin_api::PluginError),

    /// None of the module's version sources yielded a usable version
    #[error("Unable to determine version of plugin: {module}")]
    VersionUnavailable { module: PathBuf },

    /// The plugin handle was used after disposal
    #[error("Plugin in {dir} has been disposed")]
    Disposed { dir: PathBuf },

    /// No loaded plugin has the requested module name
    #[error("Could not find plugin module: {module}")]
    PluginNotFound { module: String },

    /// The module does not export the requested type
    #[error("Type '{type_name}' not found in module: {module}")]
    TypeNotFound { type_name: String, module: String },

    /// The type exists but was not registered for the requested contract
    #[error("Type '{type_name}' in module {module} does not implement {contract}")]
    ContractMismatch {
        type_name: String,
        module: String,
        contract: &'static str,
    },

    /// A qualified type name without the `, module` part
    #[error("'{0}' is not a module qualified type name")]
    InvalidQualifiedName(String),

    /// Filesystem watcher failure
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Failure reported by a registry collaborator
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A task panicked
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The operation observed cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error reported by a [`PluginRegistry`](crate::registry::PluginRegistry)
/// implementation. Wraps whatever the registry failed with.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct RegistryError(Box<dyn std::error::Error + Send + Sync>);

impl RegistryError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(source.into())
    }

    /// Registry error carrying only a message
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_not_found_display() {
        let err = PluginHostError::LibraryNotFound {
            dir: PathBuf::from("/plugins/greeter"),
        };
        assert!(err.to_string().contains("/plugins/greeter"));
    }

    #[test]
    fn test_api_version_mismatch_display() {
        let err = PluginHostError::ApiVersionMismatch {
            expected: 1,
            found: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_type_not_found_display() {
        let err = PluginHostError::TypeNotFound {
            type_name: "greet::Klingon".into(),
            module: "greeter".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("greet::Klingon"));
        assert!(msg.contains("greeter"));
    }

    #[test]
    fn test_registry_error_is_transparent() {
        let err: PluginHostError = RegistryError::msg("feed offline").into();
        assert_eq!(err.to_string(), "Registry error: feed offline");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PluginHostError = io_err.into();
        assert!(matches!(err, PluginHostError::Io(_)));
    }
}
