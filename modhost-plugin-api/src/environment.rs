//! Host environment visible to a plugin

use std::path::{Path, PathBuf};

/// Describes the host a plugin is running in.
///
/// The host registers one of these into every plugin's container before
/// the plugin configures its own services, so plugin factories can resolve it:
///
/// ```ignore
/// services.provide_with::<dyn Store, _>("cache::DiskStore", |c| {
///     let env = c.resolve::<PluginEnvironment>().expect("host environment");
///     Arc::new(DiskStore::open(env.content_root().join("cache")))
/// });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnvironment {
    application_name: String,
    environment_name: String,
    content_root: PathBuf,
}

impl PluginEnvironment {
    /// Type name the host registers the environment under.
    pub const TYPE_NAME: &'static str = "modhost::PluginEnvironment";

    pub fn new(
        application_name: impl Into<String>,
        environment_name: impl Into<String>,
        content_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            application_name: application_name.into(),
            environment_name: environment_name.into(),
            content_root: content_root.into(),
        }
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn environment_name(&self) -> &str {
        &self.environment_name
    }

    /// The plugin's own directory
    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    /// Whether the host runs in the environment with the given name (case-insensitive)
    pub fn is_environment(&self, name: &str) -> bool {
        self.environment_name.eq_ignore_ascii_case(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let env = PluginEnvironment::new("shop", "Production", "/srv/plugins/cart");
        assert_eq!(env.application_name(), "shop");
        assert_eq!(env.content_root(), Path::new("/srv/plugins/cart"));
        assert!(env.is_environment("production"));
        assert!(!env.is_environment("staging"));
    }
}
