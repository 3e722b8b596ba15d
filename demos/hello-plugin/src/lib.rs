//! Hello Plugin - A simple example plugin for modhost
//!
//! This plugin demonstrates:
//! - Basic module structure with the `export_plugin!` macro
//! - Registering a shared instance and a factory
//! - Reading the host environment from a factory
//!
//! ## Building
//!
//! ```bash
//! cargo build --release
//! ```
//!
//! ## Installing
//!
//! ```bash
//! mkdir -p ~/.local/share/modhost/plugins/hello_plugin
//! cp target/release/libhello_plugin.so ~/.local/share/modhost/plugins/hello_plugin/
//! modhost list
//! ```
//!
//! With `modhost serve --watch` running, copying a rebuilt library over the
//! installed one swaps the new generation in.

use std::sync::Arc;

use modhost_plugin_api::{
    CapabilityContainer, ModuleMetadata, PluginEnvironment, PluginError, PluginModule, Services,
    crate_version, export_plugin,
};

/// Contract this plugin provides
pub trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

struct Hello;

impl Greeter for Hello {
    fn greet(&self, name: &str) -> String {
        format!("Hello, {name}!")
    }
}

/// Greets with the environment the host runs in
struct EnvironmentGreeter {
    environment: String,
}

impl Greeter for EnvironmentGreeter {
    fn greet(&self, name: &str) -> String {
        format!("Hello from {}, {name}!", self.environment)
    }
}

#[derive(Default)]
pub struct HelloPlugin;

impl PluginModule for HelloPlugin {
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata::new("hello")
            .with_description("A simple example plugin that says hello")
            .with_crate_version(crate_version!())
    }

    fn configure(&self, services: &mut Services) -> Result<(), PluginError> {
        services
            .provide::<dyn Greeter>("hello::Hello", Arc::new(Hello))
            .provide_with::<dyn Greeter, _>(
                "hello::EnvironmentGreeter",
                |container: &CapabilityContainer| {
                    let environment = container
                        .resolve::<PluginEnvironment>()
                        .map(|env| env.environment_name().to_string())
                        .unwrap_or_default();
                    Arc::new(EnvironmentGreeter { environment }) as Arc<dyn Greeter>
                },
            );
        Ok(())
    }
}

export_plugin!(HelloPlugin);
