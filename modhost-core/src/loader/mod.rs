//! Isolated load contexts
//!
//! A [`LoadContext`] owns the code of one plugin. Every [`load`](LoadContext::load)
//! produces a new generation of the module as a [`LoadedModule`]; the
//! [`PluginContainer`] built from it keeps that generation alive for as long
//! as any resolved [`Implementation`] is still in use.
//!
//! Two implementations ship with the host:
//!
//! - [`NativeLoader`] - dynamic libraries with shadow copies and hot reload
//! - [`StaticLoader`] - modules compiled into the host process

mod in_process;
mod native;

pub use in_process::StaticLoader;
pub use native::NativeLoader;

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use modhost_plugin_api::{CapabilityContainer, ModuleMetadata, PluginModule, Services, TypeInfo};
use tracing::{debug, warn};

use crate::config::PluginsConfig;
use crate::error::PluginHostError;
use crate::identity::{ModuleIdentity, PluginDir};

/// Invoked by a load context when its module changed and should be reloaded.
pub type ReloadCallback = Arc<dyn Fn() + Send + Sync>;

/// The primitive that loads a plugin's code in isolation.
///
/// Methods may block and are called from blocking tasks.
pub trait LoadContext: Send + Sync {
    /// Main module file this context loads
    fn main_module(&self) -> &Path;

    /// Load a new generation of the module.
    fn load(&self) -> Result<Arc<LoadedModule>, PluginHostError>;

    /// Register (or clear) the callback fired when the module changes.
    ///
    /// A context never invokes the callback concurrently with itself.
    fn set_reload_callback(&self, callback: Option<ReloadCallback>);

    /// Release the context. No reload callback fires after this returns.
    fn unload(&self);
}

/// Creates a [`LoadContext`] per plugin directory.
pub trait LoadContextFactory: Send + Sync {
    fn create(
        &self,
        plugin_dir: &PluginDir,
        main_module: &Path,
    ) -> Result<Arc<dyn LoadContext>, PluginHostError>;
}

/// Removes a shadow copy once the library mapped from it is gone.
pub(crate) struct ShadowFile(pub(crate) PathBuf);

impl Drop for ShadowFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), error = %e, "Could not remove shadow copy");
        }
    }
}

/// One generation of a loaded module.
///
/// Fields drop in declaration order: the module instance goes first, then
/// the library its code lives in, then the shadow file it was mapped from.
pub struct LoadedModule {
    module: Box<dyn PluginModule>,
    main_module: PathBuf,
    generation: u64,
    library: Option<Library>,
    shadow: Option<ShadowFile>,
}

impl LoadedModule {
    /// Wrap a module that lives in the host binary.
    pub fn in_process(module: Box<dyn PluginModule>, main_module: PathBuf, generation: u64) -> Self {
        Self {
            module,
            main_module,
            generation,
            library: None,
            shadow: None,
        }
    }

    pub(crate) fn native(
        module: Box<dyn PluginModule>,
        library: Library,
        shadow: ShadowFile,
        main_module: PathBuf,
        generation: u64,
    ) -> Self {
        Self {
            module,
            main_module,
            generation,
            library: Some(library),
            shadow: Some(shadow),
        }
    }

    pub fn module(&self) -> &dyn PluginModule {
        self.module.as_ref()
    }

    pub fn metadata(&self) -> ModuleMetadata {
        self.module.metadata()
    }

    pub fn main_module(&self) -> &Path {
        &self.main_module
    }

    /// Load generation, starting at 1 for each context
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if let Err(e) = self.module.on_unload() {
            warn!(
                module = %self.main_module.display(),
                generation = self.generation,
                error = %e,
                "Plugin on_unload returned error"
            );
        }
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("main_module", &self.main_module)
            .field("generation", &self.generation)
            .field("native", &self.is_native())
            .finish()
    }
}

/// A resolved contract implementation.
///
/// Holds the module generation it came from so the code stays mapped while
/// the instance is in use.
pub struct Implementation<C: ?Sized> {
    instance: Arc<C>,
    type_name: String,
    module: Arc<LoadedModule>,
}

impl<C: ?Sized> Implementation<C> {
    /// Type name the implementation was registered under
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn generation(&self) -> u64 {
        self.module.generation()
    }

    /// The shared instance. The caller becomes responsible for not
    /// outliving the module generation with it.
    pub fn instance(&self) -> &Arc<C> {
        &self.instance
    }
}

impl<C: ?Sized> Deref for Implementation<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.instance
    }
}

impl<C: ?Sized> Clone for Implementation<C> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            type_name: self.type_name.clone(),
            module: self.module.clone(),
        }
    }
}

impl<C: ?Sized> fmt::Debug for Implementation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation")
            .field("type_name", &self.type_name)
            .field("generation", &self.module.generation())
            .finish()
    }
}

/// The capability container of one module generation, with the identity
/// derived from it.
pub struct PluginContainer {
    capabilities: CapabilityContainer,
    identity: ModuleIdentity,
    module: Arc<LoadedModule>,
}

impl PluginContainer {
    /// Register host services, let the module configure its own, and derive
    /// the module identity.
    pub fn build(
        module: Arc<LoadedModule>,
        config: &PluginsConfig,
        plugin_dir: &PluginDir,
    ) -> Result<Self, PluginHostError> {
        let identity = ModuleIdentity::from_metadata(&module.metadata(), module.main_module())?;

        let mut services = Services::for_host();
        config.configure_host_services(&mut services, plugin_dir.path());
        services.begin_module_registrations();
        module.module().configure(&mut services)?;

        Ok(Self {
            capabilities: services.build(),
            identity,
            module,
        })
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    pub fn capabilities(&self) -> &CapabilityContainer {
        &self.capabilities
    }

    pub fn module(&self) -> &Arc<LoadedModule> {
        &self.module
    }

    pub fn generation(&self) -> u64 {
        self.module.generation()
    }

    /// Every module-exported implementation of `C`
    pub fn implementations_of<C>(&self) -> Vec<Implementation<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.capabilities
            .types_implementing::<C>()
            .into_iter()
            .filter_map(|info| self.implementation_named::<C>(info.name()))
            .collect()
    }

    /// The module-exported implementation of `C` named `type_name`.
    pub fn implementation<C>(&self, type_name: &str) -> Result<Implementation<C>, PluginHostError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        if self.capabilities.find_type(type_name).is_none() {
            return Err(PluginHostError::TypeNotFound {
                type_name: type_name.to_string(),
                module: self.identity.name.clone(),
            });
        }
        self.implementation_named::<C>(type_name)
            .ok_or_else(|| PluginHostError::ContractMismatch {
                type_name: type_name.to_string(),
                module: self.identity.name.clone(),
                contract: std::any::type_name::<C>(),
            })
    }

    pub fn find_type(&self, type_name: &str) -> Option<TypeInfo> {
        self.capabilities.find_type(type_name).cloned()
    }

    pub fn types_implementing<C: ?Sized + 'static>(&self) -> Vec<TypeInfo> {
        self.capabilities
            .types_implementing::<C>()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn exported_types(&self) -> Vec<TypeInfo> {
        self.capabilities.exported_types().cloned().collect()
    }

    fn implementation_named<C>(&self, type_name: &str) -> Option<Implementation<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.capabilities
            .resolve_exported_named::<C>(type_name)
            .map(|instance| Implementation {
                instance,
                type_name: type_name.to_string(),
                module: self.module.clone(),
            })
    }
}

impl fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContainer")
            .field("identity", &self.identity)
            .field("generation", &self.module.generation())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modhost_plugin_api::{CrateVersion, PluginEnvironment, PluginError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    trait Unused: Send + Sync {}

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    struct Module {
        unloads: Arc<AtomicUsize>,
    }

    impl PluginModule for Module {
        fn metadata(&self) -> ModuleMetadata {
            ModuleMetadata::new("greeter").with_crate_version(CrateVersion::new(1, 0, 0))
        }

        fn configure(&self, services: &mut Services) -> Result<(), PluginError> {
            services.provide::<dyn Greeter>("greeter::Hello", Arc::new(Hello));
            Ok(())
        }

        fn on_unload(&self) -> Result<(), PluginError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn container(unloads: Arc<AtomicUsize>) -> PluginContainer {
        let module = LoadedModule::in_process(
            Box::new(Module { unloads }),
            PathBuf::from("/plugins/greeter/greeter.so"),
            1,
        );
        PluginContainer::build(
            Arc::new(module),
            &PluginsConfig::default(),
            &PluginDir::new("/plugins/greeter"),
        )
        .unwrap()
    }

    #[test]
    fn test_container_exposes_module_types_and_environment() {
        let container = container(Arc::new(AtomicUsize::new(0)));
        assert_eq!(container.identity().name, "greeter");

        let greeters = container.implementations_of::<dyn Greeter>();
        assert_eq!(greeters.len(), 1);
        assert_eq!(greeters[0].greet(), "hello");
        assert_eq!(greeters[0].type_name(), "greeter::Hello");

        let env = container
            .capabilities()
            .resolve::<PluginEnvironment>()
            .unwrap();
        assert_eq!(env.content_root(), Path::new("/plugins/greeter"));

        let exported: Vec<String> = container
            .exported_types()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(exported, vec!["greeter::Hello"]);
    }

    #[test]
    fn test_implementation_lookup_errors() {
        let container = container(Arc::new(AtomicUsize::new(0)));
        assert!(container.implementation::<dyn Greeter>("greeter::Hello").is_ok());
        assert!(matches!(
            container.implementation::<dyn Greeter>("greeter::Missing"),
            Err(PluginHostError::TypeNotFound { .. })
        ));
        assert!(matches!(
            container.implementation::<dyn Unused>("greeter::Hello"),
            Err(PluginHostError::ContractMismatch { .. })
        ));
    }

    #[test]
    fn test_implementation_keeps_module_alive() {
        let unloads = Arc::new(AtomicUsize::new(0));
        let container = container(unloads.clone());
        let greeter = container.implementation::<dyn Greeter>("greeter::Hello").unwrap();
        let weak = Arc::downgrade(container.module());

        drop(container);
        assert_eq!(unloads.load(Ordering::SeqCst), 0);
        assert!(weak.upgrade().is_some());
        assert_eq!(greeter.greet(), "hello");

        drop(greeter);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_missing_version_fails_container() {
        struct Unversioned;
        impl PluginModule for Unversioned {
            fn metadata(&self) -> ModuleMetadata {
                ModuleMetadata::new("anon")
            }
            fn configure(&self, _services: &mut Services) -> Result<(), PluginError> {
                Ok(())
            }
        }

        let module = LoadedModule::in_process(Box::new(Unversioned), PathBuf::from("anon.so"), 1);
        let err = PluginContainer::build(
            Arc::new(module),
            &PluginsConfig::default(),
            &PluginDir::new("/plugins/anon"),
        )
        .unwrap_err();
        assert!(matches!(err, PluginHostError::VersionUnavailable { .. }));
    }
}
