//! Capability registration and resolution
//!
//! A plugin declares what it provides by registering implementations into
//! [`Services`] under the contract type they satisfy. The host then builds a
//! [`CapabilityContainer`] from those registrations and resolves contracts
//! through it. Contract types are usually trait objects:
//!
//! ```ignore
//! services.provide::<dyn Greeter>("hello::English", Arc::new(English));
//! let greeters: Vec<Arc<dyn Greeter>> = container.resolve_all::<dyn Greeter>();
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

type Instance = Box<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&CapabilityContainer) -> Instance + Send + Sync>;

/// Who made a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Registered by the host before the plugin configured its services
    Host,
    /// Registered by the plugin module itself
    Module,
}

/// Describes one registered implementation: the type name it was
/// registered under and the contract it satisfies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    name: String,
    contract: TypeId,
    contract_name: &'static str,
    origin: Origin,
}

impl TypeInfo {
    /// Type name the implementation was registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the contract
    pub fn contract_name(&self) -> &'static str {
        self.contract_name
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Whether this implementation was registered for contract `C`
    pub fn implements<C: ?Sized + 'static>(&self) -> bool {
        self.contract == TypeId::of::<C>()
    }
}

enum Provider {
    Singleton(Arc<dyn Any + Send + Sync>),
    Factory(Factory),
}

struct Registration {
    info: TypeInfo,
    provider: Provider,
}

/// Registration builder handed to [`PluginModule::configure`](crate::PluginModule::configure).
pub struct Services {
    registrations: Vec<Registration>,
    origin: Origin,
}

impl Services {
    /// Create an empty collection whose registrations are tagged as module-provided.
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            origin: Origin::Module,
        }
    }

    /// Create an empty collection whose registrations are tagged as host-provided.
    ///
    /// Call [`begin_module_registrations`](Self::begin_module_registrations)
    /// before handing it to a plugin.
    pub fn for_host() -> Self {
        Self {
            registrations: Vec::new(),
            origin: Origin::Host,
        }
    }

    /// Tag every following registration as module-provided.
    pub fn begin_module_registrations(&mut self) {
        self.origin = Origin::Module;
    }

    /// Register a shared instance for contract `C`.
    pub fn provide<C>(&mut self, type_name: impl Into<String>, instance: Arc<C>) -> &mut Self
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.push::<C>(type_name.into(), Provider::Singleton(Arc::new(instance)));
        self
    }

    /// Register a factory for contract `C`, invoked on every resolution.
    ///
    /// The factory can resolve other capabilities (including host-provided
    /// ones such as [`PluginEnvironment`](crate::PluginEnvironment)) from the
    /// container it is given.
    pub fn provide_with<C, F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        C: ?Sized + Send + Sync + 'static,
        F: Fn(&CapabilityContainer) -> Arc<C> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |container| Box::new(factory(container)) as Instance);
        self.push::<C>(type_name.into(), Provider::Factory(factory));
        self
    }

    /// Whether an implementation named `type_name` is registered for `C`.
    pub fn contains<C: ?Sized + 'static>(&self, type_name: &str) -> bool {
        self.registrations
            .iter()
            .any(|r| r.info.implements::<C>() && r.info.name == type_name)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Freeze the registrations into a resolver.
    pub fn build(self) -> CapabilityContainer {
        CapabilityContainer {
            registrations: self.registrations,
        }
    }

    fn push<C: ?Sized + 'static>(&mut self, name: String, provider: Provider) {
        self.registrations.push(Registration {
            info: TypeInfo {
                name,
                contract: TypeId::of::<C>(),
                contract_name: std::any::type_name::<C>(),
                origin: self.origin,
            },
            provider,
        });
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("registrations", &self.registrations.len())
            .field("origin", &self.origin)
            .finish()
    }
}

/// Resolves contract types to the instances a module (or the host) registered.
pub struct CapabilityContainer {
    registrations: Vec<Registration>,
}

impl CapabilityContainer {
    /// Resolve every implementation of `C`, in registration order.
    pub fn resolve_all<C>(&self) -> Vec<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.registrations
            .iter()
            .filter(|r| r.info.implements::<C>())
            .filter_map(|r| self.instantiate::<C>(r))
            .collect()
    }

    /// Resolve the most recently registered implementation of `C`.
    pub fn resolve<C>(&self) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.registrations
            .iter()
            .rev()
            .find(|r| r.info.implements::<C>())
            .and_then(|r| self.instantiate::<C>(r))
    }

    /// Resolve the implementation of `C` registered under `type_name`.
    pub fn resolve_named<C>(&self, type_name: &str) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.registrations
            .iter()
            .find(|r| r.info.implements::<C>() && r.info.name == type_name)
            .and_then(|r| self.instantiate::<C>(r))
    }

    /// Resolve every module-exported implementation of `C`, in registration order.
    pub fn resolve_exported<C>(&self) -> Vec<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.registrations
            .iter()
            .filter(|r| r.info.origin == Origin::Module && r.info.implements::<C>())
            .filter_map(|r| self.instantiate::<C>(r))
            .collect()
    }

    /// Resolve the module-exported implementation of `C` named `type_name`.
    pub fn resolve_exported_named<C>(&self, type_name: &str) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.registrations
            .iter()
            .find(|r| {
                r.info.origin == Origin::Module
                    && r.info.implements::<C>()
                    && r.info.name == type_name
            })
            .and_then(|r| self.instantiate::<C>(r))
    }

    /// Module-exported types registered for contract `C`.
    pub fn types_implementing<C: ?Sized + 'static>(&self) -> Vec<&TypeInfo> {
        self.exported_types()
            .filter(|info| info.implements::<C>())
            .collect()
    }

    /// Look up a module-exported type by the name it was registered under.
    pub fn find_type(&self, type_name: &str) -> Option<&TypeInfo> {
        self.exported_types().find(|info| info.name == type_name)
    }

    /// Every type the module registered (host registrations excluded).
    pub fn exported_types(&self) -> impl Iterator<Item = &TypeInfo> {
        self.registrations
            .iter()
            .map(|r| &r.info)
            .filter(|info| info.origin == Origin::Module)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn instantiate<C>(&self, registration: &Registration) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        match &registration.provider {
            Provider::Singleton(instance) => instance.downcast_ref::<Arc<C>>().cloned(),
            Provider::Factory(factory) => factory(self).downcast::<Arc<C>>().ok().map(|b| *b),
        }
    }
}

impl fmt::Debug for CapabilityContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityContainer")
            .field(
                "types",
                &self
                    .registrations
                    .iter()
                    .map(|r| r.info.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
