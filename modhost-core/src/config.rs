//! Plugin host configuration
//!
//! [`PluginsConfig`] is built once and shared read-only by every component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use modhost_plugin_api::{PluginEnvironment, Services};
use serde::{Deserialize, Serialize};

/// Chooses the main module file inside a plugin directory.
pub type MainModuleSelector = Arc<dyn Fn(&Path) -> PathBuf + Send + Sync>;

/// Registers host services into every plugin container, before the plugin
/// configures its own.
pub type ServicesConfigurer = Arc<dyn Fn(&mut Services, &PluginEnvironment) + Send + Sync>;

/// Default number of operations a bounded batch runs at once
pub const DEFAULT_MAX_PARALLELISM: usize = 3;
/// Default number of retries after a failed attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default backoff increment between retries, in milliseconds
pub const DEFAULT_BACKOFF_STEP_MS: u64 = 200;
/// Default number of polls confirming a disposed module was released
pub const DEFAULT_UNLOAD_ATTEMPTS: u32 = 10;

/// Concurrency and retry tuning for the [`TaskExecutor`](crate::executor::TaskExecutor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Maximum operations running concurrently in a batch
    pub max_parallelism: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Delay added per retry (`attempt * step`)
    pub backoff_step_ms: u64,
}

impl ExecutorSettings {
    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_step_ms: DEFAULT_BACKOFF_STEP_MS,
        }
    }
}

/// Immutable plugin host configuration.
#[derive(Clone)]
pub struct PluginsConfig {
    root_dir: PathBuf,
    monitor_root_dir: bool,
    monitor_registry: bool,
    hot_reload: bool,
    application_name: String,
    environment_name: String,
    executor: ExecutorSettings,
    unload_attempts: u32,
    main_module_selector: Option<MainModuleSelector>,
    services_configurer: Option<ServicesConfigurer>,
}

impl PluginsConfig {
    pub fn builder() -> PluginsConfigBuilder {
        PluginsConfigBuilder::default()
    }

    /// Absolute plugin root directory
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Watch the root directory for added, removed and renamed plugins
    pub fn monitor_root_dir(&self) -> bool {
        self.monitor_root_dir
    }

    /// Subscribe to registry change notifications after startup
    pub fn monitor_registry(&self) -> bool {
        self.monitor_registry
    }

    /// Reload a plugin when its main module changes on disk
    pub fn hot_reload(&self) -> bool {
        self.hot_reload
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn environment_name(&self) -> &str {
        &self.environment_name
    }

    pub fn executor(&self) -> ExecutorSettings {
        self.executor
    }

    pub fn unload_attempts(&self) -> u32 {
        self.unload_attempts
    }

    /// Main module file of the plugin in `plugin_dir`.
    ///
    /// Uses the custom selector when one is configured, otherwise the first
    /// existing file among `<name>.<ext>`, `lib<name>.<ext>` and
    /// `lib<name_with_underscores>.<ext>` where `<name>` is the directory name.
    /// Falls back to `<name>.<ext>` when none exist.
    pub fn main_module(&self, plugin_dir: &Path) -> PathBuf {
        if let Some(selector) = &self.main_module_selector {
            return selector(plugin_dir);
        }
        default_main_module(plugin_dir)
    }

    /// Environment handed to the plugin in `plugin_dir`
    pub fn plugin_environment(&self, plugin_dir: &Path) -> PluginEnvironment {
        PluginEnvironment::new(
            self.application_name.clone(),
            self.environment_name.clone(),
            plugin_dir.to_path_buf(),
        )
    }

    /// Register host services for the plugin in `plugin_dir`.
    pub fn configure_host_services(&self, services: &mut Services, plugin_dir: &Path) {
        let environment = self.plugin_environment(plugin_dir);
        if let Some(configure) = &self.services_configurer {
            configure(services, &environment);
        }
        services.provide::<PluginEnvironment>(PluginEnvironment::TYPE_NAME, Arc::new(environment));
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        PluginsConfigBuilder::default().build()
    }
}

impl fmt::Debug for PluginsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginsConfig")
            .field("root_dir", &self.root_dir)
            .field("monitor_root_dir", &self.monitor_root_dir)
            .field("monitor_registry", &self.monitor_registry)
            .field("hot_reload", &self.hot_reload)
            .field("application_name", &self.application_name)
            .field("environment_name", &self.environment_name)
            .field("executor", &self.executor)
            .field("unload_attempts", &self.unload_attempts)
            .field("custom_selector", &self.main_module_selector.is_some())
            .field("custom_services", &self.services_configurer.is_some())
            .finish()
    }
}

/// Builder for [`PluginsConfig`].
pub struct PluginsConfigBuilder {
    root_dir: PathBuf,
    monitor_root_dir: bool,
    monitor_registry: bool,
    hot_reload: bool,
    application_name: String,
    environment_name: String,
    executor: ExecutorSettings,
    unload_attempts: u32,
    main_module_selector: Option<MainModuleSelector>,
    services_configurer: Option<ServicesConfigurer>,
}

impl Default for PluginsConfigBuilder {
    fn default() -> Self {
        Self {
            root_dir: modhost_paths::plugins_dir(),
            monitor_root_dir: false,
            monitor_registry: true,
            hot_reload: true,
            application_name: "modhost".to_string(),
            environment_name: "Production".to_string(),
            executor: ExecutorSettings::default(),
            unload_attempts: DEFAULT_UNLOAD_ATTEMPTS,
            main_module_selector: None,
            services_configurer: None,
        }
    }
}

impl PluginsConfigBuilder {
    /// Plugin root directory. `~`, `$VAR` and `${VAR}` are expanded.
    pub fn root_dir(mut self, root_dir: impl AsRef<str>) -> Self {
        self.root_dir = expand_path(root_dir.as_ref());
        self
    }

    pub fn monitor_root_dir(mut self, enabled: bool) -> Self {
        self.monitor_root_dir = enabled;
        self
    }

    pub fn monitor_registry(mut self, enabled: bool) -> Self {
        self.monitor_registry = enabled;
        self
    }

    pub fn hot_reload(mut self, enabled: bool) -> Self {
        self.hot_reload = enabled;
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn environment_name(mut self, name: impl Into<String>) -> Self {
        self.environment_name = name.into();
        self
    }

    pub fn executor(mut self, settings: ExecutorSettings) -> Self {
        self.executor = settings;
        self
    }

    pub fn unload_attempts(mut self, attempts: u32) -> Self {
        self.unload_attempts = attempts;
        self
    }

    pub fn main_module_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Path) -> PathBuf + Send + Sync + 'static,
    {
        self.main_module_selector = Some(Arc::new(selector));
        self
    }

    pub fn configure_services<F>(mut self, configure: F) -> Self
    where
        F: Fn(&mut Services, &PluginEnvironment) + Send + Sync + 'static,
    {
        self.services_configurer = Some(Arc::new(configure));
        self
    }

    pub fn build(self) -> PluginsConfig {
        let root_dir = std::path::absolute(&self.root_dir).unwrap_or(self.root_dir);
        PluginsConfig {
            root_dir,
            monitor_root_dir: self.monitor_root_dir,
            monitor_registry: self.monitor_registry,
            hot_reload: self.hot_reload,
            application_name: self.application_name,
            environment_name: self.environment_name,
            executor: ExecutorSettings {
                max_parallelism: self.executor.max_parallelism.max(1),
                ..self.executor
            },
            unload_attempts: self.unload_attempts,
            main_module_selector: self.main_module_selector,
            services_configurer: self.services_configurer,
        }
    }
}

fn default_main_module(plugin_dir: &Path) -> PathBuf {
    let name = plugin_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = std::env::consts::DLL_EXTENSION;

    let candidates = [
        format!("{name}.{ext}"),
        format!("lib{name}.{ext}"),
        format!("lib{}.{ext}", name.replace('-', "_")),
    ];

    candidates
        .iter()
        .map(|file| plugin_dir.join(file))
        .find(|path| path.is_file())
        .unwrap_or_else(|| plugin_dir.join(&candidates[0]))
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references.
///
/// Unset variables are left in place.
pub fn expand_path(raw: &str) -> PathBuf {
    let home_expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs_home() {
            Some(home) => format!("{}{rest}", home.display()),
            None => raw.to_string(),
        },
        _ => raw.to_string(),
    };
    PathBuf::from(expand_env_vars(&home_expanded))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}
