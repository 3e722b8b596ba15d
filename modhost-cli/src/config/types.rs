use std::path::PathBuf;

use modhost_core::{ExecutorSettings, PluginsConfig};
use modhost_feed::FeedConfig;
use serde::{Deserialize, Serialize};

/// Default application name handed to plugins
pub const DEFAULT_APPLICATION_NAME: &str = "modhost";
/// Default environment name handed to plugins
pub const DEFAULT_ENVIRONMENT_NAME: &str = "Production";

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawModhostConfig {
    #[serde(default)]
    pub plugins: RawPluginsSection,

    #[serde(default)]
    pub executor: RawExecutorSection,

    #[serde(default)]
    pub feed: RawFeedSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPluginsSection {
    /// Plugin root; `~` and `$VAR` are expanded
    pub root_dir: Option<String>,
    pub monitor_root_dir: Option<bool>,
    pub monitor_registry: Option<bool>,
    pub hot_reload: Option<bool>,
    pub application_name: Option<String>,
    pub environment_name: Option<String>,
    pub unload_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawExecutorSection {
    pub max_parallelism: Option<usize>,
    pub max_retries: Option<u32>,
    pub backoff_step_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawFeedSection {
    /// Feed source directory; no feed is used when unset
    pub source: Option<String>,
    pub include_prereleases: Option<bool>,
    pub monitoring_interval_ms: Option<u64>,
    pub lock_file: Option<String>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModhostConfig {
    pub plugins: PluginsSection,
    pub executor: ExecutorSettings,
    /// Present when a feed source is configured
    pub feed: Option<FeedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginsSection {
    pub root_dir: String,
    pub monitor_root_dir: bool,
    pub monitor_registry: bool,
    pub hot_reload: bool,
    pub application_name: String,
    pub environment_name: String,
    pub unload_attempts: u32,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            root_dir: modhost_paths::plugins_dir().to_string_lossy().into_owned(),
            monitor_root_dir: false,
            monitor_registry: true,
            hot_reload: true,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            environment_name: DEFAULT_ENVIRONMENT_NAME.to_string(),
            unload_attempts: modhost_core::config::DEFAULT_UNLOAD_ATTEMPTS,
        }
    }
}

impl Default for ModhostConfig {
    fn default() -> Self {
        Self {
            plugins: PluginsSection::default(),
            executor: ExecutorSettings::default(),
            feed: None,
        }
    }
}

impl ModhostConfig {
    /// The plugin host configuration these settings describe
    pub fn plugins_config(&self) -> PluginsConfig {
        let plugins = &self.plugins;
        PluginsConfig::builder()
            .root_dir(&plugins.root_dir)
            .monitor_root_dir(plugins.monitor_root_dir)
            .monitor_registry(plugins.monitor_registry)
            .hot_reload(plugins.hot_reload)
            .application_name(&plugins.application_name)
            .environment_name(&plugins.environment_name)
            .unload_attempts(plugins.unload_attempts)
            .executor(self.executor)
            .build()
    }

    /// Feed configuration with a relative source anchored at the working directory
    pub fn feed_config(&self) -> Option<FeedConfig> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        self.feed.clone().map(|feed| feed.resolve_source(&cwd))
    }
}
