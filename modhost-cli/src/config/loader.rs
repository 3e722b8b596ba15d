use super::types::{
    ModhostConfig, PluginsSection, RawExecutorSection, RawFeedSection, RawModhostConfig,
    RawPluginsSection,
};
use anyhow::{Context, Result};
use modhost_core::ExecutorSettings;
use modhost_feed::FeedConfig;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<ModhostConfig> {
        let mut raw = RawModhostConfig::default();

        // Layer 1: User config
        let user_path = Self::user_config_path();
        if user_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&user_path)?);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&project_path)?);
        }

        Ok(Self::finalize(raw))
    }

    /// Load a single config file, applying defaults. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<ModhostConfig> {
        if !path.exists() {
            return Ok(ModhostConfig::default());
        }
        Ok(Self::finalize(Self::read_raw(path)?))
    }

    /// User config path: `$XDG_CONFIG_HOME/modhost/config.toml`
    pub fn user_config_path() -> PathBuf {
        modhost_paths::config_dir().join("config.toml")
    }

    /// Get project config path
    /// Can be overridden with MODHOST_PROJECT_CONFIG_DIR env var (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("MODHOST_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".modhost/config.toml")
        }
    }

    fn read_raw(path: &Path) -> Result<RawModhostConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawModhostConfig, overlay: RawModhostConfig) -> RawModhostConfig {
        RawModhostConfig {
            plugins: RawPluginsSection {
                root_dir: overlay.plugins.root_dir.or(base.plugins.root_dir),
                monitor_root_dir: overlay
                    .plugins
                    .monitor_root_dir
                    .or(base.plugins.monitor_root_dir),
                monitor_registry: overlay
                    .plugins
                    .monitor_registry
                    .or(base.plugins.monitor_registry),
                hot_reload: overlay.plugins.hot_reload.or(base.plugins.hot_reload),
                application_name: overlay
                    .plugins
                    .application_name
                    .or(base.plugins.application_name),
                environment_name: overlay
                    .plugins
                    .environment_name
                    .or(base.plugins.environment_name),
                unload_attempts: overlay
                    .plugins
                    .unload_attempts
                    .or(base.plugins.unload_attempts),
            },
            executor: RawExecutorSection {
                max_parallelism: overlay
                    .executor
                    .max_parallelism
                    .or(base.executor.max_parallelism),
                max_retries: overlay.executor.max_retries.or(base.executor.max_retries),
                backoff_step_ms: overlay
                    .executor
                    .backoff_step_ms
                    .or(base.executor.backoff_step_ms),
            },
            feed: RawFeedSection {
                source: overlay.feed.source.or(base.feed.source),
                include_prereleases: overlay
                    .feed
                    .include_prereleases
                    .or(base.feed.include_prereleases),
                monitoring_interval_ms: overlay
                    .feed
                    .monitoring_interval_ms
                    .or(base.feed.monitoring_interval_ms),
                lock_file: overlay.feed.lock_file.or(base.feed.lock_file),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawModhostConfig) -> ModhostConfig {
        let plugins_default = PluginsSection::default();
        let executor_default = ExecutorSettings::default();

        let feed = raw.feed.source.map(|source| {
            let defaults = FeedConfig::default();
            FeedConfig {
                source: PathBuf::from(source),
                include_prereleases: raw
                    .feed
                    .include_prereleases
                    .unwrap_or(defaults.include_prereleases),
                monitoring_interval_ms: raw
                    .feed
                    .monitoring_interval_ms
                    .unwrap_or(defaults.monitoring_interval_ms),
                lock_file: raw
                    .feed
                    .lock_file
                    .map(|p| modhost_core::expand_path(&p))
                    .unwrap_or(defaults.lock_file),
            }
        });

        ModhostConfig {
            plugins: PluginsSection {
                root_dir: raw.plugins.root_dir.unwrap_or(plugins_default.root_dir),
                monitor_root_dir: raw
                    .plugins
                    .monitor_root_dir
                    .unwrap_or(plugins_default.monitor_root_dir),
                monitor_registry: raw
                    .plugins
                    .monitor_registry
                    .unwrap_or(plugins_default.monitor_registry),
                hot_reload: raw.plugins.hot_reload.unwrap_or(plugins_default.hot_reload),
                application_name: raw
                    .plugins
                    .application_name
                    .unwrap_or(plugins_default.application_name),
                environment_name: raw
                    .plugins
                    .environment_name
                    .unwrap_or(plugins_default.environment_name),
                unload_attempts: raw
                    .plugins
                    .unload_attempts
                    .unwrap_or(plugins_default.unload_attempts),
            },
            executor: ExecutorSettings {
                max_parallelism: raw
                    .executor
                    .max_parallelism
                    .unwrap_or(executor_default.max_parallelism),
                max_retries: raw
                    .executor
                    .max_retries
                    .unwrap_or(executor_default.max_retries),
                backoff_step_ms: raw
                    .executor
                    .backoff_step_ms
                    .unwrap_or(executor_default.backoff_step_ms),
            },
            feed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{contents}").unwrap();
        path
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigLoader::load_from_path(&temp_dir.path().join("missing.toml")).unwrap();

        assert_eq!(config, ModhostConfig::default());
        assert!(config.plugins.hot_reload);
        assert!(!config.plugins.monitor_root_dir);
        assert_eq!(config.executor.max_parallelism, 3);
        assert!(config.feed.is_none());
    }

    #[test]
    fn test_load_from_valid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            temp_dir.path(),
            r#"
[plugins]
root_dir = "/srv/plugins"
monitor_root_dir = true

[executor]
max_retries = 5

[feed]
source = "/srv/feed"
include_prereleases = true
"#,
        );

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.plugins.root_dir, "/srv/plugins");
        assert!(config.plugins.monitor_root_dir);
        assert_eq!(config.executor.max_retries, 5);
        assert_eq!(config.executor.backoff_step_ms, 200);

        let feed = config.feed.unwrap();
        assert_eq!(feed.source, PathBuf::from("/srv/feed"));
        assert!(feed.include_prereleases);
        assert_eq!(feed.monitoring_interval_ms, 20_000);
    }

    #[test]
    fn test_load_invalid_toml_returns_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(temp_dir.path(), "this is not valid toml {{{{");
        assert!(ConfigLoader::load_from_path(&path).is_err());
    }

    #[test]
    fn test_merge_raw_overlay_overrides_base() {
        let base: RawModhostConfig = toml::from_str(
            r#"
[plugins]
root_dir = "/base"
hot_reload = false
environment_name = "Staging"
"#,
        )
        .unwrap();
        let overlay: RawModhostConfig = toml::from_str(
            r#"
[plugins]
root_dir = "/overlay"
"#,
        )
        .unwrap();

        let merged = ConfigLoader::finalize(ConfigLoader::merge_raw(base, overlay));
        assert_eq!(merged.plugins.root_dir, "/overlay");
        assert!(!merged.plugins.hot_reload);
        assert_eq!(merged.plugins.environment_name, "Staging");
    }

    #[test]
    #[serial]
    fn test_project_config_dir_override() {
        let temp_dir = TempDir::new().unwrap();
        // SAFETY: serialized with the other env-mutating tests
        unsafe { std::env::set_var("MODHOST_PROJECT_CONFIG_DIR", temp_dir.path()) };
        let path = ConfigLoader::project_config_path();
        unsafe { std::env::remove_var("MODHOST_PROJECT_CONFIG_DIR") };

        assert_eq!(path, temp_dir.path().join("config.toml"));
        assert_eq!(
            ConfigLoader::project_config_path(),
            PathBuf::from(".modhost/config.toml")
        );
    }

    #[test]
    fn test_plugins_config_carries_settings() {
        let mut config = ModhostConfig::default();
        config.plugins.root_dir = "/srv/plugins".into();
        config.plugins.environment_name = "Development".into();

        let plugins = config.plugins_config();
        assert_eq!(plugins.root_dir(), Path::new("/srv/plugins"));
        assert_eq!(plugins.environment_name(), "Development");
    }
}
