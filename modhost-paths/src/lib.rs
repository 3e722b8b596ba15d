//! XDG Base Directory paths for modhost.
//!
//! The plugin host uses XDG paths on every platform so that a plugin root
//! configured on Linux reads the same way on macOS.

use std::path::PathBuf;

/// Get the modhost config directory.
///
/// Returns `$XDG_CONFIG_HOME/modhost` if set, otherwise `~/.config/modhost`.
///
/// # Examples
///
/// ```
/// use modhost_paths::config_dir;
///
/// let config_file = config_dir().join("config.toml");
/// ```
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("modhost")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config/modhost")
    } else {
        PathBuf::from(".config/modhost")
    }
}

/// Get the modhost data directory.
///
/// Returns `$XDG_DATA_HOME/modhost` if set, otherwise `~/.local/share/modhost`.
/// Installed plugins and feed lock files live here.
pub fn data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data).join("modhost")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".local/share/modhost")
    } else {
        PathBuf::from(".local/share/modhost")
    }
}

/// Default plugin root directory: `<data_dir>/plugins`.
pub fn plugins_dir() -> PathBuf {
    data_dir().join("plugins")
}

/// Default location of the feed lock record: `<data_dir>/feed.lock.json`.
pub fn feed_lock_file() -> PathBuf {
    data_dir().join("feed.lock.json")
}

/// Directory holding per-generation shadow copies of native plugin libraries.
pub fn shadow_dir() -> PathBuf {
    std::env::temp_dir().join("modhost-shadow")
}
