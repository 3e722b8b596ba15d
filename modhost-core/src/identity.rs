//! Plugin identity types
//!
//! - [`PluginDir`] - the path key a handle is identified by
//! - [`ModuleIdentity`] - name and version derived from a loaded module
//! - [`QualifiedTypeName`] - `"TypeName, ModuleName"` lookups

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};

use modhost_plugin_api::ModuleMetadata;
use semver::Version;

use crate::error::PluginHostError;

/// Absolute, normalized plugin directory path.
///
/// Equality and hashing ignore case so the same directory reached through
/// differently cased paths maps to a single handle.
#[derive(Clone)]
pub struct PluginDir {
    path: PathBuf,
    key: String,
}

impl PluginDir {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = normalize(path.as_ref());
        let key = path.to_string_lossy().to_lowercase();
        Self { path, key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, the plugin's directory name
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Whether `other` names this directory
    pub fn matches(&self, other: impl AsRef<Path>) -> bool {
        *self == PluginDir::new(other)
    }
}

impl PartialEq for PluginDir {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PluginDir {}

impl Hash for PluginDir {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for PluginDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginDir").field(&self.path).finish()
    }
}

impl fmt::Display for PluginDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<&Path> for PluginDir {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<&str> for PluginDir {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<&PluginDir> for PluginDir {
    fn from(dir: &PluginDir) -> Self {
        dir.clone()
    }
}

impl AsRef<Path> for PluginDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl From<PathBuf> for PluginDir {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Name and version of a loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    pub name: String,
    pub version: Version,
}

impl ModuleIdentity {
    /// Derive the identity from module metadata.
    ///
    /// The version is taken from the first usable source among product
    /// version, file version and crate version.
    pub fn from_metadata(
        metadata: &ModuleMetadata,
        main_module: &Path,
    ) -> Result<Self, PluginHostError> {
        let version = derive_version(metadata).ok_or_else(|| PluginHostError::VersionUnavailable {
            module: main_module.to_path_buf(),
        })?;
        Ok(Self {
            name: metadata.name.clone(),
            version,
        })
    }

    /// Whether this identity names `module`, ignoring case
    pub fn is_named(&self, module: &str) -> bool {
        self.name.eq_ignore_ascii_case(module)
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

fn derive_version(metadata: &ModuleMetadata) -> Option<Version> {
    metadata
        .product_version
        .as_deref()
        .and_then(parse_version_lenient)
        .or_else(|| {
            metadata
                .file_version
                .as_deref()
                .and_then(parse_version_lenient)
        })
        .or_else(|| {
            metadata
                .crate_version
                .map(|v| Version::new(v.major, v.minor, v.patch))
        })
}

/// Parse a version string, accepting strict semver as well as the
/// `major.minor[.patch[.revision]]` form. A revision is kept as build metadata.
pub fn parse_version_lenient(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    let raw = raw.strip_prefix(['v', 'V']).unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }

    let core = raw.split(['+', '-', ' ']).next().unwrap_or_default();
    let parts = core
        .split('.')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    let mut version = match parts.as_slice() {
        [major] => Version::new(*major, 0, 0),
        [major, minor] => Version::new(*major, *minor, 0),
        [major, minor, patch] | [major, minor, patch, _] => Version::new(*major, *minor, *patch),
        _ => return None,
    };
    if let [_, _, _, revision] = parts.as_slice() {
        version.build = semver::BuildMetadata::new(&revision.to_string()).ok()?;
    }
    Some(version)
}

/// A type name qualified with the module it lives in: `"TypeName, ModuleName"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedTypeName {
    pub type_name: String,
    pub module: String,
}

impl QualifiedTypeName {
    /// Split at the first comma. Both halves are trimmed and must be non-empty.
    pub fn parse(qualified: &str) -> Result<Self, PluginHostError> {
        let invalid = || PluginHostError::InvalidQualifiedName(qualified.to_string());
        let (type_name, module) = qualified.split_once(',').ok_or_else(invalid)?;
        let (type_name, module) = (type_name.trim(), module.trim());
        if type_name.is_empty() || module.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            type_name: type_name.to_string(),
            module: module.to_string(),
        })
    }
}

impl std::str::FromStr for QualifiedTypeName {
    type Err = PluginHostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for QualifiedTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.type_name, self.module)
    }
}
