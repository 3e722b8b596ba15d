//! Module metadata embedded in every plugin binary

use serde::{Deserialize, Serialize};

/// Metadata a plugin module reports about itself.
///
/// The host derives the module's version from the first usable source in
/// the order `product_version`, `file_version`, `crate_version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Module name. Matched case-insensitively against registry entry names.
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Marketing version declared by the plugin author (semver)
    #[serde(default)]
    pub product_version: Option<String>,
    /// Build-stamped version, may use the four-part `a.b.c.d` form
    #[serde(default)]
    pub file_version: Option<String>,
    /// Version of the crate the module was compiled from
    #[serde(default)]
    pub crate_version: Option<CrateVersion>,
}

impl ModuleMetadata {
    /// Create metadata with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: set the product version
    pub fn with_product_version(mut self, version: impl Into<String>) -> Self {
        self.product_version = Some(version.into());
        self
    }

    /// Builder: set the file version
    pub fn with_file_version(mut self, version: impl Into<String>) -> Self {
        self.file_version = Some(version.into());
        self
    }

    /// Builder: set the crate version
    pub fn with_crate_version(mut self, version: CrateVersion) -> Self {
        self.crate_version = Some(version);
        self
    }
}

/// `major.minor.patch` triple of the crate a module was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrateVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl CrateVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Build from the `CARGO_PKG_VERSION_*` strings. Non-numeric input
    /// yields zero for that component.
    pub const fn from_cargo(major: &str, minor: &str, patch: &str) -> Self {
        Self::new(parse_u64(major), parse_u64(minor), parse_u64(patch))
    }
}

impl std::fmt::Display for CrateVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

const fn parse_u64(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut value = 0u64;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if !b.is_ascii_digit() {
            return 0;
        }
        value = value * 10 + (b - b'0') as u64;
        i += 1;
    }
    value
}

/// Expands to the [`CrateVersion`] of the crate invoking it.
#[macro_export]
macro_rules! crate_version {
    () => {
        $crate::CrateVersion::from_cargo(
            env!("CARGO_PKG_VERSION_MAJOR"),
            env!("CARGO_PKG_VERSION_MINOR"),
            env!("CARGO_PKG_VERSION_PATCH"),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_versions() {
        let meta = ModuleMetadata::new("greeter")
            .with_product_version("1.2.0-beta.1")
            .with_file_version("1.2.0.17")
            .with_crate_version(CrateVersion::new(1, 2, 0));

        assert_eq!(meta.name, "greeter");
        assert_eq!(meta.product_version.as_deref(), Some("1.2.0-beta.1"));
        assert_eq!(meta.file_version.as_deref(), Some("1.2.0.17"));
        assert_eq!(meta.crate_version, Some(CrateVersion::new(1, 2, 0)));
    }

    #[test]
    fn test_crate_version_from_cargo_strings() {
        let v = CrateVersion::from_cargo("3", "14", "159");
        assert_eq!(v, CrateVersion::new(3, 14, 159));
        assert_eq!(v.to_string(), "3.14.159");
    }

    #[test]
    fn test_crate_version_non_numeric_is_zero() {
        assert_eq!(CrateVersion::from_cargo("1", "x", "2"), CrateVersion::new(1, 0, 2));
    }

    #[test]
    fn test_crate_version_macro_matches_this_crate() {
        let v = crate::crate_version!();
        assert_eq!(v.to_string(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_metadata_toml_missing_optionals() {
        let meta: ModuleMetadata = toml::from_str(r#"name = "bare""#).unwrap();
        assert_eq!(meta.name, "bare");
        assert!(meta.product_version.is_none());
        assert!(meta.crate_version.is_none());
    }

    #[test]
    fn test_metadata_json_manifest() {
        let meta: ModuleMetadata = serde_json::from_str(
            r#"{
                "name": "greeter",
                "file_version": "2.1.0.4",
                "crate_version": { "major": 2, "minor": 1, "patch": 0 }
            }"#,
        )
        .unwrap();
        assert_eq!(meta.file_version.as_deref(), Some("2.1.0.4"));
        assert_eq!(meta.crate_version, Some(CrateVersion::new(2, 1, 0)));
        assert!(meta.description.is_empty());

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["name"], "greeter");
        assert!(json["product_version"].is_null());
    }
}
