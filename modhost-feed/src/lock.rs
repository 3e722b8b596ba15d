//! Package lock record
//!
//! Remembers the newest version seen for every package id so a feed poll
//! only reports what actually changed.

use std::path::{Path, PathBuf};

use modhost_core::parse_version_lenient;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::feed::FeedPackage;

/// One `{ "id", "version" }` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub id: String,
    pub version: String,
}

impl LockRecord {
    fn parsed_version(&self) -> Option<Version> {
        parse_version_lenient(&self.version)
    }
}

#[derive(Debug)]
pub struct PackageLock {
    path: PathBuf,
    records: Vec<LockRecord>,
    dirty: bool,
}

impl PackageLock {
    /// Empty lock persisted to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
            dirty: false,
        }
    }

    /// Read the lock at `path`. A missing or unreadable file yields an empty lock.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<LockRecord>>(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt feed lock");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read feed lock");
                Vec::new()
            }
        };
        debug!(path = %path.display(), records = records.len(), "Loaded feed lock");
        Self {
            path,
            records,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[LockRecord] {
        &self.records
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Recorded version for `id` (case-insensitive)
    pub fn version_of(&self, id: &str) -> Option<Version> {
        self.find(id).and_then(LockRecord::parsed_version)
    }

    /// Record `id` at `version`. Returns `true` if the package was not
    /// recorded yet or `version` is strictly newer than the recorded one.
    pub fn update(&mut self, id: &str, version: &Version) -> bool {
        let index = self
            .records
            .iter()
            .position(|r| r.id.eq_ignore_ascii_case(id));

        if let Some(index) = index {
            let recorded = self.records[index].parsed_version();
            if recorded.is_some_and(|recorded| *version <= recorded) {
                return false;
            }
            self.records.remove(index);
        }

        self.records.push(LockRecord {
            id: id.to_string(),
            version: version.to_string(),
        });
        self.dirty = true;
        true
    }

    /// Record every package and return those that changed.
    pub fn update_all<'a>(&mut self, packages: impl IntoIterator<Item = &'a FeedPackage>) -> Vec<FeedPackage> {
        packages
            .into_iter()
            .filter(|package| self.update(&package.id, &package.version))
            .cloned()
            .collect()
    }

    /// Write the lock if it changed since the last load or save.
    pub async fn save(&mut self) -> Result<(), FeedError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&self.records)?;
        tokio::fs::write(&self.path, json).await?;
        self.dirty = false;
        debug!(path = %self.path.display(), records = self.records.len(), "Saved feed lock");
        Ok(())
    }

    fn find(&self, id: &str) -> Option<&LockRecord> {
        self.records.iter().find(|r| r.id.eq_ignore_ascii_case(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn package(id: &str, version: &str) -> FeedPackage {
        FeedPackage {
            id: id.into(),
            version: Version::parse(version).unwrap(),
            path: PathBuf::new(),
        }
    }

    #[test]
    fn test_update_only_accepts_newer_versions() {
        let mut lock = PackageLock::new("/unused");
        assert!(lock.update("Greeter", &Version::new(1, 0, 0)));
        assert!(!lock.update("greeter", &Version::new(1, 0, 0)));
        assert!(!lock.update("GREETER", &Version::new(0, 9, 0)));
        assert!(lock.update("greeter", &Version::new(1, 1, 0)));

        assert_eq!(lock.records().len(), 1);
        assert_eq!(lock.version_of("Greeter"), Some(Version::new(1, 1, 0)));
        assert!(lock.is_dirty());
    }

    #[test]
    fn test_update_all_returns_changed_packages() {
        let mut lock = PackageLock::new("/unused");
        lock.update("a", &Version::new(1, 0, 0));

        let changed = lock.update_all(&[package("a", "1.0.0"), package("b", "0.1.0")]);
        assert_eq!(changed, vec![package("b", "0.1.0")]);
    }

    #[tokio::test]
    async fn test_save_writes_camel_case_json_only_when_dirty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/feed.lock.json");

        let mut lock = PackageLock::new(&path);
        lock.save().await.unwrap();
        assert!(!path.exists());

        lock.update("greeter", &Version::new(1, 2, 3));
        lock.save().await.unwrap();
        assert!(!lock.is_dirty());

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!([{ "id": "greeter", "version": "1.2.3" }]));

        let reloaded = PackageLock::load(&path).await;
        assert_eq!(reloaded.version_of("greeter"), Some(Version::new(1, 2, 3)));
        assert!(!reloaded.is_dirty());
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let lock = PackageLock::load(tmp.path().join("absent.json")).await;
        assert!(lock.records().is_empty());

        let corrupt = tmp.path().join("corrupt.json");
        std::fs::write(&corrupt, b"{ not json").unwrap();
        let lock = PackageLock::load(&corrupt).await;
        assert!(lock.records().is_empty());
    }

    #[test]
    fn test_unparseable_recorded_version_is_replaced() {
        let mut lock = PackageLock::new("/unused");
        lock.records.push(LockRecord {
            id: "greeter".into(),
            version: "garbage".into(),
        });
        assert!(lock.update("greeter", &Version::new(0, 1, 0)));
        assert_eq!(lock.records().len(), 1);
    }
}
