//! Directory feed: `<source>/<name>/<version>/...`

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use modhost_core::{RegistryEntry, RegistryError, parse_version_lenient};
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::FeedError;

/// One version of one package in a feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPackage {
    pub id: String,
    pub version: Version,
    /// The version directory
    pub path: PathBuf,
}

impl fmt::Display for FeedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.version)
    }
}

/// Lists packages published as versioned directories below a source folder.
#[derive(Debug, Clone)]
pub struct DirectoryFeed {
    source: PathBuf,
    include_prereleases: bool,
}

impl DirectoryFeed {
    pub fn new(source: impl Into<PathBuf>, include_prereleases: bool) -> Self {
        Self {
            source: source.into(),
            include_prereleases,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The highest version of every package, sorted by id.
    ///
    /// Version directories whose names are not versions are skipped, as are
    /// prereleases unless the feed includes them.
    pub async fn list_latest(&self) -> Result<Vec<FeedPackage>, FeedError> {
        if !tokio::fs::try_exists(&self.source).await? {
            return Err(FeedError::SourceNotFound {
                path: self.source.clone(),
            });
        }

        let mut latest = Vec::new();
        for package_dir in subdirectories(&self.source).await? {
            let Some(id) = package_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(package) = self.latest_version(id, &package_dir).await? {
                latest.push(package);
            }
        }
        latest.sort_by(|a, b| a.id.to_lowercase().cmp(&b.id.to_lowercase()));
        debug!(source = %self.source.display(), packages = latest.len(), "Listed feed");
        Ok(latest)
    }

    async fn latest_version(&self, id: &str, package_dir: &Path) -> Result<Option<FeedPackage>, FeedError> {
        let mut best: Option<FeedPackage> = None;
        for version_dir in subdirectories(package_dir).await? {
            let raw = version_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(version) = parse_version_lenient(&raw) else {
                trace!(package = id, version = %raw, "Skipping non-version directory");
                continue;
            };
            if !version.pre.is_empty() && !self.include_prereleases {
                continue;
            }
            if best.as_ref().is_none_or(|b| version > b.version) {
                best = Some(FeedPackage {
                    id: id.to_string(),
                    version,
                    path: version_dir,
                });
            }
        }
        Ok(best)
    }
}

async fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, FeedError> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// A feed package offered to the plugin host
#[derive(Debug, Clone)]
pub struct FeedEntry {
    package: FeedPackage,
}

impl FeedEntry {
    pub fn new(package: FeedPackage) -> Self {
        Self { package }
    }

    pub fn package(&self) -> &FeedPackage {
        &self.package
    }
}

#[async_trait]
impl RegistryEntry for FeedEntry {
    fn name(&self) -> &str {
        &self.package.id
    }

    fn version(&self) -> &Version {
        &self.package.version
    }

    /// Copy the version directory's content into `target`, overwriting files.
    async fn materialize(&self, target: &Path, cancel: &CancellationToken) -> Result<(), RegistryError> {
        debug!(package = %self.package, target = %target.display(), "Copying package");
        copy_tree(&self.package.path, target, cancel).await?;
        Ok(())
    }
}

async fn copy_tree(from: &Path, to: &Path, cancel: &CancellationToken) -> Result<(), FeedError> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(FeedError::Cancelled);
            }
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publish(source: &Path, id: &str, version: &str) {
        let dir = source.join(id).join(version);
        std::fs::create_dir_all(dir.join("assets")).unwrap();
        std::fs::write(dir.join(format!("lib{id}.so")), version).unwrap();
        std::fs::write(dir.join("assets/readme.txt"), id).unwrap();
    }

    #[tokio::test]
    async fn test_lists_highest_version_per_package() {
        let source = TempDir::new().unwrap();
        publish(source.path(), "greeter", "1.0.0");
        publish(source.path(), "greeter", "1.10.0");
        publish(source.path(), "greeter", "1.9.0");
        publish(source.path(), "greeter", "2.0.0-beta.1");
        publish(source.path(), "discounts", "0.3");
        std::fs::create_dir_all(source.path().join("discounts/latest")).unwrap();

        let feed = DirectoryFeed::new(source.path(), false);
        let latest = feed.list_latest().await.unwrap();
        let summary: Vec<_> = latest.iter().map(|p| p.to_string()).collect();
        assert_eq!(summary, vec!["discounts 0.3.0", "greeter 1.10.0"]);

        let feed = DirectoryFeed::new(source.path(), true);
        let latest = feed.list_latest().await.unwrap();
        assert_eq!(latest[1].version, Version::parse("2.0.0-beta.1").unwrap());
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let feed = DirectoryFeed::new(tmp.path().join("absent"), false);
        assert!(matches!(
            feed.list_latest().await,
            Err(FeedError::SourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_materialize_copies_recursively() {
        let source = TempDir::new().unwrap();
        publish(source.path(), "greeter", "1.0.0");
        let target = TempDir::new().unwrap();
        std::fs::write(target.path().join("libgreeter.so"), "old").unwrap();

        let feed = DirectoryFeed::new(source.path(), false);
        let package = feed.list_latest().await.unwrap().remove(0);
        let entry = FeedEntry::new(package);
        assert_eq!(entry.name(), "greeter");

        entry
            .materialize(target.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(target.path().join("libgreeter.so")).unwrap(),
            "1.0.0"
        );
        assert!(target.path().join("assets/readme.txt").is_file());
    }

    #[tokio::test]
    async fn test_materialize_observes_cancellation() {
        let source = TempDir::new().unwrap();
        publish(source.path(), "greeter", "1.0.0");
        let target = TempDir::new().unwrap();

        let entry = FeedEntry::new(FeedPackage {
            id: "greeter".into(),
            version: Version::new(1, 0, 0),
            path: source.path().join("greeter/1.0.0"),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(entry.materialize(target.path(), &cancel).await.is_err());
    }
}
