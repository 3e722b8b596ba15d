//! Plugin root directory enumeration and monitoring

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PluginHostError;

/// How long the first half of a tracked rename waits for the second
const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(100);

/// A change to the set of plugin directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryChange {
    Added(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl DirectoryChange {
    /// Path the change leaves behind (the new path for renames)
    pub fn path(&self) -> &Path {
        match self {
            DirectoryChange::Added(path) | DirectoryChange::Removed(path) => path,
            DirectoryChange::Renamed { to, .. } => to,
        }
    }
}

impl std::fmt::Display for DirectoryChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryChange::Added(path) => write!(f, "added {}", path.display()),
            DirectoryChange::Removed(path) => write!(f, "removed {}", path.display()),
            DirectoryChange::Renamed { from, to } => {
                write!(f, "renamed {} -> {}", from.display(), to.display())
            }
        }
    }
}

/// The plugin root: one subdirectory per plugin.
pub struct RootDirectory {
    path: PathBuf,
    watcher: Mutex<Option<Monitor>>,
}

struct Monitor {
    watcher: RecommendedWatcher,
    stop: std_mpsc::Sender<Signal>,
    thread: JoinHandle<()>,
}

enum Signal {
    Event(Event),
    Stop,
}

impl RootDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            watcher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_exists(&self) -> Result<(), PluginHostError> {
        if !self.path.is_dir() {
            info!(dir = %self.path.display(), "Creating plugin root directory");
            std::fs::create_dir_all(&self.path)?;
        }
        Ok(())
    }

    /// Snapshot of the immediate subdirectories, sorted by path
    pub fn plugin_dirs(&self) -> Result<Vec<PathBuf>, PluginHostError> {
        if !self.path.exists() {
            debug!(dir = %self.path.display(), "Plugin root does not exist");
            return Ok(Vec::new());
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Directory a plugin named `name` lives in
    pub fn plugin_dir(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn is_monitoring(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start watching the root for added, removed and renamed plugin
    /// directories. Changes arrive on the returned channel.
    pub fn start_monitoring(&self) -> Result<mpsc::UnboundedReceiver<DirectoryChange>, PluginHostError> {
        let mut slot = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(PluginHostError::InvalidState {
                expected: "not monitoring".to_string(),
                actual: "monitoring".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, raw) = std_mpsc::channel::<Signal>();
        let stop = events.clone();
        let mut watcher = recommended_watcher(move |event: notify::Result<Event>| match event {
            Ok(event) => {
                let _ = events.send(Signal::Event(event));
            }
            Err(e) => warn!(error = %e, "Plugin root watch error"),
        })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        let root = self.path.clone();
        let thread = std::thread::Builder::new()
            .name("modhost-root-watch".to_string())
            .spawn(move || forward_changes(raw, tx, root))?;

        info!(dir = %self.path.display(), "Monitoring plugin root");
        *slot = Some(Monitor {
            watcher,
            stop,
            thread,
        });
        Ok(rx)
    }

    /// Stop watching. The change channel closes. Returns `false` if not monitoring.
    pub fn stop_monitoring(&self) -> bool {
        let monitor = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(monitor) = monitor else {
            return false;
        };

        let _ = monitor.stop.send(Signal::Stop);
        drop(monitor.watcher);
        if monitor.thread.join().is_err() {
            warn!(dir = %self.path.display(), "Plugin root watch thread panicked");
        }
        debug!(dir = %self.path.display(), "Stopped monitoring plugin root");
        true
    }
}

impl std::fmt::Debug for RootDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootDirectory")
            .field("path", &self.path)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

/// Pair raw events into changes until stopped or the watcher goes away.
fn forward_changes(
    raw: std_mpsc::Receiver<Signal>,
    tx: mpsc::UnboundedSender<DirectoryChange>,
    root: PathBuf,
) {
    let mut pairing = RenamePairing::new(root);
    loop {
        let signal = if pairing.is_waiting() {
            match raw.recv_timeout(RENAME_PAIR_WINDOW) {
                Ok(signal) => signal,
                Err(RecvTimeoutError::Timeout) => {
                    send_all(&tx, pairing.expire());
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        } else {
            match raw.recv() {
                Ok(signal) => signal,
                Err(_) => return,
            }
        };

        match signal {
            Signal::Event(event) => send_all(&tx, pairing.push(event)),
            Signal::Stop => return,
        }
    }
}

fn send_all(tx: &mpsc::UnboundedSender<DirectoryChange>, changes: Vec<DirectoryChange>) {
    for change in changes {
        debug!(change = %change, "Plugin root changed");
        let _ = tx.send(change);
    }
}

struct PendingRename {
    tracker: usize,
    from: Event,
    to: Option<Event>,
}

/// Joins the halves of tracked renames.
///
/// A tracked `From` is held until the `Both` event with the same tracker
/// arrives. Any other event, or [`expire`](Self::expire), releases it as a
/// removal, so directories moved out of the root are still reported. A
/// tracked `To` with no held `From` is a directory moved into the root.
pub(crate) struct RenamePairing {
    root: PathBuf,
    pending: Option<PendingRename>,
}

impl RenamePairing {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root, pending: None }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn push(&mut self, event: Event) -> Vec<DirectoryChange> {
        let held = self.pending.as_ref().map(|p| p.tracker);
        match (event.kind, event.tracker()) {
            (EventKind::Modify(ModifyKind::Name(RenameMode::From)), Some(tracker)) => {
                let changes = self.expire();
                self.pending = Some(PendingRename {
                    tracker,
                    from: event,
                    to: None,
                });
                changes
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::To)), Some(tracker))
                if held == Some(tracker) =>
            {
                if let Some(pending) = self.pending.as_mut() {
                    pending.to = Some(event);
                }
                Vec::new()
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::Both)), Some(tracker))
                if held == Some(tracker) =>
            {
                self.pending = None;
                classify(&event, &self.root)
            }
            _ => {
                let mut changes = self.expire();
                changes.extend(classify(&event, &self.root));
                changes
            }
        }
    }

    /// Release a held rename half as the changes it stands for on its own.
    pub(crate) fn expire(&mut self) -> Vec<DirectoryChange> {
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        let mut changes = classify(&pending.from, &self.root);
        if let Some(to) = pending.to {
            changes.extend(classify(&to, &self.root));
        }
        changes
    }
}

/// Turn a filesystem event into plugin directory changes.
///
/// Only immediate children of `root` count. Each half of a rename is treated
/// on its own; [`RenamePairing`] decides when halves combine.
pub fn classify(event: &Event, root: &Path) -> Vec<DirectoryChange> {
    let is_child = |path: &Path| path.parent() == Some(root);

    match event.kind {
        EventKind::Create(CreateKind::Folder) => child_paths(event, is_child)
            .map(DirectoryChange::Added)
            .collect(),
        EventKind::Create(CreateKind::Any | CreateKind::Other) => child_paths(event, is_child)
            .filter(|p| p.is_dir())
            .map(DirectoryChange::Added)
            .collect(),
        EventKind::Remove(RemoveKind::Folder | RemoveKind::Any | RemoveKind::Other) => {
            child_paths(event, is_child)
                .map(DirectoryChange::Removed)
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => match (is_child(from), is_child(to)) {
                (true, true) => vec![DirectoryChange::Renamed {
                    from: from.clone(),
                    to: to.clone(),
                }],
                (true, false) => vec![DirectoryChange::Removed(from.clone())],
                (false, true) if to.is_dir() => vec![DirectoryChange::Added(to.clone())],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            child_paths(event, is_child)
                .map(DirectoryChange::Removed)
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            child_paths(event, is_child)
                .filter(|p| p.is_dir())
                .map(DirectoryChange::Added)
                .collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::Other)) => {
            child_paths(event, is_child)
                .map(|p| {
                    if p.is_dir() {
                        DirectoryChange::Added(p)
                    } else {
                        DirectoryChange::Removed(p)
                    }
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

fn child_paths<'a>(
    event: &'a Event,
    is_child: impl Fn(&Path) -> bool + 'a,
) -> impl Iterator<Item = PathBuf> + 'a {
    event
        .paths
        .iter()
        .filter(move |p| is_child(p.as_path()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(p.to_path_buf()))
    }

    #[test]
    fn test_plugin_dirs_lists_only_directories() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("b")).unwrap();
        std::fs::create_dir(root.path().join("a")).unwrap();
        std::fs::write(root.path().join("notes.txt"), b"").unwrap();

        let dir = RootDirectory::new(root.path());
        let dirs = dir.plugin_dirs().unwrap();
        assert_eq!(dirs, vec![root.path().join("a"), root.path().join("b")]);
    }

    #[test]
    fn test_ensure_exists_creates_root() {
        let tmp = TempDir::new().unwrap();
        let dir = RootDirectory::new(tmp.path().join("nested/plugins"));
        assert!(dir.plugin_dirs().unwrap().is_empty());
        dir.ensure_exists().unwrap();
        assert!(dir.path().is_dir());
        assert_eq!(dir.plugin_dir("x"), tmp.path().join("nested/plugins/x"));
    }

    #[test]
    fn test_classify_create_and_remove() {
        let root = Path::new("/plugins");
        let added = event(
            EventKind::Create(CreateKind::Folder),
            &[Path::new("/plugins/a")],
        );
        assert_eq!(
            classify(&added, root),
            vec![DirectoryChange::Added("/plugins/a".into())]
        );

        let removed = event(
            EventKind::Remove(RemoveKind::Folder),
            &[Path::new("/plugins/a")],
        );
        assert_eq!(
            classify(&removed, root),
            vec![DirectoryChange::Removed("/plugins/a".into())]
        );

        let file = event(
            EventKind::Create(CreateKind::File),
            &[Path::new("/plugins/a.txt")],
        );
        assert!(classify(&file, root).is_empty());
    }

    #[test]
    fn test_classify_ignores_nested_paths() {
        let root = Path::new("/plugins");
        let nested = event(
            EventKind::Create(CreateKind::Folder),
            &[Path::new("/plugins/a/lib")],
        );
        assert!(classify(&nested, root).is_empty());
    }

    #[test]
    fn test_classify_rename() {
        let root = Path::new("/plugins");
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[Path::new("/plugins/old"), Path::new("/plugins/new")],
        );
        assert_eq!(
            classify(&both, root),
            vec![DirectoryChange::Renamed {
                from: "/plugins/old".into(),
                to: "/plugins/new".into(),
            }]
        );

        let moved_out = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[Path::new("/plugins/old"), Path::new("/elsewhere/old")],
        );
        assert_eq!(
            classify(&moved_out, root),
            vec![DirectoryChange::Removed("/plugins/old".into())]
        );
    }

    fn rename(mode: RenameMode, tracker: usize, paths: &[&Path]) -> Event {
        event(EventKind::Modify(ModifyKind::Name(mode)), paths).set_tracker(tracker)
    }

    #[test]
    fn test_pairing_joins_tracked_rename() {
        let mut pairing = RenamePairing::new("/plugins".into());
        let (old, new) = (Path::new("/plugins/old"), Path::new("/plugins/new"));

        assert!(pairing.push(rename(RenameMode::From, 7, &[old])).is_empty());
        assert!(pairing.is_waiting());
        assert!(pairing.push(rename(RenameMode::To, 7, &[new])).is_empty());
        assert_eq!(
            pairing.push(rename(RenameMode::Both, 7, &[old, new])),
            vec![DirectoryChange::Renamed {
                from: old.into(),
                to: new.into(),
            }]
        );
        assert!(!pairing.is_waiting());
        assert!(pairing.expire().is_empty());
    }

    #[test]
    fn test_pairing_releases_unmatched_from_as_removal() {
        let mut pairing = RenamePairing::new("/plugins".into());
        let old = Path::new("/plugins/old");

        assert!(pairing.push(rename(RenameMode::From, 3, &[old])).is_empty());
        assert_eq!(pairing.expire(), vec![DirectoryChange::Removed(old.into())]);

        pairing.push(rename(RenameMode::From, 4, &[old]));
        let created = event(
            EventKind::Create(CreateKind::Folder),
            &[Path::new("/plugins/fresh")],
        );
        assert_eq!(
            pairing.push(created),
            vec![
                DirectoryChange::Removed(old.into()),
                DirectoryChange::Added("/plugins/fresh".into()),
            ]
        );
        assert!(!pairing.is_waiting());
    }

    #[test]
    fn test_pairing_tracked_to_alone_is_addition() {
        let tmp = TempDir::new().unwrap();
        let moved = tmp.path().join("moved");
        std::fs::create_dir(&moved).unwrap();
        let mut pairing = RenamePairing::new(tmp.path().to_path_buf());

        assert_eq!(
            pairing.push(rename(RenameMode::To, 9, &[moved.as_path()])),
            vec![DirectoryChange::Added(moved)]
        );
        let file = tmp.path().join("moved.txt");
        assert!(pairing.push(rename(RenameMode::To, 10, &[file.as_path()])).is_empty());
    }

    #[test]
    fn test_start_monitoring_twice_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let dir = RootDirectory::new(tmp.path());
        let _rx = dir.start_monitoring().unwrap();
        assert!(dir.is_monitoring());
        assert!(dir.start_monitoring().is_err());
        assert!(dir.stop_monitoring());
        assert!(!dir.stop_monitoring());
    }

    #[tokio::test]
    async fn test_monitoring_reports_new_directory() {
        let tmp = TempDir::new().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let dir = RootDirectory::new(&root);
        let mut rx = dir.start_monitoring().unwrap();

        std::fs::create_dir(root.join("fresh")).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, DirectoryChange::Added(root.join("fresh")));

        dir.stop_monitoring();
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<DirectoryChange>) -> Option<DirectoryChange> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_monitoring_reports_directories_moved_in_and_out() {
        let tmp = TempDir::new().unwrap();
        let base = std::fs::canonicalize(tmp.path()).unwrap();
        let root = base.join("root");
        let staging = base.join("staging/moved");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&staging).unwrap();

        let dir = RootDirectory::new(&root);
        let mut rx = dir.start_monitoring().unwrap();
        std::fs::rename(&staging, root.join("moved")).unwrap();
        assert_eq!(
            next_change(&mut rx).await,
            Some(DirectoryChange::Added(root.join("moved")))
        );

        std::fs::rename(root.join("moved"), &staging).unwrap();
        assert_eq!(
            next_change(&mut rx).await,
            Some(DirectoryChange::Removed(root.join("moved")))
        );

        dir.stop_monitoring();
        assert_eq!(next_change(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_monitoring_reports_rename_within_root() {
        let tmp = TempDir::new().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        std::fs::create_dir(root.join("before")).unwrap();

        let dir = RootDirectory::new(&root);
        let mut rx = dir.start_monitoring().unwrap();
        std::fs::rename(root.join("before"), root.join("after")).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            DirectoryChange::Renamed {
                from: root.join("before"),
                to: root.join("after"),
            }
        );
        dir.stop_monitoring();
    }
}
