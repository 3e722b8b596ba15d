//! Native dynamic-library load contexts

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use libloading::{Library, Symbol};
use modhost_plugin_api::{API_VERSION, API_VERSION_SYMBOL, CREATE_SYMBOL, PluginModule};
use notify::{RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tracing::{debug, info, warn};

use super::{LoadContext, LoadContextFactory, LoadedModule, ReloadCallback, ShadowFile};
use crate::error::PluginHostError;
use crate::identity::PluginDir;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

static CONTEXT_IDS: AtomicU64 = AtomicU64::new(1);

/// Loads plugins from dynamic libraries.
///
/// Each generation is loaded from its own copy of the main module under the
/// shadow directory, so a rebuilt library can be loaded while the previous
/// generation is still mapped. With hot reload enabled, changes to the main
/// module fire the reload callback after a quiet period.
#[derive(Debug, Clone)]
pub struct NativeLoader {
    shadow_root: PathBuf,
    hot_reload: bool,
    debounce: Duration,
}

impl NativeLoader {
    pub fn new(hot_reload: bool) -> Self {
        Self {
            shadow_root: modhost_paths::shadow_dir(),
            hot_reload,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_shadow_root(mut self, shadow_root: impl Into<PathBuf>) -> Self {
        self.shadow_root = shadow_root.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

impl LoadContextFactory for NativeLoader {
    fn create(
        &self,
        plugin_dir: &PluginDir,
        main_module: &Path,
    ) -> Result<Arc<dyn LoadContext>, PluginHostError> {
        let id = CONTEXT_IDS.fetch_add(1, Ordering::Relaxed);
        let shadow_dir = self.shadow_root.join(format!(
            "{}-{}-{id}",
            plugin_dir.name(),
            std::process::id()
        ));

        Ok(Arc::new(NativeContext {
            plugin_dir: plugin_dir.clone(),
            main_module: main_module.to_path_buf(),
            shadow_dir,
            generation: AtomicU64::new(0),
            hot_reload: self.hot_reload,
            debounce: self.debounce,
            callback: Arc::new(Mutex::new(None)),
            watch: Mutex::new(None),
        }))
    }
}

struct WatchState {
    watcher: RecommendedWatcher,
    stop: mpsc::Sender<Signal>,
    thread: JoinHandle<()>,
}

enum Signal {
    Changed,
    Stop,
}

struct NativeContext {
    plugin_dir: PluginDir,
    main_module: PathBuf,
    shadow_dir: PathBuf,
    generation: AtomicU64,
    hot_reload: bool,
    debounce: Duration,
    callback: Arc<Mutex<Option<ReloadCallback>>>,
    watch: Mutex<Option<WatchState>>,
}

impl NativeContext {
    fn shadow_copy(&self, generation: u64) -> Result<ShadowFile, PluginHostError> {
        std::fs::create_dir_all(&self.shadow_dir)?;
        let file_name = self
            .main_module
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let shadow = self.shadow_dir.join(format!("{generation}-{file_name}"));
        std::fs::copy(&self.main_module, &shadow)?;
        Ok(ShadowFile(shadow))
    }

    fn start_watching(&self) -> Result<(), PluginHostError> {
        let mut watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if watch.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<Signal>();
        let main_module = self.main_module.clone();
        let events = tx.clone();
        let mut watcher = recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event
                && event.paths.iter().any(|p| p == &main_module)
                && (event.kind.is_create() || event.kind.is_modify())
            {
                let _ = events.send(Signal::Changed);
            }
        })?;
        watcher.watch(self.plugin_dir.path(), RecursiveMode::NonRecursive)?;

        let callback = self.callback.clone();
        let debounce = self.debounce;
        let dir = self.plugin_dir.clone();
        let thread = std::thread::Builder::new()
            .name(format!("modhost-reload-{}", dir.name()))
            .spawn(move || debounce_loop(rx, callback, debounce, dir))?;

        debug!(dir = %self.plugin_dir, "Watching main module for changes");
        *watch = Some(WatchState {
            watcher,
            stop: tx,
            thread,
        });
        Ok(())
    }

    fn stop_watching(&self) {
        let state = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(state) = state {
            let _ = state.stop.send(Signal::Stop);
            drop(state.watcher);
            if state.thread.join().is_err() {
                warn!(dir = %self.plugin_dir, "Reload watcher thread panicked");
            }
        }
    }
}

/// Waits for a change, then for a quiet period, then fires the callback.
fn debounce_loop(
    rx: mpsc::Receiver<Signal>,
    callback: Arc<Mutex<Option<ReloadCallback>>>,
    debounce: Duration,
    dir: PluginDir,
) {
    loop {
        match rx.recv() {
            Ok(Signal::Changed) => {}
            Ok(Signal::Stop) | Err(_) => return,
        }

        debug!(dir = %dir, "Main module change detected, starting debounce");
        loop {
            match rx.recv_timeout(debounce) {
                Ok(Signal::Changed) => continue,
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        let current = callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(reload) = current {
            info!(dir = %dir, "Main module changed, reloading plugin");
            reload();
        }
    }
}

impl LoadContext for NativeContext {
    fn main_module(&self) -> &Path {
        &self.main_module
    }

    fn load(&self) -> Result<Arc<LoadedModule>, PluginHostError> {
        if !self.main_module.is_file() {
            return Err(PluginHostError::LibraryNotFound {
                dir: self.plugin_dir.path().to_path_buf(),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shadow = self.shadow_copy(generation)?;

        // SAFETY: the library lives in a plugin directory the host was
        // configured to load from and is expected to follow the plugin ABI.
        let library = unsafe { Library::new(&shadow.0)? };

        let module = {
            // SAFETY: the symbol is an `extern "C" fn() -> u32` emitted by `export_plugin!`.
            let api_version: Symbol<extern "C" fn() -> u32> =
                unsafe { library.get(API_VERSION_SYMBOL)? };
            let found = api_version();
            if found != API_VERSION {
                return Err(PluginHostError::ApiVersionMismatch {
                    expected: API_VERSION,
                    found,
                });
            }

            // SAFETY: `_modhost_plugin_create` hands over a pointer from `Box::into_raw`.
            let create: Symbol<extern "C" fn() -> *mut dyn PluginModule> =
                unsafe { library.get(CREATE_SYMBOL)? };
            unsafe { Box::from_raw(create()) }
        };

        debug!(
            dir = %self.plugin_dir,
            generation,
            shadow = %shadow.0.display(),
            "Loaded native plugin library"
        );

        Ok(Arc::new(LoadedModule::native(
            module,
            library,
            shadow,
            self.main_module.clone(),
            generation,
        )))
    }

    fn set_reload_callback(&self, callback: Option<ReloadCallback>) {
        let enable = callback.is_some();
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;

        if !enable {
            self.stop_watching();
        } else if self.hot_reload
            && let Err(e) = self.start_watching()
        {
            warn!(dir = %self.plugin_dir, error = %e, "Hot reload unavailable");
        }
    }

    fn unload(&self) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.stop_watching();
        if let Err(e) = std::fs::remove_dir(&self.shadow_dir) {
            debug!(dir = %self.shadow_dir.display(), error = %e, "Shadow directory left in place");
        }
    }
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn context(root: &TempDir, hot_reload: bool) -> (Arc<dyn LoadContext>, PathBuf) {
        let dir = root.path().join("greeter");
        std::fs::create_dir_all(&dir).unwrap();
        let main = dir.join(format!("greeter.{}", std::env::consts::DLL_EXTENSION));

        let loader = NativeLoader::new(hot_reload)
            .with_shadow_root(root.path().join("shadow"))
            .with_debounce(Duration::from_millis(50));
        let ctx = loader.create(&PluginDir::new(&dir), &main).unwrap();
        (ctx, main)
    }

    #[test]
    fn test_missing_library_is_reported() {
        let root = TempDir::new().unwrap();
        let (ctx, _main) = context(&root, false);
        let err = ctx.load().unwrap_err();
        assert!(matches!(err, PluginHostError::LibraryNotFound { .. }));
    }

    #[test]
    fn test_invalid_library_fails_and_cleans_shadow_copy() {
        let root = TempDir::new().unwrap();
        let (ctx, main) = context(&root, false);
        std::fs::write(&main, b"definitely not a shared object").unwrap();

        let err = ctx.load().unwrap_err();
        assert!(matches!(err, PluginHostError::LibraryLoad(_)));

        let leftovers: Vec<_> = std::fs::read_dir(root.path().join("shadow"))
            .unwrap()
            .flat_map(|d| std::fs::read_dir(d.unwrap().path()).unwrap())
            .collect();
        assert!(leftovers.is_empty());
        ctx.unload();
    }

    #[test]
    fn test_change_fires_reload_callback_once_after_debounce() {
        let root = TempDir::new().unwrap();
        let (ctx, main) = context(&root, true);
        std::fs::write(&main, b"v1").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        ctx.set_reload_callback(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        std::thread::sleep(Duration::from_millis(100));
        std::fs::write(&main, b"v2").unwrap();
        std::fs::write(&main, b"v3").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        ctx.unload();
        std::fs::write(&main, b"v4").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
