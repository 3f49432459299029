use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::matcher::RuntimeConfig;

/// Invoked synchronously after every successful reload with the previous
/// and the freshly published snapshot. Implementations must tolerate
/// re-entry and must not assume a particular calling thread.
pub trait ConfigChangeListener: Send + Sync {
    fn on_config_change(&self, old: &Arc<RuntimeConfig>, new: &Arc<RuntimeConfig>);
}

/// 配置管理器：加载、校验、原子发布快照，并监控配置文件变更
/// 重载失败时保留旧快照（要么全部生效，要么完全不生效）
pub struct ConfigManager {
    path: PathBuf,
    current: Arc<ArcSwap<RuntimeConfig>>,
    listeners: Mutex<Vec<Arc<dyn ConfigChangeListener>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigManager {
    /// Performs the initial load; an unreadable or invalid config is fatal
    /// here, while later reload failures only keep the old snapshot.
    pub fn new(path: PathBuf) -> Result<Self> {
        let runtime = load_runtime(&path)?;
        Ok(Self {
            path,
            current: Arc::new(ArcSwap::from_pointee(runtime)),
            listeners: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    pub fn current(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    /// The shared snapshot cell, for handlers that read per request.
    pub fn shared(&self) -> Arc<ArcSwap<RuntimeConfig>> {
        Arc::clone(&self.current)
    }

    /// Parse, validate and compile the file, then publish atomically and
    /// notify listeners. On any error the previous snapshot stays active.
    pub fn load(&self) -> Result<()> {
        let new = Arc::new(load_runtime(&self.path)?);
        let old = self.current.swap(Arc::clone(&new));
        self.notify(&old, &new);
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfigChangeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConfigChangeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    fn notify(&self, old: &Arc<RuntimeConfig>, new: &Arc<RuntimeConfig>) {
        // Snapshot the list so a listener may add or remove listeners
        // while being notified.
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_config_change(old, new);
            }));
            if result.is_err() {
                error!(target = "reload", "config listener panicked, continuing");
            }
        }
    }

    /// Watch the config file's parent directory and reload on write/create
    /// events for the exact file. The watcher thread exits when
    /// `stop_watching` drops the watcher.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let mut guard = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Ok(());
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher: RecommendedWatcher =
            Watcher::new(tx, notify::Config::default()).context("create config watcher")?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch config directory: {}", dir.display()))?;
        *guard = Some(watcher);
        drop(guard);

        let manager = Arc::clone(self);
        thread::spawn(move || manager.run_watch_loop(rx));

        info!(target = "reload", path = %self.path.display(), "config watcher started");
        Ok(())
    }

    pub fn stop_watching(&self) {
        let mut guard = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            info!(target = "reload", "config watcher stopped");
        }
    }

    fn run_watch_loop(&self, rx: Receiver<notify::Result<Event>>) {
        // Dropping the watcher closes the sender; the loop then ends.
        for result in rx {
            match result {
                Ok(event) if self.event_targets_config(&event) => self.reload_with_retry(),
                Ok(_) => {}
                Err(err) => {
                    warn!(target = "reload", error = %err, "watch event error");
                }
            }
        }
    }

    fn event_targets_config(&self, event: &Event) -> bool {
        let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
        relevant && event.paths.iter().any(|p| p == &self.path)
    }

    /// Editors often truncate-then-write; retry briefly before giving up
    /// and keeping the old snapshot.
    fn reload_with_retry(&self) {
        let mut retries = 3;
        loop {
            match self.load() {
                Ok(()) => {
                    info!(target = "reload", path = %self.path.display(), "config reloaded");
                    break;
                }
                Err(err) => {
                    retries -= 1;
                    if retries == 0 {
                        warn!(
                            target = "reload",
                            path = %self.path.display(),
                            error = %err,
                            "config reload failed, keeping old config"
                        );
                        break;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

fn load_runtime(path: &Path) -> Result<RuntimeConfig> {
    let cfg = config::load_config(path)?;
    RuntimeConfig::from_config(cfg)
}
