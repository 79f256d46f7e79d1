//! Recursive directory monitor with coalesced change notifications.
//!
//! Every directory under the base path gets its own non-recursive watch, so
//! new subdirectories are picked up explicitly when their parent changes.
//! The list of changed files always comes from a fresh scan, never from the
//! watch events themselves.

mod debounce;

pub use debounce::{Debouncer, SignalDecision};

use crate::logging::{log_debug, log_info, log_warn};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, Sleep};
use walkdir::WalkDir;

const COMPONENT: &str = "file-monitor";

/// Minimum time between two `changed` notifications
pub const MIN_SIGNAL_INTERVAL: Duration = Duration::from_secs(5);

pub struct FileMonitor {
    base_path: Option<PathBuf>,
    watcher: Option<RecommendedWatcher>,
    watched_directories: HashSet<PathBuf>,
    events: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
    debouncer: Debouncer,
    signal_timer: Option<Pin<Box<Sleep>>>,
}

impl std::fmt::Debug for FileMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMonitor")
            .field("base_path", &self.base_path)
            .field("watched_directories", &self.watched_directories.len())
            .field("signal_pending", &self.signal_timer.is_some())
            .finish()
    }
}

impl Default for FileMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMonitor {
    pub fn new() -> Self {
        Self::with_min_signal_interval(MIN_SIGNAL_INTERVAL)
    }

    pub fn with_min_signal_interval(min_interval: Duration) -> Self {
        Self {
            base_path: None,
            watcher: None,
            watched_directories: HashSet::new(),
            events: None,
            debouncer: Debouncer::new(min_interval),
            signal_timer: None,
        }
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    pub fn watched_directories(&self) -> &HashSet<PathBuf> {
        &self.watched_directories
    }

    /// Watch a new tree. The previous watch is torn down first.
    ///
    /// A missing or unwatchable base path leaves the monitor idle; it then
    /// reports no changes.
    pub fn set_base_path(&mut self, path: &Path) {
        self.watcher = None;
        self.events = None;
        self.watched_directories.clear();
        self.signal_timer = None;
        self.debouncer.cancel();
        self.base_path = Some(path.to_path_buf());

        if !path.is_dir() {
            log_warn(
                COMPONENT,
                &format!("Upload path {} is not a directory", path.display()),
            )
            .unwrap_or_default();
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            },
            notify::Config::default(),
        );

        match watcher {
            Ok(watcher) => {
                self.watcher = Some(watcher);
                self.events = Some(rx);
            }
            Err(e) => {
                log_warn(COMPONENT, &format!("Failed to create watcher: {}", e))
                    .unwrap_or_default();
                return;
            }
        }

        self.watch_tree(path);
        log_info(
            COMPONENT,
            &format!(
                "👀 Watching {} ({} directories)",
                path.display(),
                self.watched_directories.len()
            ),
        )
        .unwrap_or_default();
    }

    /// Every regular file under the base path modified strictly after `since`.
    /// `None` returns all files. Order is unspecified.
    pub fn files_changed_since(&self, since: Option<SystemTime>) -> Vec<PathBuf> {
        match self.base_path.as_deref() {
            Some(base_path) => changed_files_since(base_path, since),
            None => Vec::new(),
        }
    }

    /// Resolve at the next coalesced change notification.
    ///
    /// Cancel safe: state survives being dropped inside `select!`.
    pub async fn changed(&mut self) {
        loop {
            tokio::select! {
                event = next_event(&mut self.events) => match event {
                    Some(Ok(event)) => {
                        if self.on_event(event) {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        log_warn(COMPONENT, &format!("Watch error: {}", e)).unwrap_or_default();
                    }
                    None => self.events = None,
                },
                _ = wait_timer(&mut self.signal_timer) => {
                    self.signal_timer = None;
                    self.debouncer.on_timer(Instant::now());
                    return;
                }
            }
        }
    }

    /// Returns true when the notification should go out now.
    fn on_event(&mut self, event: Event) -> bool {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }

        // Content writes arrive once per chunk; only entry changes can add or drop directories.
        if changes_entries(&event.kind) {
            self.watched_directories.retain(|directory| directory.is_dir());
            for path in &event.paths {
                let directory = if path.is_dir() {
                    Some(path.as_path())
                } else {
                    path.parent()
                };
                if let Some(directory) = directory {
                    self.watch_tree(directory);
                }
            }
        }

        match self.debouncer.on_event(Instant::now()) {
            SignalDecision::EmitNow => true,
            SignalDecision::Arm(delay) => {
                self.signal_timer = Some(Box::pin(sleep(delay)));
                false
            }
            SignalDecision::AlreadyArmed => false,
        }
    }

    /// Register `root` and every directory below it that isn't watched yet.
    fn watch_tree(&mut self, root: &Path) {
        let Some(base_path) = self.base_path.as_deref() else {
            return;
        };
        if !root.starts_with(base_path) || !root.is_dir() {
            return;
        }
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };

        let directories = WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.into_path());

        for directory in directories {
            if self.watched_directories.contains(&directory) {
                continue;
            }

            match watcher.watch(&directory, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    log_debug(COMPONENT, &format!("watching {}", directory.display()))
                        .unwrap_or_default();
                    self.watched_directories.insert(directory);
                }
                Err(e) => {
                    log_debug(
                        COMPONENT,
                        &format!("Cannot watch {}: {}", directory.display(), e),
                    )
                    .unwrap_or_default();
                }
            }
        }
    }
}

/// Every regular file under `base_path` modified strictly after `since`.
///
/// Blocking; async callers should run it on the blocking pool.
pub fn changed_files_since(base_path: &Path, since: Option<SystemTime>) -> Vec<PathBuf> {
    if !base_path.is_dir() {
        return Vec::new();
    }

    WalkDir::new(base_path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| match since {
            None => true,
            Some(since) => entry
                .metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .is_some_and(|modified| modified > since),
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn changes_entries(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
) -> Option<notify::Result<Event>> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(delay) => delay.as_mut().await,
        None => std::future::pending().await,
    }
}
