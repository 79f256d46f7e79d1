//! Wires the monitor, the upload log and the queue together.
//!
//! Directory notifications trigger a scan; files not yet in the log are
//! queued; every confirmed upload is written back to the log. Log lookups
//! hash whole files, so they run on the blocking pool.

use crate::autostart::set_auto_start;
use crate::config::{load_config_from, UploaderConfig};
use crate::events::{EventReceiver, QueueEvent};
use crate::file_log::{path_key, FileLog};
use crate::file_monitor::{changed_files_since, FileMonitor, MIN_SIGNAL_INTERVAL};
use crate::logging::{log_debug, log_info, log_warn};
use crate::site::Site;
use crate::upload_queue::UploadQueue;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "agent";

pub type SharedFileLog = Arc<Mutex<FileLog>>;

struct ConfigReload {
    path: PathBuf,
    changes: mpsc::UnboundedReceiver<()>,
}

pub struct Agent {
    config: UploaderConfig,
    monitor: FileMonitor,
    file_log: SharedFileLog,
    queue: UploadQueue,
    events: EventReceiver,
    site: Arc<dyn Site>,
    reload: Option<ConfigReload>,
    // Files modified after this are candidates on the next scan; None means all.
    last_update: Option<SystemTime>,
}

impl Agent {
    pub fn new(
        config: UploaderConfig,
        mut file_log: FileLog,
        site: Arc<dyn Site>,
        queue: UploadQueue,
    ) -> Self {
        let mut monitor = FileMonitor::with_min_signal_interval(
            config.min_signal_interval().unwrap_or(MIN_SIGNAL_INTERVAL),
        );

        if let Some(upload_path) = config.upload_path() {
            log_info(
                COMPONENT,
                &format!("Upload path: {}", upload_path.display()),
            )
            .unwrap_or_default();
            monitor.set_base_path(&upload_path);
            file_log.set_base_path(&upload_path);
        } else {
            log_warn(COMPONENT, "No upload path configured").unwrap_or_default();
        }

        let events = queue.subscribe();
        let agent = Self {
            config,
            monitor,
            file_log: Arc::new(Mutex::new(file_log)),
            queue,
            events,
            site,
            reload: None,
            last_update: None,
        };

        agent.apply_login_data();
        agent
    }

    /// Reload the configuration from `path` whenever `changes` fires.
    pub fn with_config_reload(
        mut self,
        path: PathBuf,
        changes: mpsc::UnboundedReceiver<()>,
    ) -> Self {
        self.reload = Some(ConfigReload { path, changes });
        self
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Lock the upload log. Blocks while a lookup or a write is running.
    pub fn file_log(&self) -> MutexGuard<'_, FileLog> {
        lock_log(&self.file_log)
    }

    pub fn shared_file_log(&self) -> SharedFileLog {
        Arc::clone(&self.file_log)
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.last_update
    }

    /// Run until `cancel` fires, then stop the queue.
    pub async fn run(&mut self, cancel: CancellationToken) {
        log_info(COMPONENT, "🚀 Agent started").unwrap_or_default();

        // Catch up on whatever changed before the first scan.
        if self.last_update.is_none() {
            self.scan_for_changes().await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.monitor.changed() => {
                    self.scan_for_changes().await;
                }
                event = self.events.recv() => match event {
                    Ok(event) => self.on_queue_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        log_warn(
                            COMPONENT,
                            &format!("Missed {} queue events; resynchronising", missed),
                        )
                        .unwrap_or_default();
                        self.resync_completed().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(()) = next_reload(&mut self.reload) => self.reload_config().await,
            }
        }

        self.queue.shutdown();
        log_info(COMPONENT, "Agent stopped").unwrap_or_default();
    }

    /// Queue every file changed since the last scan that isn't in the log yet.
    /// Returns how many uploads were requested.
    pub async fn scan_for_changes(&mut self) -> usize {
        let Some(base_path) = self.monitor.base_path().map(Path::to_path_buf) else {
            return 0;
        };

        let scan_started = SystemTime::now();
        let since = self.last_update;
        let log = self.shared_file_log();
        let walk_root = base_path.clone();
        let scan = tokio::task::spawn_blocking(move || {
            let candidates = changed_files_since(&walk_root, since);
            lock_log(&log).filter_out_logged(candidates)
        });

        let to_upload = match scan.await {
            Ok(paths) => paths,
            Err(e) => {
                log_warn(COMPONENT, &format!("Scan failed: {}", e)).unwrap_or_default();
                return 0;
            }
        };
        if to_upload.is_empty() {
            return 0;
        }

        let mut queued = 0;
        for path in to_upload {
            let file_name = path
                .strip_prefix(&base_path)
                .map(path_key)
                .unwrap_or_else(|_| path_key(&path));

            log_debug(COMPONENT, &format!("File: {}", path.display())).unwrap_or_default();
            match self.queue.request_upload(path, file_name) {
                Ok(()) => queued += 1,
                Err(e) => {
                    log_warn(COMPONENT, &format!("Failed to queue upload: {}", e))
                        .unwrap_or_default();
                }
            }
        }

        self.last_update = Some(scan_started);
        log_info(COMPONENT, &format!("Queued {} file(s) for upload", queued)).unwrap_or_default();
        queued
    }

    /// Adopt a new configuration, reacting to path, credential and auto start changes.
    pub async fn apply_config(&mut self, config: UploaderConfig) {
        let path_changed = config.upload_path() != self.config.upload_path();
        let login_changed =
            config.user_name != self.config.user_name || config.password != self.config.password;
        let auto_start_changed = config.auto_start() != self.config.auto_start();
        self.config = config;

        if auto_start_changed {
            set_auto_start(self.config.auto_start());
        }

        if login_changed {
            log_info(COMPONENT, "Login data changed; authenticating again").unwrap_or_default();
            self.apply_login_data();
            if let Err(e) = self.queue.authenticate() {
                log_warn(COMPONENT, &format!("Cannot authenticate: {}", e)).unwrap_or_default();
            }
        }

        if path_changed {
            if let Some(upload_path) = self.config.upload_path() {
                self.point_at(upload_path).await;
            }

            // A new tree: every file in it has to be checked against the log.
            self.last_update = None;
            self.scan_for_changes().await;
        }
    }

    async fn point_at(&mut self, upload_path: PathBuf) {
        log_info(
            COMPONENT,
            &format!("Upload path: {}", upload_path.display()),
        )
        .unwrap_or_default();
        self.monitor.set_base_path(&upload_path);

        let log = self.shared_file_log();
        let update = tokio::task::spawn_blocking(move || {
            lock_log(&log).set_base_path(&upload_path);
        });
        if let Err(e) = update.await {
            log_warn(COMPONENT, &format!("Cannot re-point upload log: {}", e)).unwrap_or_default();
        }
    }

    fn apply_login_data(&self) {
        self.site.set_login_data(
            self.config.user_name.as_deref().unwrap_or_default(),
            self.config.password.as_deref().unwrap_or_default(),
        );
    }

    async fn reload_config(&mut self) {
        let Some(reload) = &self.reload else {
            return;
        };

        let loaded = load_config_from(&reload.path).map_err(|e| e.to_string());
        match loaded {
            Ok(config) => {
                if config != self.config {
                    log_info(COMPONENT, "Configuration reloaded").unwrap_or_default();
                    self.apply_config(config).await;
                }
            }
            Err(e) => {
                log_warn(COMPONENT, &format!("Ignoring unreadable configuration: {}", e))
                    .unwrap_or_default();
            }
        }
    }

    fn on_queue_event(&mut self, event: &QueueEvent) {
        let Some(path) = event.completed_path() else {
            return;
        };

        log_debug(COMPONENT, &format!("Upload completed: {}", path.display())).unwrap_or_default();
        self.record_uploads(vec![path.clone()]);
    }

    /// Log confirmed uploads in the background; the event loop doesn't wait.
    fn record_uploads(&self, paths: Vec<PathBuf>) {
        let log = self.shared_file_log();
        tokio::task::spawn_blocking(move || {
            let log = lock_log(&log);
            for path in paths {
                if log.is_logged(&path) {
                    continue;
                }
                if let Err(e) = log.add_file(&path) {
                    log_warn(
                        COMPONENT,
                        &format!("Failed to log upload of {}: {}", path.display(), e),
                    )
                    .unwrap_or_default();
                }
            }
        });
    }

    /// Record every confirmed upload the log doesn't know about yet.
    async fn resync_completed(&mut self) {
        let items = match self.queue.items().await {
            Ok(items) => items,
            Err(e) => {
                log_warn(COMPONENT, &format!("Cannot list uploads: {}", e)).unwrap_or_default();
                return;
            }
        };

        let completed = items
            .into_iter()
            .filter(|item| item.progress == 100)
            .map(|item| item.file_path)
            .collect();
        self.record_uploads(completed);
    }
}

fn lock_log(log: &Mutex<FileLog>) -> MutexGuard<'_, FileLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn next_reload(reload: &mut Option<ConfigReload>) -> Option<()> {
    match reload {
        Some(reload) => reload.changes.recv().await,
        None => std::future::pending().await,
    }
}
