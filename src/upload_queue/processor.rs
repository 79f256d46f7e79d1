//! The scheduler task.
//!
//! All queue state lives in one task and is only touched from its event
//! loop: commands from `UploadQueue` handles, internal completions (auth,
//! hashing, transfer events) and two one-shot timers. Nothing here blocks.

use super::hashing::calculate_file_hash;
use super::item::UploadItem;
use super::retry::RetryBackoff;
use super::types::{ItemSnapshot, ItemsStatus, QueueSettings, QueueStatus};
use crate::events::{EventBus, QueueEventPayload};
use crate::logging::{log_debug, log_info, log_warn, log_with_details};
use crate::site::{ErrorCode, Site, SiteError, TransferEvent, TransferHandle};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Sleep};

const COMPONENT: &str = "upload-queue";

pub(super) enum Command {
    RequestUpload {
        file_path: PathBuf,
        file_name: String,
    },
    Authenticate,
    ItemsStatus(oneshot::Sender<ItemsStatus>),
    Items(oneshot::Sender<Vec<ItemSnapshot>>),
    Status(oneshot::Sender<QueueStatus>),
    LastUploadError(oneshot::Sender<Option<SiteError>>),
    Shutdown,
}

enum Internal {
    AuthFinished(Result<(), SiteError>),
    HashReady {
        index: usize,
        result: Result<String, String>,
    },
    StartFailed {
        index: usize,
        error: SiteError,
    },
    Transfer {
        index: usize,
        event: TransferEvent,
    },
    TransferLost {
        index: usize,
    },
}

type Timer = Option<Pin<Box<Sleep>>>;

pub(super) struct Scheduler {
    site: Arc<dyn Site>,
    settings: QueueSettings,
    bus: EventBus,
    /// Every requested path in insertion order; the position is the item's index.
    items: IndexMap<PathBuf, UploadItem>,
    pending: VecDeque<usize>,
    active: HashSet<usize>,
    retry_set: BTreeSet<usize>,
    status: QueueStatus,
    last_upload_error: Option<SiteError>,
    backoff: RetryBackoff,
    run_timer: Timer,
    retry_timer: Timer,
    authenticating: bool,
    // Set by a failed login; scheduling stays halted until cleared.
    auth_failed: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl Scheduler {
    pub(super) fn new(
        site: Arc<dyn Site>,
        settings: QueueSettings,
        bus: EventBus,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let backoff = RetryBackoff::new(
            settings.initial_retry_interval,
            settings.max_retry_interval,
        );

        Self {
            site,
            settings,
            bus,
            items: IndexMap::new(),
            pending: VecDeque::new(),
            active: HashSet::new(),
            retry_set: BTreeSet::new(),
            status: QueueStatus::Idle,
            last_upload_error: None,
            backoff,
            run_timer: None,
            retry_timer: None,
            authenticating: false,
            auth_failed: false,
            commands,
            internal_tx,
            internal_rx,
        }
    }

    pub(super) async fn run(mut self) {
        log_info(COMPONENT, "📤 Upload queue started").unwrap_or_default();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                _ = wait_timer(&mut self.run_timer) => {
                    self.run_timer = None;
                    self.run_queue();
                }
                _ = wait_timer(&mut self.retry_timer) => {
                    self.retry_timer = None;
                    self.retry_failed();
                }
            }
        }

        log_info(COMPONENT, "📤 Upload queue stopped").unwrap_or_default();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestUpload {
                file_path,
                file_name,
            } => self.request_upload(file_path, file_name),
            Command::Authenticate => {
                self.auth_failed = false;
                self.authenticate();
            }
            Command::ItemsStatus(reply) => {
                let _ = reply.send(self.items_status());
            }
            Command::Items(reply) => {
                let _ = reply.send(self.items.values().map(UploadItem::snapshot).collect());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status);
            }
            Command::LastUploadError(reply) => {
                let _ = reply.send(self.last_upload_error.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::AuthFinished(result) => self.on_authentication_finished(result),
            Internal::HashReady { index, result } => {
                if !self.active.contains(&index) {
                    return;
                }
                match result {
                    Ok(hash) => {
                        if let Some((_, item)) = self.items.get_index_mut(index) {
                            item.set_file_hash(hash);
                        }
                        self.start_transfer(index);
                    }
                    Err(message) => {
                        self.fail_item(index, SiteError::new(ErrorCode::LocalFile, message));
                    }
                }
            }
            Internal::StartFailed { index, error } => {
                if self.active.contains(&index) {
                    self.fail_item(index, error);
                }
            }
            Internal::Transfer { index, event } => {
                if !self.active.contains(&index) {
                    return;
                }
                match event {
                    TransferEvent::Progress { sent, total } => {
                        let changed = self
                            .items
                            .get_index_mut(index)
                            .and_then(|(_, item)| item.on_upload_progress(sent, total));
                        if changed.is_some() {
                            self.publish_progress(index);
                        }
                    }
                    TransferEvent::Finished(result) => {
                        if let Some((_, item)) = self.items.get_index_mut(index) {
                            item.on_finished(result);
                        }
                        self.publish_progress(index);
                        self.on_item_finished(index);
                    }
                }
            }
            Internal::TransferLost { index } => {
                if self.active.contains(&index) {
                    self.fail_item(
                        index,
                        SiteError::new(ErrorCode::Unknown, "Transfer ended without a reply"),
                    );
                }
            }
        }
    }

    fn request_upload(&mut self, file_path: PathBuf, file_name: String) {
        if let Some(index) = self.items.get_index_of(&file_path) {
            self.request_again(index);
            return;
        }

        let item = UploadItem::new(file_path.clone(), file_name.clone());
        let (index, _) = self.items.insert_full(file_path.clone(), item);
        self.pending.push_back(index);

        log_debug(COMPONENT, &format!("Queued {} as #{}", file_name, index)).unwrap_or_default();
        self.bus.publish(QueueEventPayload::ItemAdded {
            index,
            file_path,
            file_name,
        });

        // A new request is the user's cue to try logging in again.
        self.auth_failed = false;
        self.authenticate();
    }

    /// An already tracked path was requested again. Settled items start over
    /// only when the file changed since their last attempt.
    fn request_again(&mut self, index: usize) {
        if self.active.contains(&index)
            || self.retry_set.contains(&index)
            || self.pending.contains(&index)
        {
            return;
        }

        let Some((_, item)) = self.items.get_index_mut(index) else {
            return;
        };

        let changed = std::fs::metadata(item.file_path())
            .and_then(|metadata| metadata.modified())
            .map(|modified| item.modified_since_dispatch(modified))
            .unwrap_or(false);

        if !changed {
            return;
        }

        log_info(COMPONENT, &format!("Re-queueing {}", item.file_name())).unwrap_or_default();

        if item.reset().is_some() {
            self.publish_progress(index);
        }
        self.pending.push_back(index);
        self.auth_failed = false;
        self.authenticate();
    }

    fn authenticate(&mut self) {
        if self.site.is_authenticated() {
            self.run_queue();
            return;
        }

        if self.authenticating || self.auth_failed {
            return;
        }

        self.authenticating = true;
        log_debug(COMPONENT, "Authenticating").unwrap_or_default();

        let site = Arc::clone(&self.site);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = site.authenticate().await;
            let _ = tx.send(Internal::AuthFinished(result));
        });
    }

    fn on_authentication_finished(&mut self, result: Result<(), SiteError>) {
        self.authenticating = false;

        let result = result.and_then(|_| {
            if self.site.is_authenticated() {
                Ok(())
            } else {
                Err(self.site.last_error().unwrap_or_else(|| {
                    SiteError::new(ErrorCode::Authentication, "Not authenticated")
                }))
            }
        });

        match result {
            Ok(()) => {
                log_debug(COMPONENT, "Authenticated; running queue").unwrap_or_default();
                self.run_queue();
            }
            Err(error) => {
                log_warn(COMPONENT, &format!("Authentication failed: {}", error))
                    .unwrap_or_default();
                self.auth_failed = true;
                self.last_upload_error = Some(error);
                self.set_status(QueueStatus::Warning);
            }
        }
    }

    /// Start as many pending uploads as the concurrency cap allows.
    ///
    /// Every item pending when the pass begins is examined at most once;
    /// files modified too recently go to the back of the queue.
    fn run_queue(&mut self) {
        let max_uploads = self.settings.max_concurrent_uploads.max(1);
        if self.pending.is_empty() || self.active.len() >= max_uploads {
            return;
        }

        if !self.site.is_authenticated() {
            self.authenticate();
            return;
        }

        let mut to_check = self.pending.len();
        while to_check > 0 && self.active.len() < max_uploads {
            let Some(index) = self.pending.pop_front() else {
                break;
            };
            to_check -= 1;

            let modified = self
                .items
                .get_index(index)
                .and_then(|(path, _)| std::fs::metadata(path).and_then(|m| m.modified()).ok());

            if self.is_too_fresh(modified) {
                self.pending.push_back(index);
                continue;
            }

            self.dispatch(index, modified);
        }

        if !self.pending.is_empty()
            && self.active.len() < max_uploads
            && self.run_timer.is_none()
        {
            log_debug(
                COMPONENT,
                &format!(
                    "{} file(s) still being written; checking again in {:?}",
                    self.pending.len(),
                    self.settings.safe_upload_delay
                ),
            )
            .unwrap_or_default();
            self.run_timer = Some(Box::pin(sleep(self.settings.safe_upload_delay)));
        }
    }

    fn is_too_fresh(&self, modified: Option<SystemTime>) -> bool {
        let delay = self.settings.safe_upload_delay;
        if delay.is_zero() {
            return false;
        }

        // Unreadable files are dispatched and fail while hashing.
        let Some(modified) = modified else {
            return false;
        };

        match SystemTime::now().duration_since(modified) {
            Ok(age) => age < delay,
            // Modified in the future: treat as still being written.
            Err(_) => true,
        }
    }

    fn dispatch(&mut self, index: usize, modified: Option<SystemTime>) {
        let Some((path, item)) = self.items.get_index_mut(index) else {
            return;
        };

        self.active.insert(index);
        let changed = item.prepare_dispatch(modified).is_some();
        let needs_hash = item.file_hash().is_none();
        let path = path.clone();

        log_info(COMPONENT, &format!("⬆️  Uploading {}", item.file_name())).unwrap_or_default();

        if changed {
            self.publish_progress(index);
        }
        if self.status == QueueStatus::Idle {
            self.set_status(QueueStatus::Uploading);
        }

        if needs_hash {
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || calculate_file_hash(&path))
                    .await
                    .unwrap_or_else(|e| Err(format!("Hash task failed: {}", e)));
                let _ = tx.send(Internal::HashReady { index, result });
            });
        } else {
            self.start_transfer(index);
        }
    }

    fn start_transfer(&mut self, index: usize) {
        let Some((_, item)) = self.items.get_index(index) else {
            return;
        };

        match item.start_upload(self.site.as_ref()) {
            Ok(handle) => self.forward_transfer(index, handle),
            Err(error) => {
                // Reported through the loop so completion never re-enters run_queue.
                let _ = self.internal_tx.send(Internal::StartFailed { index, error });
            }
        }
    }

    fn forward_transfer(&self, index: usize, mut handle: TransferHandle) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = handle.next_event().await {
                let finished = matches!(event, TransferEvent::Finished(_));
                if tx.send(Internal::Transfer { index, event }).is_err() || finished {
                    return;
                }
            }
            let _ = tx.send(Internal::TransferLost { index });
        });
    }

    fn fail_item(&mut self, index: usize, error: SiteError) {
        if let Some((_, item)) = self.items.get_index_mut(index) {
            item.fail(error);
        }
        self.publish_progress(index);
        self.on_item_finished(index);
    }

    fn on_item_finished(&mut self, index: usize) {
        self.active.remove(&index);

        let Some((path, item)) = self.items.get_index(index) else {
            return;
        };

        if item.is_succeeded() {
            log_info(COMPONENT, &format!("✓ Uploaded {}", item.file_name())).unwrap_or_default();
            self.retry_set.remove(&index);
            if self.retry_set.is_empty() {
                self.backoff.reset();
            }
        } else {
            let recoverable = item.is_recoverable();
            let error = item.error().unwrap_or_else(|| {
                SiteError::new(ErrorCode::Unknown, "Upload failed")
            });

            log_with_details(
                COMPONENT,
                "WARN",
                &format!("Upload of {} failed: {}", item.file_name(), error),
                serde_json::json!({
                    "file_path": path,
                    "error_code": error.code,
                    "recoverable": recoverable,
                }),
            )
            .unwrap_or_default();

            self.last_upload_error = Some(error);
            if recoverable {
                self.retry_set.insert(index);
                if self.retry_timer.is_none() {
                    self.retry_timer = Some(Box::pin(sleep(self.backoff.current())));
                }
            }
            self.set_status(QueueStatus::Warning);
        }

        if self.active.is_empty() {
            let any_failed = self.items.values().any(UploadItem::is_failed);
            self.set_status(if any_failed {
                QueueStatus::Warning
            } else {
                QueueStatus::Idle
            });
        }

        self.run_queue();
    }

    /// Backoff timer fired: everything waiting goes back to pending.
    fn retry_failed(&mut self) {
        let retrying = std::mem::take(&mut self.retry_set);
        if !retrying.is_empty() {
            log_info(
                COMPONENT,
                &format!(
                    "🔄 Retrying {} failed upload(s) after {:?}",
                    retrying.len(),
                    self.backoff.current()
                ),
            )
            .unwrap_or_default();
        }

        self.pending.extend(retrying);
        self.backoff.advance();
        self.run_queue();
    }

    fn items_status(&self) -> ItemsStatus {
        let pending: HashSet<usize> = self.pending.iter().copied().collect();
        let mut status = ItemsStatus::default();

        for (index, item) in self.items.values().enumerate() {
            if self.retry_set.contains(&index) {
                status.retry_later += 1;
            } else if item.is_succeeded() {
                status.succeeded += 1;
            } else if item.is_failed() && !self.active.contains(&index) && !pending.contains(&index)
            {
                status.failed += 1;
            } else {
                status.in_progress += 1;
            }
        }

        status
    }

    fn publish_progress(&self, index: usize) {
        if let Some((path, item)) = self.items.get_index(index) {
            self.bus.publish(QueueEventPayload::ItemProgress {
                index,
                file_path: path.clone(),
                file_name: item.file_name().to_string(),
                progress: item.progress(),
            });
        }
    }

    fn set_status(&mut self, status: QueueStatus) {
        if self.status == status {
            return;
        }
        log_debug(COMPONENT, &format!("Status {:?} -> {:?}", self.status, status))
            .unwrap_or_default();
        self.status = status;
        self.bus.publish(QueueEventPayload::StatusChanged { status });
    }
}

async fn wait_timer(timer: &mut Timer) {
    match timer {
        Some(delay) => delay.as_mut().await,
        None => std::future::pending().await,
    }
}
