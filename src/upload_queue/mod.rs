// Module declarations
mod hashing;
mod item;
mod processor;
mod retry;
mod types;

// Re-export types and constants from submodules
pub use hashing::{calculate_content_hash, calculate_file_hash};
pub use item::{UploadItem, PROGRESS_DONE, PROGRESS_FAILED};
pub use retry::RetryBackoff;
pub use types::*;

use crate::error::{Result, UploaderError};
use crate::events::{EventBus, EventReceiver};
use crate::site::{Site, SiteError};
use processor::{Command, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Handle to the upload scheduler.
///
/// Cheap to clone; every clone talks to the same scheduler task. Requests
/// are processed in the order they are sent.
#[derive(Clone, Debug)]
pub struct UploadQueue {
    commands: mpsc::UnboundedSender<Command>,
    bus: EventBus,
}

impl UploadQueue {
    /// Spawn the scheduler on the current runtime.
    pub fn start(site: Arc<dyn Site>, settings: QueueSettings, bus: EventBus) -> Self {
        Self::spawn(site, settings, bus).0
    }

    /// Like `start`, also returning the scheduler task so callers can await shutdown.
    pub fn spawn(
        site: Arc<dyn Site>,
        settings: QueueSettings,
        bus: EventBus,
    ) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(site, settings, bus.clone(), receiver);
        let task = tokio::spawn(scheduler.run());

        (Self { commands, bus }, task)
    }

    /// Track `file_path` and upload it once it is safe to do so.
    ///
    /// `file_name` is the logical name sent to the server. Requesting a path
    /// that is already queued, uploading or waiting for a retry does nothing.
    pub fn request_upload(
        &self,
        file_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Result<()> {
        self.send(Command::RequestUpload {
            file_path: file_path.into(),
            file_name: file_name.into(),
        })
    }

    /// Log in again, lifting a halt caused by an earlier failed login.
    pub fn authenticate(&self) -> Result<()> {
        self.send(Command::Authenticate)
    }

    pub async fn items_status(&self) -> Result<ItemsStatus> {
        self.query(Command::ItemsStatus).await
    }

    /// Snapshot of every tracked item, in the order they were first requested.
    pub async fn items(&self) -> Result<Vec<ItemSnapshot>> {
        self.query(Command::Items).await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.query(Command::Status).await
    }

    pub async fn last_upload_error(&self) -> Result<Option<SiteError>> {
        self.query(Command::LastUploadError).await
    }

    pub async fn completed_uploads(&self) -> Result<usize> {
        Ok(self.items_status().await?.succeeded)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    /// Stop the scheduler. In-flight transfers are abandoned.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| UploaderError::Upload("Upload queue is not running".to_string()))
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await
            .map_err(|_| UploaderError::Upload("Upload queue stopped before replying".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{ErrorCode, MetadataPart, TransferHandle};
    use async_trait::async_trait;
    use std::path::Path;

    struct OfflineSite;

    #[async_trait]
    impl Site for OfflineSite {
        async fn authenticate(&self) -> std::result::Result<(), SiteError> {
            Err(SiteError::new(ErrorCode::Network, "offline"))
        }

        fn is_authenticated(&self) -> bool {
            false
        }

        fn set_login_data(&self, _user_name: &str, _password: &str) {}

        fn upload_file(
            &self,
            _file_path: &Path,
            _parts: Vec<MetadataPart>,
        ) -> std::result::Result<TransferHandle, SiteError> {
            Err(SiteError::new(ErrorCode::Network, "offline"))
        }

        fn last_error(&self) -> Option<SiteError> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_halts_and_warns() {
        let queue = UploadQueue::start(
            Arc::new(OfflineSite),
            QueueSettings::default(),
            EventBus::new(16),
        );

        queue.request_upload("/data/raw/a.fits", "a.fits").unwrap();
        queue.request_upload("/data/raw/a.fits", "a.fits").unwrap();

        // Let the login attempt come back.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let items = queue.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].progress, 0);
        assert_eq!(queue.status().await.unwrap(), QueueStatus::Warning);
        assert_eq!(
            queue.last_upload_error().await.unwrap().map(|e| e.code),
            Some(ErrorCode::Network)
        );

        let status = queue.items_status().await.unwrap();
        assert_eq!(status.in_progress, 1);
        assert_eq!(status.total(), 1);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_scheduler() {
        let (queue, task) = UploadQueue::spawn(
            Arc::new(OfflineSite),
            QueueSettings::default(),
            EventBus::new(16),
        );

        queue.shutdown();
        task.await.unwrap();

        assert!(queue.request_upload("/data/raw/a.fits", "a.fits").is_err());
        assert!(queue.items_status().await.is_err());
    }
}
