//! Type definitions for the upload queue.
//!
//! Defines the tuning constants, the queue status, and the snapshot types
//! handed out to observers.

use crate::site::ErrorCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// Maximum number of transfers in flight at once
pub const MAX_CONCURRENT_UPLOADS: usize = 2;

// A file modified more recently than this is presumed still being written
pub const SAFE_UPLOAD_DELAY: Duration = Duration::from_secs(10);

// Backoff for recoverable failures: starts here, doubles per firing, capped below
pub const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Idle,
    Uploading,
    Warning,
}

/// Point-in-time classification of every tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemsStatus {
    pub succeeded: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub retry_later: usize,
}

impl ItemsStatus {
    pub fn total(&self) -> usize {
        self.succeeded + self.in_progress + self.failed + self.retry_later
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_concurrent_uploads: usize,
    pub safe_upload_delay: Duration,
    pub initial_retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: MAX_CONCURRENT_UPLOADS,
            safe_upload_delay: SAFE_UPLOAD_DELAY,
            initial_retry_interval: INITIAL_RETRY_INTERVAL,
            max_retry_interval: MAX_RETRY_INTERVAL,
        }
    }
}

/// Read-only copy of one item, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_hash: Option<String>,
    pub progress: i32,
    pub last_error: Option<ErrorCode>,
    pub last_error_message: Option<String>,
}

impl ItemSnapshot {
    pub fn is_recoverable(&self) -> bool {
        self.last_error.is_some_and(ErrorCode::is_recoverable)
    }
}
