use crate::upload_queue::QueueStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sequence number for ordering events
pub type EventSequence = u64;

/// Observable change in the upload queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub sequence: EventSequence,
    pub timestamp: DateTime<Utc>,
    pub payload: QueueEventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEventPayload {
    /// A path was tracked for the first time; `index` is its position in the item list.
    ItemAdded {
        index: usize,
        file_path: PathBuf,
        file_name: String,
    },

    /// An item's progress moved. 100 is confirmed, -1 failed.
    ItemProgress {
        index: usize,
        file_path: PathBuf,
        file_name: String,
        progress: i32,
    },

    StatusChanged { status: QueueStatus },
}

impl QueueEvent {
    pub fn payload_type(&self) -> &str {
        match &self.payload {
            QueueEventPayload::ItemAdded { .. } => "item_added",
            QueueEventPayload::ItemProgress { .. } => "item_progress",
            QueueEventPayload::StatusChanged { .. } => "status_changed",
        }
    }

    /// Path of a successfully confirmed upload, if this event reports one.
    pub fn completed_path(&self) -> Option<&PathBuf> {
        match &self.payload {
            QueueEventPayload::ItemProgress {
                file_path,
                progress: 100,
                ..
            } => Some(file_path),
            _ => None,
        }
    }
}
