//! One file's upload attempt.
//!
//! Translates raw transfer callbacks into the three-valued progress
//! contract: 0 not started, 1..=99 in flight, 100 confirmed, -1 failed.

use super::types::ItemSnapshot;
use crate::site::{ErrorCode, MetadataPart, Site, SiteError, TransferHandle};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const PROGRESS_DONE: i32 = 100;
pub const PROGRESS_FAILED: i32 = -1;

#[derive(Debug, Clone)]
pub struct UploadItem {
    file_path: PathBuf,
    file_name: String,
    file_hash: Option<String>,
    progress: i32,
    last_error: Option<ErrorCode>,
    last_error_message: Option<String>,
    // mtime observed when the current attempt was dispatched
    dispatched_mtime: Option<SystemTime>,
}

impl UploadItem {
    pub fn new(file_path: PathBuf, file_name: String) -> Self {
        Self {
            file_path,
            file_name,
            file_hash: None,
            progress: 0,
            last_error: None,
            last_error_message: None,
            dispatched_mtime: None,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_hash(&self) -> Option<&str> {
        self.file_hash.as_deref()
    }

    pub fn progress(&self) -> i32 {
        self.progress
    }

    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    pub fn is_succeeded(&self) -> bool {
        self.progress == PROGRESS_DONE
    }

    pub fn is_failed(&self) -> bool {
        self.progress == PROGRESS_FAILED
    }

    pub fn is_recoverable(&self) -> bool {
        self.is_failed() && self.last_error.is_some_and(ErrorCode::is_recoverable)
    }

    /// The failure as a site error, for the queue's `last_upload_error`.
    pub fn error(&self) -> Option<SiteError> {
        self.last_error.map(|code| {
            SiteError::new(code, self.last_error_message.clone().unwrap_or_default())
        })
    }

    /// True when the file on disk is newer than the copy last dispatched.
    pub fn modified_since_dispatch(&self, modified: SystemTime) -> bool {
        match self.dispatched_mtime {
            Some(dispatched) => modified > dispatched,
            None => true,
        }
    }

    pub fn set_file_hash(&mut self, hash: String) {
        self.file_hash = Some(hash);
    }

    /// Begin a new attempt. Returns the new progress if it changed.
    pub fn prepare_dispatch(&mut self, modified: Option<SystemTime>) -> Option<i32> {
        self.dispatched_mtime = modified;
        self.last_error = None;
        self.last_error_message = None;
        self.set_progress(0)
    }

    /// Forget everything learned about the previous content of the file.
    pub fn reset(&mut self) -> Option<i32> {
        self.file_hash = None;
        self.dispatched_mtime = None;
        self.last_error = None;
        self.last_error_message = None;
        self.set_progress(0)
    }

    pub fn metadata_parts(&self) -> Vec<MetadataPart> {
        let mut parts = Vec::with_capacity(2);
        if let Some(hash) = &self.file_hash {
            parts.push(MetadataPart::new("file_hash", hash.as_str()));
        }
        parts.push(MetadataPart::new("original_path", self.file_name.as_str()));
        parts
    }

    pub fn start_upload(&self, site: &dyn Site) -> Result<TransferHandle, SiteError> {
        site.upload_file(&self.file_path, self.metadata_parts())
    }

    /// Bytes-sent ratio, held at 99 until the server confirms.
    pub fn on_upload_progress(&mut self, sent: u64, total: u64) -> Option<i32> {
        let percent = if total > 0 {
            (sent.saturating_mul(100) / total).min(99) as i32
        } else {
            0
        };
        self.set_progress(percent)
    }

    pub fn on_finished(&mut self, result: Result<u16, SiteError>) -> Option<i32> {
        match result {
            Ok(status) => match ErrorCode::from_http_status(status) {
                None => self.set_progress(PROGRESS_DONE),
                Some(code) => self.fail(SiteError::new(
                    code,
                    format!("Server replied with HTTP {}", status),
                )),
            },
            Err(error) => self.fail(error),
        }
    }

    pub fn fail(&mut self, error: SiteError) -> Option<i32> {
        self.last_error = Some(error.code);
        self.last_error_message = Some(error.message);
        self.set_progress(PROGRESS_FAILED)
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            file_path: self.file_path.clone(),
            file_name: self.file_name.clone(),
            file_hash: self.file_hash.clone(),
            progress: self.progress,
            last_error: self.last_error,
            last_error_message: self.last_error_message.clone(),
        }
    }

    fn set_progress(&mut self, progress: i32) -> Option<i32> {
        if self.progress == progress {
            return None;
        }
        self.progress = progress;
        Some(progress)
    }
}
