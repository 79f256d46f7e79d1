//! The remote upload endpoint as seen by the scheduler.
//!
//! The scheduler only talks to `dyn Site`; `HttpSite` is the production
//! implementation and tests provide scripted ones.

mod http;

pub use http::HttpSite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure classification reported by the site or the local file layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Unknown,
    Network,
    Ssl,
    Authentication,
    QuotaExceeded,
    WrongFileType,
    /// The local file could not be read or hashed.
    LocalFile,
}

impl ErrorCode {
    /// Transport-level failures are transient; policy failures need the user.
    pub fn is_recoverable(self) -> bool {
        match self {
            ErrorCode::Unknown
            | ErrorCode::Network
            | ErrorCode::Ssl
            | ErrorCode::Authentication => true,
            ErrorCode::QuotaExceeded | ErrorCode::WrongFileType | ErrorCode::LocalFile => false,
        }
    }

    /// Map a non-success HTTP status to an error code. `None` for 2xx.
    pub fn from_http_status(status: u16) -> Option<ErrorCode> {
        match status {
            200..=299 => None,
            401 | 403 => Some(ErrorCode::Authentication),
            402 | 413 => Some(ErrorCode::QuotaExceeded),
            415 => Some(ErrorCode::WrongFileType),
            _ => Some(ErrorCode::Unknown),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown error",
            ErrorCode::Network => "network error",
            ErrorCode::Ssl => "SSL error",
            ErrorCode::Authentication => "authentication error",
            ErrorCode::QuotaExceeded => "quota exceeded",
            ErrorCode::WrongFileType => "unsupported file type",
            ErrorCode::LocalFile => "file not readable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct SiteError {
    pub code: ErrorCode,
    pub message: String,
}

impl SiteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Extra form field sent along with the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPart {
    pub name: String,
    pub value: String,
}

impl MetadataPart {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { sent: u64, total: u64 },
    /// Final HTTP status, or the transport failure.
    Finished(Result<u16, SiteError>),
}

/// Receive side of one in-flight transfer.
#[derive(Debug)]
pub struct TransferHandle {
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl TransferHandle {
    pub fn channel() -> (TransferReporter, TransferHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransferReporter { tx }, TransferHandle { events: rx })
    }

    /// Next event, `None` once the reporter is gone.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }
}

/// Send side of a transfer, held by the `Site` implementation.
#[derive(Debug, Clone)]
pub struct TransferReporter {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferReporter {
    pub fn progress(&self, sent: u64, total: u64) {
        let _ = self.tx.send(TransferEvent::Progress { sent, total });
    }

    pub fn finish(self, result: Result<u16, SiteError>) {
        let _ = self.tx.send(TransferEvent::Finished(result));
    }
}

#[async_trait]
pub trait Site: Send + Sync {
    /// Obtain a session. Resolves once the attempt is over.
    async fn authenticate(&self) -> Result<(), SiteError>;

    fn is_authenticated(&self) -> bool;

    /// Replace the credentials used by the next `authenticate`.
    fn set_login_data(&self, user_name: &str, password: &str);

    /// Start uploading `file_path`; completion arrives on the handle.
    fn upload_file(
        &self,
        file_path: &Path,
        parts: Vec<MetadataPart>,
    ) -> Result<TransferHandle, SiteError>;

    fn last_error(&self) -> Option<SiteError>;
}
