use thiserror::Error;

/// ABC Uploader errors
#[derive(Debug, Error)]
pub enum UploaderError {
    /// Upload log database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upload/transfer errors
    #[error("Upload error: {0}")]
    Upload(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, UploaderError>;

impl From<UploaderError> for String {
    fn from(err: UploaderError) -> String {
        err.to_string()
    }
}

impl From<Box<dyn std::error::Error>> for UploaderError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        UploaderError::Other(err.to_string())
    }
}

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E: Into<UploaderError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| match e.into() {
            UploaderError::Config(s) => UploaderError::Config(format!("{}: {}", msg, s)),
            UploaderError::Upload(s) => UploaderError::Upload(format!("{}: {}", msg, s)),
            UploaderError::Other(s) => UploaderError::Other(format!("{}: {}", msg, s)),
            // I/O keeps its kind; other wrapped errors become text.
            UploaderError::Io(e) => {
                UploaderError::Io(std::io::Error::new(e.kind(), format!("{}: {}", msg, e)))
            }
            other => UploaderError::Other(format!("{}: {}", msg, other)),
        })
    }
}
