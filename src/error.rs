use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the engine's fallible operations.
///
/// Entry-level extraction problems never reach this type; they are collected
/// as strings on [`crate::archive::ExtractionResult`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Failed to open archive {}: {reason}", path.display())]
    ArchiveOpen { path: PathBuf, reason: String },

    #[error("Archive stream is corrupt: {0}")]
    Corrupt(String),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to render document: {0}")]
    Render(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn archive_open(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::ArchiveOpen {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::TaskJoin(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Decode(err.to_string())
    }
}
