//! Application-wide error types.

use thiserror::Error;

use crate::subsystems::sources::SourceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Raised only by the write path. Fatal to the commit consumer.
    #[error("commit error: {0}")]
    Commit(String),

    #[error("backup error: {0}")]
    Backup(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("task error: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
