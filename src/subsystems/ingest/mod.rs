//! Ingestion pipeline: producers, the dedup filter, the cross-reference
//! matcher and the commit consumer.
//!
//! ```text
//! CandidateSource ──► Producer ──(dedup)──► mpsc queue ──► CommitConsumer
//!                                                               │
//!                                             matcher ◄─────────┤
//!                                                               ▼
//!                                                     RegistryWriter::commit
//! ```
//!
//! One bounded queue per candidate kind. Registry access is blocking
//! SQLite, so async callers go through [`blocking`].

pub mod consumer;
pub mod dedup;
pub mod matcher;
pub mod producer;

pub use consumer::{CommitConsumer, DiscardReason, Outcome};
pub use matcher::Matches;
pub use producer::{CycleEnd, CycleReport, Producer};

use crate::error::AppError;

/// Run a blocking registry call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Task(format!("registry task panicked: {e}")))?
}
