//! Candidate sources: the external feeds producers pull from.
//!
//! A [`CandidateSource`] yields one *cycle* of normalized candidates per
//! [`CandidateSource::poll`] call. Episode feeds end their stream once the
//! feed document is exhausted; live thread sources keep yielding until the
//! caller drops the stream.
//!
//! Concrete sources sit behind cargo features so a deployment only compiles
//! the clients it talks to.

#[cfg(feature = "source-feed")]
pub mod feed;
#[cfg(feature = "source-subreddit")]
pub mod subreddit;

use futures_util::stream::BoxStream;
use thiserror::Error;

use super::registry::model::{Candidate, EntityKind};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http request failed: {0}")]
    Http(String),

    #[error("unexpected http status {0}")]
    Status(u16),

    #[error("cannot parse response: {0}")]
    Parse(String),
}

#[cfg(any(feature = "source-feed", feature = "source-subreddit"))]
impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SourceError::Status(status.as_u16()),
            None => SourceError::Http(e.to_string()),
        }
    }
}

/// An external content source producing candidates of one kind.
pub trait CandidateSource: Send + 'static {
    /// Short name for log lines, e.g. the feed host or `r/name`.
    fn label(&self) -> &str;

    /// Kind of every candidate this source yields.
    fn kind(&self) -> EntityKind;

    /// Start one cycle. `limit` caps how many candidates the stream yields.
    fn poll(&mut self, limit: Option<usize>) -> BoxStream<'_, Result<Candidate, SourceError>>;
}

/// Build the shared HTTP client for the concrete sources.
#[cfg(any(feature = "source-feed", feature = "source-subreddit"))]
pub fn http_client(user_agent: &str) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| SourceError::Http(format!("cannot build client: {e}")))
}
