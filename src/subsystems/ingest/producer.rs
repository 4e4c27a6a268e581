//! Producers, one per candidate source.
//!
//! A producer runs cycles: poll the source, drop candidates the registry
//! already holds, enqueue the rest in discovery order. A cycle ends when
//! the source is exhausted, when the cycle has seen more than `max_dupes`
//! duplicates, or on a source error. Between cycles the producer
//! idles for `idle`. Every await point is raced against the shutdown token.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dedup;
use crate::error::AppError;
use crate::subsystems::registry::Registry;
use crate::subsystems::registry::model::Candidate;
use crate::subsystems::runtime::{Component, ComponentFuture};
use crate::subsystems::sources::{CandidateSource, SourceError};

/// Why a cycle stopped.
#[derive(Debug)]
pub enum CycleEnd {
    Exhausted,
    MaxDuplicatesReached { duplicates: usize },
    SourceFailed(SourceError),
    Cancelled,
    /// The consumer dropped its end of the queue.
    QueueClosed,
}

#[derive(Debug)]
pub struct CycleReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub end: CycleEnd,
}

pub struct Producer {
    id: String,
    source: Box<dyn CandidateSource>,
    registry: Registry,
    queue: mpsc::Sender<Candidate>,
    /// Duplicates tolerated per cycle. 0 = unlimited.
    max_dupes: usize,
    idle: Duration,
}

impl Producer {
    pub fn new(
        source: Box<dyn CandidateSource>,
        registry: Registry,
        queue: mpsc::Sender<Candidate>,
        max_dupes: usize,
        idle: Duration,
    ) -> Self {
        let id = format!("{}-producer", source.kind());
        Self { id, source, registry, queue, max_dupes, idle }
    }

    /// Run one cycle against the source.
    pub async fn produce_batch(&mut self, shutdown: &CancellationToken) -> CycleReport {
        let mut accepted = 0;
        let mut duplicates = 0;
        let mut stream = self.source.poll(None);

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break CycleEnd::Cancelled,
                next = stream.next() => next,
            };
            let candidate = match next {
                None => break CycleEnd::Exhausted,
                Some(Err(e)) => break CycleEnd::SourceFailed(e),
                Some(Ok(candidate)) => candidate,
            };

            match dedup::exists_async(&self.registry, &candidate).await {
                Ok(true) => {
                    duplicates += 1;
                    debug!(producer = %self.id, candidate = %candidate.label(), "duplicate skipped");
                    if self.max_dupes > 0 && duplicates > self.max_dupes {
                        break CycleEnd::MaxDuplicatesReached { duplicates };
                    }
                    continue;
                }
                Ok(false) => {}
                // The consumer re-checks anyway.
                Err(e) => warn!(producer = %self.id, "duplicate check failed: {e}"),
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break CycleEnd::Cancelled,
                sent = self.queue.send(candidate) => {
                    if sent.is_err() {
                        break CycleEnd::QueueClosed;
                    }
                }
            }
            accepted += 1;
        };

        CycleReport { accepted, duplicates, end }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AppError> {
        info!(producer = %self.id, source = %self.source.label(), "producer started");
        loop {
            let report = self.produce_batch(&shutdown).await;
            match &report.end {
                CycleEnd::Cancelled => break,
                CycleEnd::QueueClosed => {
                    info!(producer = %self.id, "queue closed, producer stopping");
                    break;
                }
                CycleEnd::SourceFailed(e) => {
                    warn!(producer = %self.id, accepted = report.accepted, "source failed: {e}");
                }
                CycleEnd::MaxDuplicatesReached { duplicates } => {
                    debug!(producer = %self.id, duplicates, "duplicate threshold reached");
                }
                CycleEnd::Exhausted => {}
            }
            info!(
                producer = %self.id,
                accepted = report.accepted,
                duplicates = report.duplicates,
                "cycle finished"
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.idle) => {}
            }
        }
        debug!(producer = %self.id, "producer stopped");
        Ok(())
    }
}

impl Component for Producer {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(Producer::run(*self, shutdown))
    }
}
