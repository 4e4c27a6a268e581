//! Backup scheduler: periodic snapshot plus prune.
//!
//! Each cycle sleeps `interval`, writes a full snapshot to the sink, then
//! prunes if any cutoff is configured. Failures are logged and the next
//! cycle tries again.

pub mod prune;
pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::subsystems::ingest::blocking;
use crate::subsystems::registry::Registry;
use crate::subsystems::registry::model::EntityKind;
use crate::subsystems::runtime::{Component, ComponentFuture};
use prune::{PruneCutoffs, PruneReport};
use sink::BackupSink;

/// Snapshot the registry into `sink` now.
pub async fn backup_now(registry: &Registry, sink: &Arc<dyn BackupSink>) -> Result<(), AppError> {
    let registry = registry.clone();
    let sink = sink.clone();
    blocking(move || {
        let snapshot = registry.snapshot()?;
        sink.write(&snapshot)?;
        info!(
            subjects = snapshot.count(EntityKind::Subject),
            episodes = snapshot.count(EntityKind::Episode),
            threads = snapshot.count(EntityKind::Thread),
            "backup written"
        );
        Ok(())
    })
    .await
}

/// Run one prune pass now.
pub async fn prune_now(registry: &Registry, cutoffs: PruneCutoffs) -> Result<PruneReport, AppError> {
    let registry = registry.clone();
    blocking(move || prune::prune(&registry, &cutoffs)).await
}

pub struct BackupScheduler {
    registry: Registry,
    sink: Arc<dyn BackupSink>,
    interval: Duration,
    cutoffs: PruneCutoffs,
}

impl BackupScheduler {
    pub fn new(
        registry: Registry,
        sink: Arc<dyn BackupSink>,
        interval: Duration,
        cutoffs: PruneCutoffs,
    ) -> Self {
        Self { registry, sink, interval, cutoffs }
    }

    async fn cycle(&self) {
        if let Err(e) = backup_now(&self.registry, &self.sink).await {
            warn!("scheduled backup failed: {e}");
        }
        if !self.cutoffs.is_empty() {
            if let Err(e) = prune_now(&self.registry, self.cutoffs).await {
                warn!("scheduled prune failed: {e}");
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AppError> {
        debug!(interval_secs = self.interval.as_secs(), "backup scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => self.cycle().await,
            }
        }
        debug!("backup scheduler stopped");
        Ok(())
    }
}

impl Component for BackupScheduler {
    fn id(&self) -> &str {
        "backup-scheduler"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(BackupScheduler::run(*self, shutdown))
    }
}
