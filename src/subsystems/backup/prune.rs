//! Id-cutoff pruning. Rows with `id >= cutoff` are deleted in one
//! transaction; link rows go with them through `ON DELETE CASCADE`.
//! Subjects are never pruned.

use rusqlite::{TransactionBehavior, params};
use tracing::info;

use crate::config::PruneConfig;
use crate::error::AppError;
use crate::subsystems::registry::Registry;
use crate::subsystems::registry::model::EntityKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneCutoffs {
    pub episodes_from_id: Option<i64>,
    pub threads_from_id: Option<i64>,
}

impl PruneCutoffs {
    pub fn is_empty(&self) -> bool {
        self.episodes_from_id.is_none() && self.threads_from_id.is_none()
    }
}

impl From<&PruneConfig> for PruneCutoffs {
    fn from(cfg: &PruneConfig) -> Self {
        Self { episodes_from_id: cfg.episodes_from_id, threads_from_id: cfg.threads_from_id }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub episodes: usize,
    pub threads: usize,
}

pub fn prune(registry: &Registry, cutoffs: &PruneCutoffs) -> Result<PruneReport, AppError> {
    let mut report = PruneReport::default();
    if cutoffs.is_empty() {
        return Ok(report);
    }

    let mut conn = registry.open_conn()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| AppError::Storage(format!("prune: begin tx: {e}")))?;

    for (kind, cutoff, deleted) in [
        (EntityKind::Episode, cutoffs.episodes_from_id, &mut report.episodes),
        (EntityKind::Thread, cutoffs.threads_from_id, &mut report.threads),
    ] {
        let Some(cutoff) = cutoff else { continue };
        let sql = format!("DELETE FROM {} WHERE id >= ?1", kind.table());
        *deleted = tx
            .execute(&sql, params![cutoff])
            .map_err(|e| AppError::Storage(format!("prune: delete {kind}: {e}")))?;
    }

    tx.commit()
        .map_err(|e| AppError::Storage(format!("prune: commit tx: {e}")))?;
    if report != PruneReport::default() {
        info!(episodes = report.episodes, threads = report.threads, "registry pruned");
    }
    Ok(report)
}
