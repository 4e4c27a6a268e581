//! Coordinator: owns the write handle and every task lifetime.
//!
//! Startup ([`Coordinator::setup`]) runs serially before any task exists:
//!   1. Seed subjects from the seed file
//!   2. Restore the last snapshot (`backup.restore_on_start`)
//!   3. Prune once (`prune.on_start`)
//!   4. Backfill episodes through the commit path (`episodes.backfill`)
//!
//! [`Coordinator::run`] then spawns producers, the commit consumer and the
//! backup scheduler under a task token of its own, and waits for either the
//! external shutdown token or a failed task. Shutdown writes one final
//! backup, cancels the task token and drains every task.

pub mod seed;

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::subsystems::backup::prune::{PruneCutoffs, PruneReport};
use crate::subsystems::backup::sink::{BackupSink, JsonFileSink};
use crate::subsystems::backup::{self, BackupScheduler};
use crate::subsystems::ingest::{self, CommitConsumer, Outcome, Producer, consumer};
use crate::subsystems::registry::model::{Candidate, NewEpisode};
use crate::subsystems::registry::snapshot::RestoreReport;
use crate::subsystems::registry::{Registry, RegistryWriter};
use crate::subsystems::runtime::{Component, spawn_components};
use crate::subsystems::sources::CandidateSource;

/// The sources a coordinator drives. `None` = that producer is not started.
#[derive(Default)]
pub struct Sources {
    pub episodes: Option<Box<dyn CandidateSource>>,
    pub threads: Option<Box<dyn CandidateSource>>,
}

/// What [`Coordinator::setup`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetupReport {
    pub seeded: usize,
    pub restored: Option<RestoreReport>,
    pub pruned: Option<PruneReport>,
    pub backfilled: usize,
}

pub struct Coordinator {
    config: Config,
    registry: Registry,
    writer: Arc<RegistryWriter>,
    sink: Arc<dyn BackupSink>,
    sources: Sources,
}

impl Coordinator {
    pub fn new(config: Config, registry: Registry, sink: Arc<dyn BackupSink>, sources: Sources) -> Self {
        let writer = Arc::new(registry.writer());
        Self { config, registry, writer, sink, sources }
    }

    /// Open the registry and JSON backup sink named in `config`.
    pub fn open(config: Config, sources: Sources) -> Result<Self, AppError> {
        let registry = Registry::open(&config.database)?;
        let sink: Arc<dyn BackupSink> =
            Arc::new(JsonFileSink::new(config.backup.path.clone(), config.backup.retain));
        Ok(Self::new(config, registry, sink, sources))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn setup(&mut self) -> Result<SetupReport, AppError> {
        let mut report = SetupReport::default();

        let seed_file = self.config.seed_file.clone();
        let writer = self.writer.clone();
        report.seeded = ingest::blocking(move || {
            let names = seed::load_names(&seed_file)?;
            writer.seed_subjects(&names)
        })
        .await?;

        if self.config.backup.restore_on_start {
            let sink = self.sink.clone();
            let writer = self.writer.clone();
            report.restored = ingest::blocking(move || match sink.read()? {
                Some(snapshot) => writer.restore(&snapshot).map(Some),
                None => {
                    warn!("restore requested but no backup exists yet");
                    Ok(None)
                }
            })
            .await?;
        }

        if self.config.prune.on_start {
            let cutoffs = PruneCutoffs::from(&self.config.prune);
            report.pruned = Some(backup::prune_now(&self.registry, cutoffs).await?);
        }

        if self.config.episodes.backfill > 0 {
            report.backfilled = self.backfill(self.config.episodes.backfill).await?;
        }

        info!(
            seeded = report.seeded,
            restored = report.restored.is_some(),
            backfilled = report.backfilled,
            "setup complete"
        );
        Ok(report)
    }

    /// Pull up to `limit` episodes and commit them oldest first.
    async fn backfill(&mut self, limit: usize) -> Result<usize, AppError> {
        let Some(source) = self.sources.episodes.as_mut() else {
            return Ok(0);
        };

        let mut episodes: Vec<NewEpisode> = Vec::new();
        let mut stream = source.poll(Some(limit));
        while let Some(item) = stream.next().await {
            match item {
                Ok(Candidate::Episode(ep)) => episodes.push(ep),
                Ok(other) => warn!(kind = %other.kind(), "backfill ignored non-episode candidate"),
                Err(e) => {
                    warn!("backfill source failed: {e}");
                    break;
                }
            }
        }
        drop(stream);
        episodes.sort_by_key(|ep| ep.published_date);

        let mut committed = 0;
        for ep in episodes {
            if let Outcome::Committed { .. } = consumer::handle(&self.writer, ep.into()).await? {
                committed += 1;
            }
        }
        Ok(committed)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AppError> {
        let Coordinator { config, registry, writer, sink, sources } = self;

        let (episodes_tx, episodes_rx) = mpsc::channel(config.episodes.queue_capacity);
        let (threads_tx, threads_rx) = mpsc::channel(config.threads.queue_capacity);

        let mut components: Vec<Box<dyn Component>> = Vec::new();
        if let Some(source) = sources.episodes {
            components.push(Box::new(Producer::new(
                source,
                registry.clone(),
                episodes_tx,
                config.episodes.max_dupes,
                config.episodes.poll_interval,
            )));
        } else {
            drop(episodes_tx);
        }
        if let Some(source) = sources.threads {
            components.push(Box::new(Producer::new(
                source,
                registry.clone(),
                threads_tx,
                config.threads.max_dupes,
                config.threads.poll_interval,
            )));
        } else {
            drop(threads_tx);
        }
        components.push(Box::new(CommitConsumer::new(writer, episodes_rx, threads_rx)));
        components.push(Box::new(BackupScheduler::new(
            registry.clone(),
            sink.clone(),
            config.backup.interval,
            PruneCutoffs::from(&config.prune),
        )));

        // Not a child of `shutdown`: the final backup runs before tasks stop.
        let tasks = CancellationToken::new();
        let handle = spawn_components(components, tasks.clone());
        let failed = handle.failed();
        info!(pipeline = %config.name, "pipeline running");

        tokio::select! {
            _ = shutdown.cancelled() => info!("shutdown requested"),
            _ = failed.cancelled() => warn!("pipeline task failed, shutting down"),
        }

        if let Err(e) = backup::backup_now(&registry, &sink).await {
            warn!("final backup failed: {e}");
        }
        tasks.cancel();
        let result = handle.join().await;
        info!("pipeline stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::registry::model::EntityKind;
    use crate::subsystems::sources::SourceError;
    use crate::subsystems::sources::scripted::ScriptedSource;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    fn ep(n: u32, day: u32) -> Candidate {
        Candidate::Episode(NewEpisode {
            url: format!("https://pod/{n}"),
            title: format!("Episode {n}"),
            published_date: Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
            episode_number: None,
            notes: vec![],
            links: Default::default(),
        })
    }

    #[tokio::test]
    async fn setup_seeds_and_backfills_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::test_default(tmp.path());
        config.episodes.backfill = 2;
        fs::write(&config.seed_file, "Alpha, Beta\nAlpha").unwrap();

        let source = ScriptedSource::new(
            EntityKind::Episode,
            vec![vec![Ok(ep(3, 3)), Ok(ep(2, 2)), Ok(ep(1, 1))]],
        );
        let sources = Sources { episodes: Some(Box::new(source)), threads: None };
        let mut coordinator = Coordinator::open(config, sources).unwrap();

        let report = coordinator.setup().await.unwrap();
        assert_eq!(report.seeded, 2);
        assert_eq!(report.backfilled, 2);

        let titles: Vec<String> = coordinator
            .registry()
            .episodes()
            .unwrap()
            .into_iter()
            .map(|e| e.fields.title)
            .collect();
        assert_eq!(titles, vec!["Episode 2", "Episode 3"]);

        // Second setup seeds nothing new.
        assert_eq!(coordinator.setup().await.unwrap().seeded, 0);
    }

    #[tokio::test]
    async fn backfill_stops_at_source_error() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::test_default(tmp.path());
        config.episodes.backfill = 10;

        let source = ScriptedSource::new(
            EntityKind::Episode,
            vec![vec![Ok(ep(1, 1)), Err(SourceError::Http("reset".into())), Ok(ep(2, 2))]],
        );
        let sources = Sources { episodes: Some(Box::new(source)), threads: None };
        let mut coordinator = Coordinator::open(config, sources).unwrap();
        assert_eq!(coordinator.setup().await.unwrap().backfilled, 1);
    }

    #[tokio::test]
    async fn restore_on_start_without_backup_is_noop() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::test_default(tmp.path());
        config.backup.restore_on_start = true;
        let mut coordinator = Coordinator::open(config, Sources::default()).unwrap();
        assert_eq!(coordinator.setup().await.unwrap().restored, None);
    }

    #[tokio::test]
    async fn run_writes_final_backup_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let config = Config::test_default(tmp.path());
        let backup_path = config.backup.path.clone();
        fs::write(&config.seed_file, "Alpha").unwrap();

        let mut coordinator = Coordinator::open(config, Sources::default()).unwrap();
        coordinator.setup().await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        coordinator.run(shutdown).await.unwrap();

        let snapshot = JsonFileSink::new(backup_path, 0).read().unwrap().unwrap();
        assert_eq!(snapshot.subject.len(), 1);
    }
}
