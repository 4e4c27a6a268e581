//! Commit consumer: the only component that writes new entities.
//!
//! Items are taken one at a time from either queue (FIFO within a queue).
//! When both queues have items waiting, the next one is picked at random so
//! a busy queue cannot starve the other. A dequeued item always reaches a
//! terminal [`Outcome`]; cancellation is only observed while waiting for the
//! next item.
//!
//! Revalidation, matching and the insert share one write transaction, so a
//! prune or restore cannot remove a matched row before its link is written.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{matcher, Matches};
use crate::error::AppError;
use crate::subsystems::registry::RegistryWriter;
use crate::subsystems::registry::model::{Candidate, EntityKind, EntityRef};
use crate::subsystems::runtime::{Component, ComponentFuture};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Committed since the producer checked.
    AlreadyPersisted,
    /// A thread related to no subject and no episode.
    NoCrossReference,
    /// Revalidation or matching could not read the registry.
    MatchFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed { entity: EntityRef, matches: Matches },
    Discarded(DiscardReason),
}

/// Take one candidate to a terminal state. Blocking.
///
/// Read failures discard the item; only a failed insert/commit is an `Err`.
pub fn process(writer: &RegistryWriter, candidate: &Candidate) -> Result<Outcome, AppError> {
    let result = writer.locked(|session| {
        match session.exists(candidate) {
            Ok(true) => return Ok(Outcome::Discarded(DiscardReason::AlreadyPersisted)),
            Ok(false) => {}
            Err(e) => return Ok(read_failed(e)),
        }

        let matches = match matcher::all_matches(session, candidate) {
            Ok(m) => m,
            Err(e) => return Ok(read_failed(e)),
        };

        if candidate.kind() == EntityKind::Thread
            && matches.subjects.is_empty()
            && matches.episodes.is_empty()
        {
            return Ok(Outcome::Discarded(DiscardReason::NoCrossReference));
        }

        let entity = session.insert(candidate, &matches.refs())?;
        Ok(Outcome::Committed { entity, matches })
    });

    match result {
        // Could not open or lock the registry.
        Err(e @ AppError::Storage(_)) => Ok(read_failed(e)),
        other => other,
    }
}

fn read_failed(e: AppError) -> Outcome {
    Outcome::Discarded(DiscardReason::MatchFailed(e.to_string()))
}

pub struct CommitConsumer {
    writer: Arc<RegistryWriter>,
    episodes: mpsc::Receiver<Candidate>,
    threads: mpsc::Receiver<Candidate>,
}

impl CommitConsumer {
    pub fn new(
        writer: Arc<RegistryWriter>,
        episodes: mpsc::Receiver<Candidate>,
        threads: mpsc::Receiver<Candidate>,
    ) -> Self {
        Self { writer, episodes, threads }
    }

    /// Drain both queues until shutdown or until both are closed.
    ///
    /// Returns the first commit error; the item that caused it is lost.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AppError> {
        let mut episodes_open = true;
        let mut threads_open = true;
        info!("commit consumer started");

        while episodes_open || threads_open {
            let (episodes, threads) = (&mut self.episodes, &mut self.threads);
            let (take_episodes, take_threads) = (episodes_open, threads_open);
            // Unbiased: either ready queue may win.
            let next = async move {
                tokio::select! {
                    item = episodes.recv(), if take_episodes => (EntityKind::Episode, item),
                    item = threads.recv(), if take_threads => (EntityKind::Thread, item),
                }
            };

            let (kind, item) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = next => next,
            };
            let Some(candidate) = item else {
                debug!(%kind, "queue closed");
                match kind {
                    EntityKind::Thread => threads_open = false,
                    _ => episodes_open = false,
                }
                continue;
            };
            handle(&self.writer, candidate).await?;
        }

        debug!("commit consumer stopped");
        Ok(())
    }
}

/// [`process`] on the blocking pool, with the outcome logged.
pub async fn handle(writer: &Arc<RegistryWriter>, candidate: Candidate) -> Result<Outcome, AppError> {
    let label = candidate.label();
    let kind = candidate.kind();
    let writer = writer.clone();
    let outcome = super::blocking(move || process(&writer, &candidate)).await?;

    match &outcome {
        Outcome::Committed { entity, matches } => info!(
            %kind,
            id = entity.id,
            subjects = matches.subjects.len(),
            episodes = matches.episodes.len(),
            threads = matches.threads.len(),
            "persisted {label}"
        ),
        Outcome::Discarded(DiscardReason::MatchFailed(e)) => {
            warn!(%kind, "skipped {label}: registry read failed: {e}")
        }
        Outcome::Discarded(reason) => debug!(%kind, ?reason, "skipped {label}"),
    }
    Ok(outcome)
}

impl Component for CommitConsumer {
    fn id(&self) -> &str {
        "commit-consumer"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(CommitConsumer::run(*self, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::backup::prune::{PruneCutoffs, prune};
    use crate::subsystems::registry::Registry;
    use crate::subsystems::registry::model::{LinkTable, NewEpisode, NewThread};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::fs;
    use std::thread as std_thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn episode(n: u32, title: &str) -> Candidate {
        Candidate::Episode(NewEpisode {
            url: format!("https://pod/{n}"),
            title: title.into(),
            published_date: Some(Utc.with_ymd_and_hms(2024, 1, n, 0, 0, 0).unwrap()),
            episode_number: None,
            notes: vec![],
            links: Default::default(),
        })
    }

    fn thread(id: &str, title: &str) -> Candidate {
        Candidate::Thread(NewThread::with_payload(
            id,
            title,
            format!("https://reddit.com/{id}"),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            &json!({"id": id}),
        ))
    }

    fn seeded() -> (TempDir, Registry, Arc<RegistryWriter>) {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        let writer = Arc::new(registry.writer());
        writer.seed_subjects(&["Jordan Peterson".into(), "Rogan".into()]).unwrap();
        (tmp, registry, writer)
    }

    #[test]
    fn episodes_commit_even_without_matches() {
        let (_tmp, registry, writer) = seeded();
        let outcome = process(&writer, &episode(1, "Nothing related")).unwrap();
        assert!(matches!(outcome, Outcome::Committed { ref matches, .. } if matches.total() == 0));
        assert_eq!(registry.count(EntityKind::Episode).unwrap(), 1);
    }

    #[test]
    fn unmatched_thread_is_discarded() {
        let (_tmp, registry, writer) = seeded();
        let outcome = process(&writer, &thread("t1", "Random chatter")).unwrap();
        assert_eq!(outcome, Outcome::Discarded(DiscardReason::NoCrossReference));
        assert_eq!(registry.count(EntityKind::Thread).unwrap(), 0);
    }

    #[test]
    fn thread_links_subjects_and_episodes() {
        let (_tmp, registry, writer) = seeded();
        let Outcome::Committed { entity: ep, .. } =
            process(&writer, &episode(1, "Jordan Peterson")).unwrap()
        else {
            panic!("episode should commit");
        };
        let outcome = process(&writer, &thread("t1", "Thoughts on the Jordan Peterson episode")).unwrap();
        let Outcome::Committed { entity, matches } = outcome else {
            panic!("thread should commit");
        };
        assert_eq!(matches.subjects.len(), 1);
        assert_eq!(matches.episodes, vec![ep.id]);
        assert_eq!(registry.links(LinkTable::EpisodeThread).unwrap(), vec![(ep.id, entity.id)]);
        assert_eq!(registry.links(LinkTable::SubjectThread).unwrap().len(), 1);
    }

    #[test]
    fn second_copy_is_already_persisted() {
        let (_tmp, registry, writer) = seeded();
        let ep = episode(1, "Rogan");
        assert!(matches!(process(&writer, &ep).unwrap(), Outcome::Committed { .. }));
        assert_eq!(
            process(&writer, &ep).unwrap(),
            Outcome::Discarded(DiscardReason::AlreadyPersisted)
        );
        assert_eq!(registry.count(EntityKind::Episode).unwrap(), 1);
        assert_eq!(registry.links(LinkTable::SubjectEpisode).unwrap().len(), 1);
    }

    #[test]
    fn unreadable_registry_discards_item() {
        let (tmp, _registry, writer) = seeded();
        // Replace the database with a directory so every open fails.
        let db = tmp.path().join("r.db");
        fs::remove_file(&db).unwrap();
        let _ = fs::remove_file(tmp.path().join("r.db-wal"));
        let _ = fs::remove_file(tmp.path().join("r.db-shm"));
        fs::create_dir(&db).unwrap();

        let outcome = process(&writer, &episode(1, "x")).unwrap();
        assert!(matches!(outcome, Outcome::Discarded(DiscardReason::MatchFailed(_))));
    }

    #[test]
    fn prune_waits_for_an_open_commit() {
        let (_tmp, registry, writer) = seeded();
        let Outcome::Committed { entity: ep, .. } =
            process(&writer, &episode(1, "Rogan live")).unwrap()
        else {
            panic!("episode should commit");
        };
        let th = thread("t1", "Rogan live discussion");

        let (entity, pruner) = writer
            .locked(|session| {
                let matches = matcher::all_matches(session, &th)?;
                assert_eq!(matches.episodes, vec![ep.id]);

                let registry = registry.clone();
                let pruner = std_thread::spawn(move || {
                    let cutoffs = PruneCutoffs { episodes_from_id: Some(ep.id), threads_from_id: None };
                    prune(&registry, &cutoffs)
                });
                // Give the prune time to queue on the lock.
                std_thread::sleep(Duration::from_millis(100));

                let entity = session.insert(&th, &matches.refs())?;
                Ok((entity, pruner))
            })
            .unwrap();

        let report = pruner.join().unwrap().unwrap();
        assert_eq!(report.episodes, 1);
        assert_eq!(registry.threads().unwrap()[0].id, entity.id);
        assert_eq!(registry.count(EntityKind::Episode).unwrap(), 0);
        assert!(registry.links(LinkTable::EpisodeThread).unwrap().is_empty());
        assert_eq!(registry.links(LinkTable::SubjectThread).unwrap().len(), 1);
    }

    #[test]
    fn commit_after_prune_matches_what_remains() {
        let (_tmp, registry, writer) = seeded();
        process(&writer, &episode(1, "Rogan live")).unwrap();
        let cutoffs = PruneCutoffs { episodes_from_id: Some(1), threads_from_id: None };
        prune(&registry, &cutoffs).unwrap();

        let Outcome::Committed { matches, .. } =
            process(&writer, &thread("t1", "Rogan live discussion")).unwrap()
        else {
            panic!("thread should commit on its subject match");
        };
        assert!(matches.episodes.is_empty());
        assert_eq!(matches.subjects.len(), 1);
    }

    #[tokio::test]
    async fn consumer_drains_queue_in_order_and_exits_when_closed() {
        let (_tmp, registry, writer) = seeded();
        let (ep_tx, ep_rx) = mpsc::channel(8);
        let (th_tx, th_rx) = mpsc::channel(8);
        for (n, title) in [(1, "A"), (2, "B"), (3, "C")] {
            ep_tx.send(episode(n, title)).await.unwrap();
        }
        drop(ep_tx);
        drop(th_tx);

        let consumer = CommitConsumer::new(writer, ep_rx, th_rx);
        consumer.run(CancellationToken::new()).await.unwrap();

        let titles: Vec<String> =
            registry.episodes().unwrap().into_iter().map(|e| e.fields.title).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn busy_episode_queue_does_not_starve_threads() {
        let (_tmp, registry, writer) = seeded();
        let (ep_tx, ep_rx) = mpsc::channel(64);
        let (th_tx, th_rx) = mpsc::channel(1);
        for n in 0..64 {
            ep_tx
                .send(Candidate::Episode(NewEpisode {
                    url: format!("https://pod/{n}"),
                    title: format!("Rogan {n}"),
                    published_date: None,
                    episode_number: None,
                    notes: vec![],
                    links: Default::default(),
                }))
                .await
                .unwrap();
        }
        th_tx.send(thread("t1", "Rogan")).await.unwrap();
        drop(ep_tx);
        drop(th_tx);

        CommitConsumer::new(writer, ep_rx, th_rx)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(registry.count(EntityKind::Episode).unwrap(), 64);
        assert_eq!(registry.count(EntityKind::Thread).unwrap(), 1);
        // Served only after the last episode, the thread would link all 64.
        assert!(registry.links(LinkTable::EpisodeThread).unwrap().len() < 64);
    }

    #[tokio::test]
    async fn consumer_stops_on_cancel() {
        let (_tmp, _registry, writer) = seeded();
        let (_ep_tx, ep_rx) = mpsc::channel::<Candidate>(8);
        let (_th_tx, th_rx) = mpsc::channel::<Candidate>(8);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        CommitConsumer::new(writer, ep_rx, th_rx).run(shutdown).await.unwrap();
    }
}
