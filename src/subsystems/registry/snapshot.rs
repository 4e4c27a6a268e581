//! Whole-registry snapshots: capture every row of every kind plus the link
//! tables, and restore a snapshot into a (possibly non-empty) registry.
//!
//! Ids in a snapshot are the ids at capture time. Restore re-keys rows by
//! their identity (subject name, episode url/title+date, thread external id)
//! so link rows land on whatever ids the target registry assigns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::model::{EntityKind, EntityRef, Episode, LinkTable, Subject, Thread};
use super::{
    Registry, RegistryWriter, collect_rows, episode_from_row, episode_id, insert_episode,
    insert_link, insert_thread, subject_from_row, thread_from_row, thread_id,
};
use crate::error::AppError;

/// Serialized form of the registry, keyed by kind name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub subject: Vec<Subject>,
    #[serde(default)]
    pub episode: Vec<Episode>,
    #[serde(default)]
    pub thread: Vec<Thread>,
    #[serde(default)]
    pub links: SnapshotLinks,
}

/// Link rows as `(left_id, right_id)` pairs, named after their tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLinks {
    #[serde(default)]
    pub subject_episode_link: Vec<(i64, i64)>,
    #[serde(default)]
    pub subject_thread_link: Vec<(i64, i64)>,
    #[serde(default)]
    pub episode_thread_link: Vec<(i64, i64)>,
}

impl SnapshotLinks {
    pub fn get(&self, table: LinkTable) -> &[(i64, i64)] {
        match table {
            LinkTable::SubjectEpisode => &self.subject_episode_link,
            LinkTable::SubjectThread => &self.subject_thread_link,
            LinkTable::EpisodeThread => &self.episode_thread_link,
        }
    }

    fn get_mut(&mut self, table: LinkTable) -> &mut Vec<(i64, i64)> {
        match table {
            LinkTable::SubjectEpisode => &mut self.subject_episode_link,
            LinkTable::SubjectThread => &mut self.subject_thread_link,
            LinkTable::EpisodeThread => &mut self.episode_thread_link,
        }
    }
}

impl Snapshot {
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Subject => self.subject.len(),
            EntityKind::Episode => self.episode.len(),
            EntityKind::Thread => self.thread.len(),
        }
    }
}

/// Rows a restore actually added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub subjects: usize,
    pub episodes: usize,
    pub threads: usize,
    pub links: usize,
}

impl Registry {
    /// Read every row inside one read transaction.
    pub fn snapshot(&self) -> Result<Snapshot, AppError> {
        let mut conn = self.open_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("snapshot: begin read tx: {e}")))?;

        let subject = collect_rows(
            &tx,
            "SELECT id, name, notes FROM subject ORDER BY id",
            subject_from_row,
            "subjects",
        )?;
        let episode = collect_rows(
            &tx,
            "SELECT id, url, title, published_date, episode_number, notes, links
             FROM episode ORDER BY id",
            episode_from_row,
            "episodes",
        )?;
        let thread = collect_rows(
            &tx,
            "SELECT id, external_id, title, permalink, created_at, raw_payload
             FROM thread ORDER BY id",
            thread_from_row,
            "threads",
        )?;

        let mut links = SnapshotLinks::default();
        for table in LinkTable::ALL {
            let (left, right) = table.endpoints();
            let sql = format!(
                "SELECT {left}_id, {right}_id FROM {} ORDER BY {left}_id, {right}_id",
                table.table()
            );
            *links.get_mut(table) =
                collect_rows(&tx, &sql, |row| Ok((row.get(0)?, row.get(1)?)), table.table())?;
        }

        tx.commit()
            .map_err(|e| AppError::Storage(format!("snapshot: end read tx: {e}")))?;

        Ok(Snapshot { taken_at: Utc::now(), subject, episode, thread, links })
    }
}

impl RegistryWriter {
    /// Merge `snapshot` into the registry in one transaction.
    ///
    /// Rows whose identity already exists are kept as they are; links are
    /// re-pointed at the ids those identities resolve to.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<RestoreReport, AppError> {
        let mut conn = self.open_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AppError::Storage(format!("restore: begin tx: {e}")))?;
        let mut report = RestoreReport::default();
        let mut ids: HashMap<EntityRef, i64> = HashMap::new();

        for s in &snapshot.subject {
            let notes = serde_json::to_string(&s.notes)
                .map_err(|e| AppError::Storage(format!("restore: encode notes: {e}")))?;
            report.subjects += tx
                .execute(
                    "INSERT OR IGNORE INTO subject (name, notes) VALUES (?1, ?2)",
                    params![s.name, notes],
                )
                .map_err(|e| AppError::Storage(format!("restore: subject {:?}: {e}", s.name)))?;
            let id: i64 = tx
                .query_row("SELECT id FROM subject WHERE name = ?1", params![s.name], |row| {
                    row.get(0)
                })
                .map_err(|e| AppError::Storage(format!("restore: subject id {:?}: {e}", s.name)))?;
            ids.insert(EntityRef { kind: EntityKind::Subject, id: s.id }, id);
        }

        for ep in &snapshot.episode {
            let id = match episode_id(&tx, &ep.fields)? {
                Some(id) => id,
                None => {
                    report.episodes += 1;
                    insert_episode(&tx, &ep.fields).map_err(|e| {
                        AppError::Storage(format!("restore: episode {:?}: {e}", ep.fields.url))
                    })?
                }
            };
            ids.insert(EntityRef { kind: EntityKind::Episode, id: ep.id }, id);
        }

        for t in &snapshot.thread {
            let id = match thread_id(&tx, &t.fields.external_id)? {
                Some(id) => id,
                None => {
                    report.threads += 1;
                    insert_thread(&tx, &t.fields).map_err(|e| {
                        AppError::Storage(format!(
                            "restore: thread {:?}: {e}",
                            t.fields.external_id
                        ))
                    })?
                }
            };
            ids.insert(EntityRef { kind: EntityKind::Thread, id: t.id }, id);
        }

        for table in LinkTable::ALL {
            let (left, right) = table.endpoints();
            for &(l, r) in snapshot.links.get(table) {
                let resolved = (
                    ids.get(&EntityRef { kind: left, id: l }),
                    ids.get(&EntityRef { kind: right, id: r }),
                );
                let (Some(&l), Some(&r)) = resolved else {
                    debug!(table = table.table(), l, r, "dangling snapshot link skipped");
                    continue;
                };
                report.links += insert_link(
                    &tx,
                    EntityRef { kind: left, id: l },
                    EntityRef { kind: right, id: r },
                )
                .map_err(|e| AppError::Storage(format!("restore: {}: {e}", table.table())))?;
            }
        }

        tx.commit()
            .map_err(|e| AppError::Storage(format!("restore: commit tx: {e}")))?;
        info!(
            subjects = report.subjects,
            episodes = report.episodes,
            threads = report.threads,
            links = report.links,
            "snapshot restored"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::registry::model::{Candidate, NewEpisode, NewThread};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn populated() -> (TempDir, Registry) {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("registry.db")).unwrap();
        let writer = registry.writer();
        writer.seed_subjects(&["Sam Harris".into(), "Eric Weinstein".into()]).unwrap();
        let sam = EntityRef { kind: EntityKind::Subject, id: registry.subjects().unwrap()[0].id };

        let ep = writer
            .commit(
                &Candidate::Episode(NewEpisode {
                    url: "https://pod/7".into(),
                    title: "Sam Harris returns".into(),
                    published_date: None,
                    episode_number: Some("7".into()),
                    notes: vec!["n".into()],
                    links: Default::default(),
                }),
                &[sam],
            )
            .unwrap();
        writer
            .commit(
                &Candidate::Thread(NewThread::with_payload(
                    "t9",
                    "Sam Harris returns discussion",
                    "https://reddit.com/t9",
                    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                    &json!({"score": 1}),
                )),
                &[sam, ep],
            )
            .unwrap();
        (tmp, registry)
    }

    #[test]
    fn snapshot_captures_rows_and_links() {
        let (_tmp, registry) = populated();
        let snap = registry.snapshot().unwrap();
        assert_eq!(snap.count(EntityKind::Subject), 2);
        assert_eq!(snap.count(EntityKind::Episode), 1);
        assert_eq!(snap.count(EntityKind::Thread), 1);
        assert_eq!(snap.links.subject_episode_link.len(), 1);
        assert_eq!(snap.links.subject_thread_link.len(), 1);
        assert_eq!(snap.links.episode_thread_link.len(), 1);

        let text = serde_json::to_value(&snap).unwrap();
        for key in ["subject", "episode", "thread", "links"] {
            assert!(text.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn restore_into_empty_registry_reproduces_graph() {
        let (_tmp, source) = populated();
        let snap = source.snapshot().unwrap();

        let tmp = TempDir::new().unwrap();
        let target = Registry::open(&tmp.path().join("restored.db")).unwrap();
        // Shift ids so restore cannot rely on them lining up.
        target.writer().seed_subjects(&["Someone Else".into()]).unwrap();

        let report = target.writer().restore(&snap).unwrap();
        assert_eq!(report, RestoreReport { subjects: 2, episodes: 1, threads: 1, links: 3 });

        let restored = target.snapshot().unwrap();
        let ep_id = restored.episode[0].id;
        let th_id = restored.thread[0].id;
        let sam_id = restored.subject.iter().find(|s| s.name == "Sam Harris").unwrap().id;
        assert_eq!(restored.links.subject_episode_link, vec![(sam_id, ep_id)]);
        assert_eq!(restored.links.subject_thread_link, vec![(sam_id, th_id)]);
        assert_eq!(restored.links.episode_thread_link, vec![(ep_id, th_id)]);
        assert_eq!(restored.episode[0].fields, snap.episode[0].fields);
        assert_eq!(restored.thread[0].fields, snap.thread[0].fields);
    }

    #[test]
    fn restore_is_idempotent() {
        let (_tmp, registry) = populated();
        let snap = registry.snapshot().unwrap();
        let report = registry.writer().restore(&snap).unwrap();
        assert_eq!(report, RestoreReport::default());
        assert_eq!(registry.count(EntityKind::Episode).unwrap(), 1);
    }
}
