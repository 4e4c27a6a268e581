//! Entity Registry: SQLite-backed store of subjects, episodes, threads and
//! the three link tables between them.
//!
//! ```text
//! {work_dir}/
//! └── registry.db
//!     ├── subject                 (id, name UNIQUE, notes)
//!     ├── episode                 (id, url UNIQUE, title, published_date, …)
//!     ├── thread                  (id, external_id UNIQUE, title, …)
//!     ├── subject_episode_link    (subject_id, episode_id)
//!     ├── subject_thread_link     (subject_id, thread_id)
//!     └── episode_thread_link     (episode_id, thread_id)
//! ```
//!
//! Two handles share the file:
//!
//! - [`Registry`]: cheap to clone, read-only queries. Producers, the matcher
//!   and the backup scheduler use this.
//! - [`RegistryWriter`]: the only type that inserts entities and links.
//!   The coordinator creates exactly one and hands it to the commit consumer
//!   once startup seeding is done.
//!
//! Every operation opens its own connection (WAL mode, foreign keys on), so
//! handles can move freely into `spawn_blocking` closures. Writes begin
//! `IMMEDIATE` so they queue on the database lock instead of failing on a
//! stale read snapshot.

pub mod model;
pub mod snapshot;

use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::error::AppError;
use model::{
    Candidate, EntityKind, EntityRef, Episode, LinkTable, NewEpisode, NewThread, Subject, Thread,
    timestamp_text,
};

const SCHEMA_VERSION: i64 = 1;

/// Read handle to the registry database.
#[derive(Debug, Clone)]
pub struct Registry {
    db_path: PathBuf,
}

impl Registry {
    /// Open (creating if needed) the registry at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Storage(format!("registry: cannot create {}: {e}", parent.display()))
            })?;
        }
        let registry = Self { db_path: db_path.to_path_buf() };
        registry.init_db()?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Create the single write handle for this registry.
    pub fn writer(&self) -> RegistryWriter {
        RegistryWriter { registry: self.clone() }
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn subjects(&self) -> Result<Vec<Subject>, AppError> {
        let conn = self.open_conn()?;
        collect_rows(
            &conn,
            "SELECT id, name, notes FROM subject ORDER BY id",
            subject_from_row,
            "subjects",
        )
    }

    pub fn episodes(&self) -> Result<Vec<Episode>, AppError> {
        let conn = self.open_conn()?;
        collect_rows(
            &conn,
            "SELECT id, url, title, published_date, episode_number, notes, links
             FROM episode ORDER BY id",
            episode_from_row,
            "episodes",
        )
    }

    pub fn threads(&self) -> Result<Vec<Thread>, AppError> {
        let conn = self.open_conn()?;
        collect_rows(
            &conn,
            "SELECT id, external_id, title, permalink, created_at, raw_payload
             FROM thread ORDER BY id",
            thread_from_row,
            "threads",
        )
    }

    /// `(id, identity)` for every row of `kind`, the matcher's scan input.
    pub fn identities(&self, kind: EntityKind) -> Result<Vec<(i64, String)>, AppError> {
        identities(&self.open_conn()?, kind)
    }

    /// `true` if an episode with the same (title, date) or the same url exists.
    pub fn episode_exists(&self, ep: &NewEpisode) -> Result<bool, AppError> {
        let conn = self.open_conn()?;
        episode_id(&conn, ep).map(|id| id.is_some())
    }

    /// `true` if a thread with the same external id exists.
    pub fn thread_exists(&self, thread: &NewThread) -> Result<bool, AppError> {
        let conn = self.open_conn()?;
        thread_id(&conn, &thread.external_id).map(|id| id.is_some())
    }

    /// Number of rows of `kind`.
    pub fn count(&self, kind: EntityKind) -> Result<usize, AppError> {
        let conn = self.open_conn()?;
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| AppError::Storage(format!("registry: count {kind}: {e}")))
    }

    /// All `(left_id, right_id)` rows of a link table.
    pub fn links(&self, table: LinkTable) -> Result<Vec<(i64, i64)>, AppError> {
        let conn = self.open_conn()?;
        let (left, right) = table.endpoints();
        let sql = format!(
            "SELECT {left}_id, {right}_id FROM {} ORDER BY {left}_id, {right}_id",
            table.table()
        );
        collect_rows(&conn, &sql, |row| Ok((row.get(0)?, row.get(1)?)), table.table())
    }

    /// Ids of `target` rows linked to `entity`.
    pub fn related(&self, entity: EntityRef, target: EntityKind) -> Result<Vec<i64>, AppError> {
        let Some(table) = LinkTable::between(entity.kind, target) else {
            return Ok(Vec::new());
        };
        let conn = self.open_conn()?;
        let sql = format!(
            "SELECT {target}_id FROM {} WHERE {}_id = ?1 ORDER BY {target}_id",
            table.table(),
            entity.kind
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Storage(format!("registry: prepare related: {e}")))?;
        let rows = stmt
            .query_map(params![entity.id], |row| row.get(0))
            .map_err(|e| AppError::Storage(format!("registry: query related: {e}")))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(|e| AppError::Storage(format!("registry: map related row: {e}")))?);
        }
        Ok(ids)
    }

    // ── Connection ────────────────────────────────────────────────────

    fn init_db(&self) -> Result<(), AppError> {
        let conn = self.open_conn()?;
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(|e| AppError::Storage(format!("registry: read schema version: {e}")))?;

        if version == 0 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS subject (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    notes TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS episode (
                    id INTEGER PRIMARY KEY,
                    url TEXT NOT NULL UNIQUE,
                    title TEXT NOT NULL,
                    published_date TEXT,
                    episode_number TEXT,
                    notes TEXT NOT NULL DEFAULT '[]',
                    links TEXT NOT NULL DEFAULT '{}'
                );
                CREATE INDEX IF NOT EXISTS episode_identity ON episode (title, published_date);

                CREATE TABLE IF NOT EXISTS thread (
                    id INTEGER PRIMARY KEY,
                    external_id TEXT NOT NULL UNIQUE,
                    title TEXT NOT NULL,
                    permalink TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    raw_payload TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS subject_episode_link (
                    subject_id INTEGER NOT NULL REFERENCES subject (id) ON DELETE CASCADE,
                    episode_id INTEGER NOT NULL REFERENCES episode (id) ON DELETE CASCADE,
                    PRIMARY KEY (subject_id, episode_id)
                );

                CREATE TABLE IF NOT EXISTS subject_thread_link (
                    subject_id INTEGER NOT NULL REFERENCES subject (id) ON DELETE CASCADE,
                    thread_id INTEGER NOT NULL REFERENCES thread (id) ON DELETE CASCADE,
                    PRIMARY KEY (subject_id, thread_id)
                );

                CREATE TABLE IF NOT EXISTS episode_thread_link (
                    episode_id INTEGER NOT NULL REFERENCES episode (id) ON DELETE CASCADE,
                    thread_id INTEGER NOT NULL REFERENCES thread (id) ON DELETE CASCADE,
                    PRIMARY KEY (episode_id, thread_id)
                );

                PRAGMA user_version = 1;
                ",
            )
            .map_err(|e| AppError::Storage(format!("registry: initialize schema: {e}")))?;
            debug!(path = %self.db_path.display(), "registry schema created");
            return Ok(());
        }

        if version != SCHEMA_VERSION {
            return Err(AppError::Storage(format!(
                "registry: unsupported schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    pub(crate) fn open_conn(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            AppError::Storage(format!("registry: open {}: {e}", self.db_path.display()))
        })?;

        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| AppError::Storage(format!("registry: set busy_timeout: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::Storage(format!("registry: set journal_mode WAL: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| AppError::Storage(format!("registry: set foreign_keys ON: {e}")))?;

        Ok(conn)
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// The registry's write path. Derefs to [`Registry`] for reads.
#[derive(Debug)]
pub struct RegistryWriter {
    registry: Registry,
}

impl Deref for RegistryWriter {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.registry
    }
}

impl RegistryWriter {
    /// Insert every name not already present. Returns how many were added.
    pub fn seed_subjects(&self, names: &[String]) -> Result<usize, AppError> {
        let mut conn = self.open_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AppError::Storage(format!("registry: begin seed tx: {e}")))?;

        let mut added = 0;
        for name in names {
            added += tx
                .execute(
                    "INSERT OR IGNORE INTO subject (name, notes) VALUES (?1, '[]')",
                    params![name],
                )
                .map_err(|e| AppError::Storage(format!("registry: seed subject {name:?}: {e}")))?;
        }

        tx.commit()
            .map_err(|e| AppError::Storage(format!("registry: commit seed tx: {e}")))?;
        if added > 0 {
            info!(added, "subjects seeded");
        }
        Ok(added)
    }

    /// Run `f` inside one `IMMEDIATE` transaction and commit if it returns
    /// `Ok`. No other writer (prune, restore, seeding) can change the
    /// registry between the reads and the inserts `f` makes.
    ///
    /// Failing to open or lock the database is [`AppError::Storage`]; a
    /// failed final commit is [`AppError::Commit`]. An `Err` from `f` rolls
    /// everything back.
    pub fn locked<T>(
        &self,
        f: impl FnOnce(&WriteSession<'_>) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut conn = self.open_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AppError::Storage(format!("registry: begin write tx: {e}")))?;
        let session = WriteSession { tx };
        let out = f(&session)?;
        session
            .tx
            .commit()
            .map_err(|e| AppError::Commit(format!("commit tx: {e}")))?;
        Ok(out)
    }

    /// Insert `candidate` and link it to every ref in `links`, atomically.
    ///
    /// Any failure rolls the whole unit back and is reported as
    /// [`AppError::Commit`].
    pub fn commit(&self, candidate: &Candidate, links: &[EntityRef]) -> Result<EntityRef, AppError> {
        self.locked(|session| session.insert(candidate, links))
            .map_err(|e| match e {
                AppError::Storage(msg) => AppError::Commit(msg),
                other => other,
            })
    }
}

/// An open write transaction handed out by [`RegistryWriter::locked`].
/// Reads through it see the transaction's own inserts.
pub struct WriteSession<'conn> {
    tx: Transaction<'conn>,
}

impl WriteSession<'_> {
    /// `true` if `candidate` is already persisted.
    pub fn exists(&self, candidate: &Candidate) -> Result<bool, AppError> {
        let id = match candidate {
            Candidate::Episode(ep) => episode_id(&self.tx, ep)?,
            Candidate::Thread(t) => thread_id(&self.tx, &t.external_id)?,
        };
        Ok(id.is_some())
    }

    pub fn identities(&self, kind: EntityKind) -> Result<Vec<(i64, String)>, AppError> {
        identities(&self.tx, kind)
    }

    /// Insert `candidate` and its links. Errors are [`AppError::Commit`].
    pub fn insert(&self, candidate: &Candidate, links: &[EntityRef]) -> Result<EntityRef, AppError> {
        let tx = &self.tx;
        let entity = match candidate {
            Candidate::Episode(ep) => EntityRef {
                kind: EntityKind::Episode,
                id: insert_episode(tx, ep)
                    .map_err(|e| AppError::Commit(format!("insert episode {:?}: {e}", ep.url)))?,
            },
            Candidate::Thread(t) => EntityRef {
                kind: EntityKind::Thread,
                id: insert_thread(tx, t).map_err(|e| {
                    AppError::Commit(format!("insert thread {:?}: {e}", t.external_id))
                })?,
            },
        };

        for target in links {
            insert_link(tx, entity, *target)
                .map_err(|e| AppError::Commit(format!("link {entity:?} -> {target:?}: {e}")))?;
        }
        Ok(entity)
    }
}

/// Identity scan shared by plain reads and write sessions.
pub trait IdentityScan {
    fn identities(&self, kind: EntityKind) -> Result<Vec<(i64, String)>, AppError>;
}

impl IdentityScan for Registry {
    fn identities(&self, kind: EntityKind) -> Result<Vec<(i64, String)>, AppError> {
        Registry::identities(self, kind)
    }
}

impl IdentityScan for WriteSession<'_> {
    fn identities(&self, kind: EntityKind) -> Result<Vec<(i64, String)>, AppError> {
        WriteSession::identities(self, kind)
    }
}

// ── Row helpers ──────────────────────────────────────────────────────────────

fn collect_rows<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    what: &str,
) -> Result<Vec<T>, AppError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| AppError::Storage(format!("registry: prepare {what}: {e}")))?;
    let rows = stmt
        .query_map([], map)
        .map_err(|e| AppError::Storage(format!("registry: query {what}: {e}")))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| AppError::Storage(format!("registry: map {what} row: {e}")))?);
    }
    Ok(out)
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(text) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        id: row.get(0)?,
        name: row.get(1)?,
        notes: json_column(row, 2)?,
    })
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        fields: NewEpisode {
            url: row.get(1)?,
            title: row.get(2)?,
            published_date: timestamp_column(row, 3)?,
            episode_number: row.get(4)?,
            notes: json_column(row, 5)?,
            links: json_column(row, 6)?,
        },
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let created_at = timestamp_column(row, 4)?.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Null, "created_at is null".into())
    })?;
    Ok(Thread {
        id: row.get(0)?,
        fields: NewThread {
            external_id: row.get(1)?,
            title: row.get(2)?,
            permalink: row.get(3)?,
            created_at,
            raw_payload: json_column(row, 5)?,
        },
    })
}

fn identities(conn: &Connection, kind: EntityKind) -> Result<Vec<(i64, String)>, AppError> {
    let sql = format!(
        "SELECT id, {} FROM {} ORDER BY id",
        kind.identity_column(),
        kind.table()
    );
    collect_rows(conn, &sql, |row| Ok((row.get(0)?, row.get(1)?)), kind.as_str())
}

fn episode_id(conn: &Connection, ep: &NewEpisode) -> Result<Option<i64>, AppError> {
    let date = ep.published_date.as_ref().map(timestamp_text);
    conn.query_row(
        "SELECT id FROM episode
         WHERE (title = ?1 AND published_date IS ?2) OR url = ?3
         LIMIT 1",
        params![ep.title, date, ep.url],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| AppError::Storage(format!("registry: lookup episode {:?}: {e}", ep.title)))
}

fn thread_id(conn: &Connection, external_id: &str) -> Result<Option<i64>, AppError> {
    conn.query_row(
        "SELECT id FROM thread WHERE external_id = ?1",
        params![external_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| AppError::Storage(format!("registry: lookup thread {external_id:?}: {e}")))
}

fn insert_episode(tx: &Transaction<'_>, ep: &NewEpisode) -> rusqlite::Result<i64> {
    let notes = serde_json::to_string(&ep.notes)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let links = serde_json::to_string(&ep.links)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    tx.execute(
        "INSERT INTO episode (url, title, published_date, episode_number, notes, links)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            ep.url,
            ep.title,
            ep.published_date.as_ref().map(timestamp_text),
            ep.episode_number,
            notes,
            links,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_thread(tx: &Transaction<'_>, t: &NewThread) -> rusqlite::Result<i64> {
    let payload = serde_json::to_string(&t.raw_payload)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    tx.execute(
        "INSERT INTO thread (external_id, title, permalink, created_at, raw_payload)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![t.external_id, t.title, t.permalink, timestamp_text(&t.created_at), payload],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Append one link row. Existing rows are left alone.
fn insert_link(tx: &Transaction<'_>, a: EntityRef, b: EntityRef) -> rusqlite::Result<usize> {
    let table = LinkTable::between(a.kind, b.kind).ok_or_else(|| {
        rusqlite::Error::ToSqlConversionFailure(
            format!("no link table between {} and {}", a.kind, b.kind).into(),
        )
    })?;
    let (left_id, right_id) = table
        .order(a, b)
        .ok_or_else(|| rusqlite::Error::ToSqlConversionFailure("link endpoint mismatch".into()))?;
    let (left, right) = table.endpoints();
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({left}_id, {right}_id) VALUES (?1, ?2)",
        table.table()
    );
    tx.execute(&sql, params![left_id, right_id])
}
