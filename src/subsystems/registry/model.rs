//! Entity vocabulary: the three persisted kinds, their candidates, and the
//! link tables between them.
//!
//! Every kind-dependent decision (table name, identity column, which link
//! table joins two kinds) is a `match` over a closed enum, so adding a kind
//! is a compile error everywhere it matters.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Kinds ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Subject,
    Episode,
    Thread,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Subject, EntityKind::Episode, EntityKind::Thread];

    /// Kind name, also the snapshot key.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Subject => "subject",
            EntityKind::Episode => "episode",
            EntityKind::Thread => "thread",
        }
    }

    pub fn table(self) -> &'static str {
        self.as_str()
    }

    /// Column holding the string the matcher compares.
    pub fn identity_column(self) -> &'static str {
        match self {
            EntityKind::Subject => "name",
            EntityKind::Episode | EntityKind::Thread => "title",
        }
    }

    /// The two kinds an instance of `self` can be linked to.
    pub fn others(self) -> [EntityKind; 2] {
        match self {
            EntityKind::Subject => [EntityKind::Episode, EntityKind::Thread],
            EntityKind::Episode => [EntityKind::Subject, EntityKind::Thread],
            EntityKind::Thread => [EntityKind::Subject, EntityKind::Episode],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted row, addressed by kind and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

// ── Link tables ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTable {
    SubjectEpisode,
    SubjectThread,
    EpisodeThread,
}

impl LinkTable {
    pub const ALL: [LinkTable; 3] =
        [LinkTable::SubjectEpisode, LinkTable::SubjectThread, LinkTable::EpisodeThread];

    /// Link table joining two distinct kinds, in either order.
    pub fn between(a: EntityKind, b: EntityKind) -> Option<LinkTable> {
        use EntityKind::*;
        match (a, b) {
            (Subject, Episode) | (Episode, Subject) => Some(LinkTable::SubjectEpisode),
            (Subject, Thread) | (Thread, Subject) => Some(LinkTable::SubjectThread),
            (Episode, Thread) | (Thread, Episode) => Some(LinkTable::EpisodeThread),
            _ => None,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            LinkTable::SubjectEpisode => "subject_episode_link",
            LinkTable::SubjectThread => "subject_thread_link",
            LinkTable::EpisodeThread => "episode_thread_link",
        }
    }

    /// `(left, right)` endpoint kinds; column names are `{kind}_id`.
    pub fn endpoints(self) -> (EntityKind, EntityKind) {
        match self {
            LinkTable::SubjectEpisode => (EntityKind::Subject, EntityKind::Episode),
            LinkTable::SubjectThread => (EntityKind::Subject, EntityKind::Thread),
            LinkTable::EpisodeThread => (EntityKind::Episode, EntityKind::Thread),
        }
    }

    /// Order two refs as `(left_id, right_id)` for this table.
    pub fn order(self, a: EntityRef, b: EntityRef) -> Option<(i64, i64)> {
        let (left, right) = self.endpoints();
        if a.kind == left && b.kind == right {
            Some((a.id, b.id))
        } else if a.kind == right && b.kind == left {
            Some((b.id, a.id))
        } else {
            None
        }
    }
}

// ── Persisted entities ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    #[serde(flatten)]
    pub fields: NewEpisode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    #[serde(flatten)]
    pub fields: NewThread,
}

// ── Candidates ───────────────────────────────────────────────────────────────

/// A normalized episode before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEpisode {
    pub url: String,
    pub title: String,
    pub published_date: Option<DateTime<Utc>>,
    pub episode_number: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

/// A normalized social thread before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewThread {
    pub external_id: String,
    pub title: String,
    pub permalink: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_payload: Map<String, Value>,
}

impl NewThread {
    /// Build a thread, keeping only the scalar fields of `payload`.
    pub fn with_payload(
        external_id: impl Into<String>,
        title: impl Into<String>,
        permalink: impl Into<String>,
        created_at: DateTime<Utc>,
        payload: &Value,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            permalink: permalink.into(),
            created_at,
            raw_payload: scalar_fields(payload),
        }
    }
}

/// Queue item: one freshly produced entity, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Episode(NewEpisode),
    Thread(NewThread),
}

impl Candidate {
    pub fn kind(&self) -> EntityKind {
        match self {
            Candidate::Episode(_) => EntityKind::Episode,
            Candidate::Thread(_) => EntityKind::Thread,
        }
    }

    /// Short human label for log lines.
    pub fn label(&self) -> String {
        match self {
            Candidate::Episode(ep) => match ep.published_date {
                Some(date) => format!("{} ({})", ep.title, date.date_naive()),
                None => format!("{} ({})", ep.title, ep.url),
            },
            Candidate::Thread(t) => format!("{} [{}]", t.title, t.external_id),
        }
    }
}

impl From<NewEpisode> for Candidate {
    fn from(ep: NewEpisode) -> Self {
        Candidate::Episode(ep)
    }
}

impl From<NewThread> for Candidate {
    fn from(t: NewThread) -> Self {
        Candidate::Thread(t)
    }
}

// ── Identity ─────────────────────────────────────────────────────────────────

/// Anything the matcher can compare: a kind plus its name or title.
pub trait Identified {
    fn kind(&self) -> EntityKind;
    fn identity(&self) -> &str;
}

impl Identified for Subject {
    fn kind(&self) -> EntityKind {
        EntityKind::Subject
    }
    fn identity(&self) -> &str {
        &self.name
    }
}

impl Identified for Episode {
    fn kind(&self) -> EntityKind {
        EntityKind::Episode
    }
    fn identity(&self) -> &str {
        &self.fields.title
    }
}

impl Identified for Thread {
    fn kind(&self) -> EntityKind {
        EntityKind::Thread
    }
    fn identity(&self) -> &str {
        &self.fields.title
    }
}

impl Identified for Candidate {
    fn kind(&self) -> EntityKind {
        Candidate::kind(self)
    }
    fn identity(&self) -> &str {
        match self {
            Candidate::Episode(ep) => &ep.title,
            Candidate::Thread(t) => &t.title,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Keep only null/bool/number/string members of a JSON object.
pub fn scalar_fields(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !matches!(v, Value::Array(_) | Value::Object(_)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Map::new(),
    }
}

/// Canonical timestamp text stored in the registry. Dedup compares these
/// strings, so every write goes through here.
pub fn timestamp_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
