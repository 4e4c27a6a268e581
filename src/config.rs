//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or the path given with `-f`), then applies
//! `CROSSREF_WORK_DIR` and `CROSSREF_LOG_LEVEL` env overrides. Relative
//! file paths in the TOML resolve against `work_dir`.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::AppError;
use crate::logger;

/// Episode feed producer configuration.
#[derive(Debug, Clone)]
pub struct EpisodesConfig {
    pub enabled: bool,
    /// RSS/Atom feed URL.
    pub feed_url: String,
    /// Idle delay between polling cycles.
    pub poll_interval: Duration,
    /// Duplicates tolerated per cycle. 0 = unlimited.
    pub max_dupes: usize,
    /// Episodes committed at startup before the producer starts. 0 = skip.
    pub backfill: usize,
    pub queue_capacity: usize,
}

/// Subreddit thread producer configuration.
#[derive(Debug, Clone)]
pub struct ThreadsConfig {
    pub enabled: bool,
    pub subreddit: String,
    pub user_agent: String,
    /// Idle delay after a stream cycle ends.
    pub poll_interval: Duration,
    /// Delay between listing requests inside one live-stream cycle.
    pub listing_interval: Duration,
    pub max_dupes: usize,
    pub queue_capacity: usize,
}

/// Snapshot scheduler configuration.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub interval: Duration,
    /// Snapshot file (already resolved against `work_dir`).
    pub path: PathBuf,
    /// Rotated copies of previous snapshots to keep.
    pub retain: usize,
    pub restore_on_start: bool,
}

/// Row-pruning cutoffs. Rows with `id >= cutoff` are deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneConfig {
    pub on_start: bool,
    pub episodes_from_id: Option<i64>,
    pub threads_from_id: Option<i64>,
}

/// Fully-resolved pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    /// SQLite registry file.
    pub database: PathBuf,
    /// Delimited list of subject names. Relative paths are taken from the
    /// directory holding the config file, so a checked-in list ships with it.
    pub seed_file: PathBuf,
    pub episodes: EpisodesConfig,
    pub threads: ThreadsConfig,
    pub backup: BackupConfig,
    pub prune: PruneConfig,
}

/// Raw TOML shape, the `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    pipeline: RawPipeline,
    #[serde(default)]
    subjects: RawSubjects,
    #[serde(default)]
    episodes: RawEpisodes,
    #[serde(default)]
    threads: RawThreads,
    #[serde(default)]
    backup: RawBackup,
    #[serde(default)]
    prune: RawPrune,
}

#[derive(Deserialize)]
struct RawPipeline {
    name: String,
    work_dir: String,
    log_level: String,
    #[serde(default = "default_database")]
    database: String,
}

#[derive(Deserialize)]
struct RawSubjects {
    #[serde(default = "default_seed_file")]
    seed_file: String,
}

#[derive(Deserialize)]
struct RawEpisodes {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    feed_url: String,
    #[serde(default = "default_episode_poll_secs")]
    poll_secs: u64,
    #[serde(default)]
    max_dupes: usize,
    #[serde(default)]
    backfill: usize,
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
}

#[derive(Deserialize)]
struct RawThreads {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    subreddit: String,
    #[serde(default = "default_user_agent")]
    user_agent: String,
    #[serde(default = "default_thread_poll_secs")]
    poll_secs: u64,
    #[serde(default = "default_listing_secs")]
    listing_secs: u64,
    #[serde(default)]
    max_dupes: usize,
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
}

#[derive(Deserialize)]
struct RawBackup {
    #[serde(default = "default_backup_interval_secs")]
    interval_secs: u64,
    #[serde(default = "default_backup_path")]
    path: String,
    #[serde(default = "default_backup_retain")]
    retain: usize,
    #[serde(default)]
    restore_on_start: bool,
}

#[derive(Deserialize, Default)]
struct RawPrune {
    #[serde(default)]
    on_start: bool,
    episodes_from_id: Option<i64>,
    threads_from_id: Option<i64>,
}

impl Default for RawSubjects {
    fn default() -> Self {
        Self { seed_file: default_seed_file() }
    }
}

impl Default for RawEpisodes {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_url: String::new(),
            poll_secs: default_episode_poll_secs(),
            max_dupes: 0,
            backfill: 0,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for RawThreads {
    fn default() -> Self {
        Self {
            enabled: true,
            subreddit: String::new(),
            user_agent: default_user_agent(),
            poll_secs: default_thread_poll_secs(),
            listing_secs: default_listing_secs(),
            max_dupes: 0,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for RawBackup {
    fn default() -> Self {
        Self {
            interval_secs: default_backup_interval_secs(),
            path: default_backup_path(),
            retain: default_backup_retain(),
            restore_on_start: false,
        }
    }
}

fn default_database() -> String { "registry.db".to_string() }
fn default_seed_file() -> String { "subjects.txt".to_string() }
fn default_episode_poll_secs() -> u64 { 60 * 10 }
fn default_thread_poll_secs() -> u64 { 60 * 10 }
fn default_listing_secs() -> u64 { 60 }
fn default_queue_capacity() -> usize { 64 }
fn default_user_agent() -> String { format!("crossref-bot/{}", env!("CARGO_PKG_VERSION")) }
fn default_backup_interval_secs() -> u64 { 60 * 60 * 24 }
fn default_backup_path() -> String { "backups/registry_backup.json".to_string() }
fn default_backup_retain() -> usize { 7 }

fn default_true() -> bool {
    true
}

/// Load config from `path` (default `config/default.toml`), then apply
/// env-var overrides.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let work_dir_override = env::var("CROSSREF_WORK_DIR").ok();
    let log_level_override = env::var("CROSSREF_LOG_LEVEL").ok();
    load_from(
        Path::new(path.unwrap_or("config/default.toml")),
        work_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader. Accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let p = parsed.pipeline;

    let work_dir = expand_home(work_dir_override.unwrap_or(&p.work_dir));
    let config_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let log_level = log_level_override.unwrap_or(&p.log_level).to_string();
    logger::parse_level(&log_level)
        .map_err(|e| AppError::Config(format!("pipeline.log_level: {e}")))?;

    let episodes = parsed.episodes;
    if episodes.enabled && episodes.feed_url.trim().is_empty() {
        return Err(AppError::Config(
            "episodes.feed_url is required when episodes are enabled".into(),
        ));
    }
    let threads = parsed.threads;
    if threads.enabled && threads.subreddit.trim().is_empty() {
        return Err(AppError::Config(
            "threads.subreddit is required when threads are enabled".into(),
        ));
    }
    if episodes.queue_capacity == 0 || threads.queue_capacity == 0 {
        return Err(AppError::Config("queue_capacity must be > 0".into()));
    }
    if parsed.backup.interval_secs == 0 {
        return Err(AppError::Config("backup.interval_secs must be > 0".into()));
    }

    Ok(Config {
        name: p.name,
        database: resolve(&work_dir, &p.database),
        seed_file: resolve(config_dir, &parsed.subjects.seed_file),
        log_level,
        episodes: EpisodesConfig {
            enabled: episodes.enabled,
            feed_url: episodes.feed_url,
            poll_interval: Duration::from_secs(episodes.poll_secs),
            max_dupes: episodes.max_dupes,
            backfill: episodes.backfill,
            queue_capacity: episodes.queue_capacity,
        },
        threads: ThreadsConfig {
            enabled: threads.enabled,
            subreddit: threads.subreddit,
            user_agent: threads.user_agent,
            poll_interval: Duration::from_secs(threads.poll_secs),
            listing_interval: Duration::from_secs(threads.listing_secs),
            max_dupes: threads.max_dupes,
            queue_capacity: threads.queue_capacity,
        },
        backup: BackupConfig {
            interval: Duration::from_secs(parsed.backup.interval_secs),
            path: resolve(&work_dir, &parsed.backup.path),
            retain: parsed.backup.retain,
            restore_on_start: parsed.backup.restore_on_start,
        },
        prune: PruneConfig {
            on_start: parsed.prune.on_start,
            episodes_from_id: parsed.prune.episodes_from_id,
            threads_from_id: parsed.prune.threads_from_id,
        },
        work_dir,
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn resolve(work_dir: &Path, path: &str) -> PathBuf {
    let path = expand_home(path);
    if path.is_absolute() {
        path
    } else {
        work_dir.join(path)
    }
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Safe `Config` for tests: sources disabled, short intervals, everything
/// under `work_dir`.
impl Config {
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            name: "test".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            database: work_dir.join("registry.db"),
            seed_file: work_dir.join("subjects.txt"),
            episodes: EpisodesConfig {
                enabled: false,
                feed_url: String::new(),
                poll_interval: Duration::from_secs(60),
                max_dupes: 0,
                backfill: 0,
                queue_capacity: 16,
            },
            threads: ThreadsConfig {
                enabled: false,
                subreddit: String::new(),
                user_agent: default_user_agent(),
                poll_interval: Duration::from_secs(60),
                listing_interval: Duration::from_secs(30),
                max_dupes: 0,
                queue_capacity: 16,
            },
            backup: BackupConfig {
                interval: Duration::from_secs(3600),
                path: work_dir.join("backups").join("registry_backup.json"),
                retain: 2,
                restore_on_start: false,
            },
            prune: PruneConfig::default(),
        }
    }
}
