//! Deduplication filter.
//!
//! Exact, case-sensitive identity comparison against persisted rows. The
//! queries themselves live on [`Registry`]; this module picks the right one
//! for a candidate's kind.

use crate::error::AppError;
use crate::subsystems::registry::Registry;
use crate::subsystems::registry::model::Candidate;

/// `true` if `candidate` is already persisted.
pub fn exists(registry: &Registry, candidate: &Candidate) -> Result<bool, AppError> {
    match candidate {
        Candidate::Episode(ep) => registry.episode_exists(ep),
        Candidate::Thread(t) => registry.thread_exists(t),
    }
}

/// [`exists`] on the blocking pool.
pub async fn exists_async(registry: &Registry, candidate: &Candidate) -> Result<bool, AppError> {
    let registry = registry.clone();
    let candidate = candidate.clone();
    super::blocking(move || exists(&registry, &candidate)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::registry::model::{NewEpisode, NewThread};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn ep(url: &str, title: &str, day: Option<u32>) -> Candidate {
        Candidate::Episode(NewEpisode {
            url: url.into(),
            title: title.into(),
            published_date: day.map(|d| Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()),
            episode_number: None,
            notes: vec![],
            links: Default::default(),
        })
    }

    fn thread(id: &str, title: &str) -> Candidate {
        Candidate::Thread(NewThread::with_payload(
            id,
            title,
            "https://x",
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            &json!({}),
        ))
    }

    #[test]
    fn absent_candidates_do_not_exist() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        assert!(!exists(&registry, &ep("u", "t", Some(1))).unwrap());
        assert!(!exists(&registry, &thread("abc", "t")).unwrap());
    }

    #[test]
    fn null_dates_compare_equal() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        registry.writer().commit(&ep("u1", "Undated", None), &[]).unwrap();

        assert!(exists(&registry, &ep("u2", "Undated", None)).unwrap());
        assert!(!exists(&registry, &ep("u2", "Undated", Some(4))).unwrap());
    }

    #[test]
    fn thread_identity_is_external_id() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        registry.writer().commit(&thread("abc", "Title"), &[]).unwrap();

        assert!(exists(&registry, &thread("abc", "Different title")).unwrap());
        assert!(!exists(&registry, &thread("ABC", "Title")).unwrap());
    }

    #[tokio::test]
    async fn async_check_matches_blocking_check() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        let candidate = ep("u", "t", Some(2));
        registry.writer().commit(&candidate, &[]).unwrap();
        assert!(exists_async(&registry, &candidate).await.unwrap());
    }
}
