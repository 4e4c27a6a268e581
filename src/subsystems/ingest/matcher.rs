//! Cross-reference matcher.
//!
//! Two identities overlap when one, lowercased, contains the other. Every
//! call scans all rows of the target kind; fine for a registry of a few
//! thousand rows, linear beyond that. Scans run against anything that
//! implements [`IdentityScan`], so the commit path can match inside its
//! write transaction.

use crate::error::AppError;
use crate::subsystems::registry::IdentityScan;
use crate::subsystems::registry::model::{EntityKind, EntityRef, Identified};

/// Ids of related rows, grouped by kind. The instance's own kind stays empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matches {
    pub subjects: Vec<i64>,
    pub episodes: Vec<i64>,
    pub threads: Vec<i64>,
}

impl Matches {
    pub fn get(&self, kind: EntityKind) -> &[i64] {
        match kind {
            EntityKind::Subject => &self.subjects,
            EntityKind::Episode => &self.episodes,
            EntityKind::Thread => &self.threads,
        }
    }

    fn get_mut(&mut self, kind: EntityKind) -> &mut Vec<i64> {
        match kind {
            EntityKind::Subject => &mut self.subjects,
            EntityKind::Episode => &mut self.episodes,
            EntityKind::Thread => &mut self.threads,
        }
    }

    pub fn total(&self) -> usize {
        self.subjects.len() + self.episodes.len() + self.threads.len()
    }

    /// Every match as an [`EntityRef`], subjects first.
    pub fn refs(&self) -> Vec<EntityRef> {
        EntityKind::ALL
            .into_iter()
            .flat_map(|kind| self.get(kind).iter().map(move |&id| EntityRef { kind, id }))
            .collect()
    }
}

/// Case-insensitive containment in either direction. Empty strings never
/// overlap anything.
pub fn overlaps(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim().to_lowercase(), b.trim().to_lowercase());
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// Ids of `target` rows whose identity overlaps the instance's identity.
pub fn matches<R, I>(registry: &R, instance: &I, target: EntityKind) -> Result<Vec<i64>, AppError>
where
    R: IdentityScan + ?Sized,
    I: Identified + ?Sized,
{
    if instance.kind() == target {
        return Ok(Vec::new());
    }
    let needle = instance.identity();
    Ok(registry
        .identities(target)?
        .into_iter()
        .filter(|(_, identity)| overlaps(needle, identity))
        .map(|(id, _)| id)
        .collect())
}

/// [`matches`] against both other kinds.
pub fn all_matches<R, I>(registry: &R, instance: &I) -> Result<Matches, AppError>
where
    R: IdentityScan + ?Sized,
    I: Identified + ?Sized,
{
    let mut out = Matches::default();
    for target in instance.kind().others() {
        *out.get_mut(target) = matches(registry, instance, target)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::registry::Registry;
    use crate::subsystems::registry::model::{Candidate, NewEpisode};
    use tempfile::TempDir;

    fn episode(url: &str, title: &str) -> Candidate {
        Candidate::Episode(NewEpisode {
            url: url.into(),
            title: title.into(),
            published_date: None,
            episode_number: None,
            notes: vec![],
            links: Default::default(),
        })
    }

    #[test]
    fn overlap_is_symmetric_and_case_insensitive() {
        let long = "Interview with Joe Rogan about AI";
        assert!(overlaps("Rogan", long));
        assert!(overlaps(long, "rogan"));
        assert!(overlaps("JOE ROGAN", long));
        assert!(!overlaps("Harris", long));
    }

    #[test]
    fn empty_never_overlaps() {
        assert!(!overlaps("", "anything"));
        assert!(!overlaps("anything", "  "));
        assert!(!overlaps("", ""));
    }

    #[test]
    fn matching_own_kind_is_empty() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        registry.writer().commit(&episode("u1", "Rogan"), &[]).unwrap();

        let candidate = episode("u2", "Rogan again");
        assert!(matches(&registry, &candidate, EntityKind::Episode).unwrap().is_empty());
    }

    #[test]
    fn all_matches_groups_by_kind() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        let writer = registry.writer();
        writer
            .seed_subjects(&["Joe Rogan".into(), "Sam Harris".into(), "Rogan".into()])
            .unwrap();

        let subjects = registry.subjects().unwrap();
        let found = all_matches(&registry, &episode("u", "Joe Rogan Experience #1")).unwrap();
        let names: Vec<&str> = found
            .subjects
            .iter()
            .map(|id| subjects.iter().find(|s| s.id == *id).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["Joe Rogan", "Rogan"]);
        assert!(found.episodes.is_empty());
        assert!(found.threads.is_empty());
        assert_eq!(found.total(), 2);
        assert!(found.refs().iter().all(|r| r.kind == EntityKind::Subject));
    }

    #[test]
    fn subject_instance_matches_episodes() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(&tmp.path().join("r.db")).unwrap();
        let writer = registry.writer();
        writer.seed_subjects(&["Rogan".into()]).unwrap();
        let ep = writer.commit(&episode("u", "Interview with Joe Rogan about AI"), &[]).unwrap();

        let subject = registry.subjects().unwrap().remove(0);
        assert_eq!(matches(&registry, &subject, EntityKind::Episode).unwrap(), vec![ep.id]);
    }
}
