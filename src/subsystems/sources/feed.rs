//! RSS/Atom episode source.
//!
//! One cycle = one fetch of the feed document. Entries come out in feed
//! order (newest first for nearly every podcast feed), which lets the
//! producer's duplicate threshold stop a cycle once it reaches known
//! episodes.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tracing::{debug, info};

use super::{CandidateSource, SourceError};
use crate::subsystems::registry::model::{Candidate, EntityKind, NewEpisode};

pub struct FeedSource {
    client: reqwest::Client,
    url: String,
    label: String,
}

impl FeedSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        let url = url.into();
        let label = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.clone());
        Self { client, url, label }
    }

    async fn fetch(&self) -> Result<Vec<NewEpisode>, SourceError> {
        let resp = self.client.get(&self.url).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        let episodes = parse_feed(&bytes)?;
        info!(feed = %self.label, entries = episodes.len(), "feed fetched");
        Ok(episodes)
    }
}

impl CandidateSource for FeedSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Episode
    }

    fn poll(&mut self, limit: Option<usize>) -> BoxStream<'_, Result<Candidate, SourceError>> {
        let limit = limit.unwrap_or(usize::MAX);
        stream::once(self.fetch())
            .flat_map(move |res| {
                let items: Vec<Result<Candidate, SourceError>> = match res {
                    Ok(episodes) => episodes.into_iter().take(limit).map(|e| Ok(e.into())).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }
}

/// Parse a feed document into episode candidates, dropping entries that
/// have no url or no title.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<NewEpisode>, SourceError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| SourceError::Parse(e.to_string()))?;
    Ok(feed.entries.into_iter().filter_map(episode_from_entry).collect())
}

fn episode_from_entry(entry: feed_rs::model::Entry) -> Option<NewEpisode> {
    let mut links = entry.links.into_iter();
    let url = match links.next() {
        Some(link) => link.href,
        None if entry.id.starts_with("http") => entry.id.clone(),
        None => {
            debug!(id = %entry.id, "feed entry without url dropped");
            return None;
        }
    };

    let title = entry.title.map(|t| t.content.trim().to_string()).unwrap_or_default();
    if title.is_empty() {
        debug!(%url, "feed entry without title dropped");
        return None;
    }

    let body = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .unwrap_or_default();

    let links: BTreeMap<String, String> = links
        .filter(|l| l.href != url)
        .map(|l| {
            let label = l.title.or(l.rel).unwrap_or_else(|| l.href.clone());
            (label, l.href)
        })
        .collect();

    Some(NewEpisode {
        episode_number: episode_number(&title),
        published_date: entry.published.or(entry.updated),
        notes: split_notes(&body),
        links,
        url,
        title,
    })
}

/// Paragraphs of an entry description.
fn split_notes(body: &str) -> Vec<String> {
    body.replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Episode number from an `Episode 12` / `Ep. 12` / `Ep 12` / `#12` marker.
fn episode_number(title: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `title`.
    let lower = title.to_ascii_lowercase();
    for marker in ["episode", "ep.", "ep", "#"] {
        for (idx, _) in lower.match_indices(marker) {
            let word_start = marker == "#"
                || lower[..idx].chars().next_back().is_none_or(|c| !c.is_alphanumeric());
            if !word_start {
                continue;
            }
            let rest = lower[idx + marker.len()..].trim_start();
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                return Some(digits);
            }
        }
    }
    None
}
