//! Subreddit "new posts" live stream over the public JSON listing.
//!
//! A cycle never ends on its own: the stream re-polls the listing every
//! `listing_interval` and yields posts this source has not yielded before,
//! oldest first. The producer ends the cycle (duplicate threshold, source
//! error, shutdown) by dropping the stream.
//!
//! The HTTP request sits behind [`ListingFetch`]; the cursor only deals in
//! parsed listings.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::DateTime;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{CandidateSource, SourceError};
use crate::subsystems::registry::model::{Candidate, EntityKind, NewThread};

const REDDIT_BASE: &str = "https://www.reddit.com";
const LISTING_LIMIT: u32 = 100;
/// Ids remembered for the "not yet yielded" check.
const SEEN_CAP: usize = 2048;

#[derive(Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Deserialize)]
struct ListingChild {
    data: Value,
}

/// One read of a subreddit's newest posts, oldest first.
pub trait ListingFetch: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<NewThread>, SourceError>>;
}

/// `GET /r/{name}/new.json` through the shared client.
struct HttpListing {
    client: reqwest::Client,
    url: String,
}

impl ListingFetch for HttpListing {
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<NewThread>, SourceError>> {
        Box::pin(async move {
            let resp = self.client.get(&self.url).send().await?.error_for_status()?;
            let bytes = resp.bytes().await?;
            parse_listing(&bytes)
        })
    }
}

pub struct SubredditSource {
    listing: Box<dyn ListingFetch>,
    label: String,
    listing_interval: Duration,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl SubredditSource {
    pub fn new(client: reqwest::Client, subreddit: &str, listing_interval: Duration) -> Self {
        let name = subreddit_name(subreddit);
        let listing = HttpListing {
            client,
            url: format!("{REDDIT_BASE}/r/{name}/new.json?limit={LISTING_LIMIT}"),
        };
        Self::with_fetcher(subreddit, Box::new(listing), listing_interval)
    }

    /// Source over any listing reader, e.g. a mirror or a recorded session.
    pub fn with_fetcher(
        subreddit: &str,
        listing: Box<dyn ListingFetch>,
        listing_interval: Duration,
    ) -> Self {
        Self {
            listing,
            label: format!("r/{}", subreddit_name(subreddit)),
            listing_interval,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    async fn fetch_unseen(&self) -> Result<Vec<NewThread>, SourceError> {
        let threads = self.listing.fetch().await?;
        let total = threads.len();
        let unseen: Vec<NewThread> = threads
            .into_iter()
            .filter(|t| !self.seen.contains(&t.external_id))
            .collect();
        debug!(subreddit = %self.label, total, unseen = unseen.len(), "listing fetched");
        Ok(unseen)
    }

    fn remember(&mut self, external_id: &str) {
        if self.seen.insert(external_id.to_string()) {
            self.seen_order.push_back(external_id.to_string());
            if self.seen_order.len() > SEEN_CAP {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}

struct Cursor<'a> {
    source: &'a mut SubredditSource,
    pending: VecDeque<NewThread>,
    first: bool,
}

impl CandidateSource for SubredditSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Thread
    }

    fn poll(&mut self, limit: Option<usize>) -> BoxStream<'_, Result<Candidate, SourceError>> {
        let cursor = Cursor { source: self, pending: VecDeque::new(), first: true };
        stream::unfold(cursor, |mut c| async move {
            loop {
                if let Some(thread) = c.pending.pop_front() {
                    // Only yielded posts count as seen; posts left pending
                    // when the cycle is dropped come back next cycle.
                    c.source.remember(&thread.external_id);
                    return Some((Ok(thread.into()), c));
                }
                if !c.first {
                    tokio::time::sleep(c.source.listing_interval).await;
                }
                c.first = false;
                match c.source.fetch_unseen().await {
                    Ok(threads) => c.pending.extend(threads),
                    Err(e) => return Some((Err(e), c)),
                }
            }
        })
        .take(limit.unwrap_or(usize::MAX))
        .boxed()
    }
}

fn subreddit_name(subreddit: &str) -> &str {
    subreddit.trim().trim_start_matches("r/")
}

/// Parse a listing document into threads, oldest first.
pub fn parse_listing(bytes: &[u8]) -> Result<Vec<NewThread>, SourceError> {
    let listing: Listing =
        serde_json::from_slice(bytes).map_err(|e| SourceError::Parse(e.to_string()))?;
    let mut threads: Vec<NewThread> =
        listing.data.children.iter().filter_map(|c| thread_from_post(&c.data)).collect();
    threads.sort_by_key(|t| t.created_at);
    Ok(threads)
}

fn thread_from_post(post: &Value) -> Option<NewThread> {
    let id = post.get("id")?.as_str()?;
    let title = post.get("title")?.as_str()?;
    let permalink = post.get("permalink")?.as_str()?;
    let created = post.get("created_utc")?.as_f64()?;
    let created_at = DateTime::from_timestamp(created as i64, 0)?;
    Some(NewThread::with_payload(
        id,
        title,
        format!("{REDDIT_BASE}{permalink}"),
        created_at,
        post,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Serves scripted listings in order, then repeats the last one.
    struct PagedListing {
        pages: Mutex<VecDeque<Result<Vec<NewThread>, u16>>>,
        fetches: Arc<AtomicUsize>,
    }

    impl PagedListing {
        fn new(pages: Vec<Result<Vec<NewThread>, u16>>) -> (Box<Self>, Arc<AtomicUsize>) {
            let fetches = Arc::new(AtomicUsize::new(0));
            let listing = Self { pages: Mutex::new(pages.into()), fetches: fetches.clone() };
            (Box::new(listing), fetches)
        }
    }

    impl ListingFetch for PagedListing {
        fn fetch(&self) -> BoxFuture<'_, Result<Vec<NewThread>, SourceError>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().unwrap();
            let page = if pages.len() > 1 {
                pages.pop_front().unwrap()
            } else {
                pages.front().cloned().unwrap_or(Ok(Vec::new()))
            };
            Box::pin(async move { page.map_err(SourceError::Status) })
        }
    }

    fn post(id: &str, created: i64) -> NewThread {
        NewThread::with_payload(
            id,
            format!("post {id}"),
            format!("{REDDIT_BASE}/r/test/comments/{id}/"),
            Utc.timestamp_opt(created, 0).unwrap(),
            &json!({"id": id}),
        )
    }

    fn external_id(item: Option<Result<Candidate, SourceError>>) -> String {
        match item {
            Some(Ok(Candidate::Thread(t))) => t.external_id,
            other => panic!("expected a thread, got {other:?}"),
        }
    }

    const LISTING: &str = r#"{
      "kind": "Listing",
      "data": {
        "after": "t3_b",
        "children": [
          {"kind": "t3", "data": {
            "id": "b", "title": "Newer post", "permalink": "/r/test/comments/b/newer/",
            "created_utc": 1704200000.0, "score": 5, "over_18": false,
            "preview": {"images": []}
          }},
          {"kind": "t3", "data": {
            "id": "a", "title": "Older post", "permalink": "/r/test/comments/a/older/",
            "created_utc": 1704100000.0, "score": 1
          }},
          {"kind": "t3", "data": {"id": "c", "permalink": "/r/test/comments/c/"}}
        ]
      }
    }"#;

    #[test]
    fn listing_parses_oldest_first() {
        let threads = parse_listing(LISTING.as_bytes()).unwrap();
        assert_eq!(threads.len(), 2, "post without title/created is dropped");
        assert_eq!(threads[0].external_id, "a");
        assert_eq!(threads[1].external_id, "b");
        assert_eq!(threads[1].permalink, "https://www.reddit.com/r/test/comments/b/newer/");
        assert_eq!(threads[0].created_at, Utc.timestamp_opt(1704100000, 0).unwrap());
    }

    #[test]
    fn payload_keeps_scalars() {
        let threads = parse_listing(LISTING.as_bytes()).unwrap();
        let newer = &threads[1].raw_payload;
        assert!(newer.contains_key("score"));
        assert!(newer.contains_key("over_18"));
        assert!(!newer.contains_key("preview"));
    }

    #[test]
    fn bad_listing_is_parse_error() {
        assert!(matches!(parse_listing(b"{\"data\": 3}"), Err(SourceError::Parse(_))));
    }

    #[tokio::test]
    async fn pending_posts_come_back_next_cycle() {
        tokio::time::pause();
        let (a, b, c, d) = (post("a", 1), post("b", 2), post("c", 3), post("d", 4));
        let (listing, fetches) = PagedListing::new(vec![
            Ok(vec![a.clone(), b.clone(), c.clone()]),
            Ok(vec![a.clone(), b.clone(), c.clone()]),
            Ok(vec![a, b, c, d]),
        ]);
        let mut src = SubredditSource::with_fetcher("r/test", listing, Duration::from_secs(60));

        {
            let mut cycle = src.poll(None);
            assert_eq!(external_id(cycle.next().await), "a");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let start = Instant::now();
        let mut cycle = src.poll(None);
        assert_eq!(external_id(cycle.next().await), "b");
        assert_eq!(external_id(cycle.next().await), "c");
        assert_eq!(start.elapsed(), Duration::ZERO, "first fetch of a cycle is immediate");
        assert_eq!(external_id(cycle.next().await), "d");
        assert!(start.elapsed() >= Duration::from_secs(60));
        drop(cycle);
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_error_is_yielded_and_stream_retries() {
        tokio::time::pause();
        let (listing, fetches) = PagedListing::new(vec![Err(503), Ok(vec![post("a", 1)])]);
        let mut src = SubredditSource::with_fetcher("test", listing, Duration::from_secs(5));
        assert_eq!(src.label(), "r/test");

        let mut cycle = src.poll(Some(2));
        assert!(matches!(cycle.next().await, Some(Err(SourceError::Status(503)))));
        assert_eq!(external_id(cycle.next().await), "a");
        assert!(cycle.next().await.is_none(), "limit reached");
        drop(cycle);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn seen_set_is_bounded() {
        let client = reqwest::Client::new();
        let mut src = SubredditSource::new(client, "r/test", Duration::from_secs(1));
        assert_eq!(src.label(), "r/test");
        for i in 0..SEEN_CAP + 10 {
            src.remember(&format!("id{i}"));
        }
        assert_eq!(src.seen.len(), SEEN_CAP);
        assert!(!src.seen.contains("id0"));
        assert!(src.seen.contains(&format!("id{}", SEEN_CAP + 9)));
    }
}
