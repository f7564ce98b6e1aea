//! Dual-source story fetching.
//!
//! A fetch races the network against the cached catalog. Whichever answers
//! first is shown straight away; the network result, whenever it arrives,
//! replaces it and is written back to the cache. [`TwoPhaseFetch`] makes
//! that contract explicit: an `immediate` result plus a `network` phase that
//! resolves to the authoritative catalog, or `None` if the network failed.

use crate::persist::{keys, read_json, write_json, KeyValueStore};
use crate::story::{extract_triggers, transform, KnownTriggers, RawStoryData, Story};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, Either};
use mindmap_api::MindmapClient;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Progress of the network leg of the most recent fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    InProgress,
    Done,
    Failed,
}

/// Anything that can produce the story catalog over the network.
#[async_trait]
pub trait StorySource: Send + Sync {
    async fn fetch_stories(&self) -> Result<RawStoryData, mindmap_api::Error>;
}

#[async_trait]
impl StorySource for MindmapClient {
    async fn fetch_stories(&self) -> Result<RawStoryData, mindmap_api::Error> {
        MindmapClient::fetch_stories(self).await
    }
}

/// Where a catalog came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Network,
    Cache,
}

/// A catalog tagged with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced {
    pub source: Source,
    pub data: RawStoryData,
}

/// Result of racing network against cache.
pub struct TwoPhaseFetch {
    /// The first usable catalog: the network if it won the race, otherwise
    /// the cache (empty if nothing was cached).
    pub immediate: Sourced,
    /// The network catalog once it arrives, or `None` if the request failed.
    /// Always resolves to the network data if the network won the race.
    pub network: BoxFuture<'static, Option<RawStoryData>>,
}

/// Races a [`StorySource`] against the persisted catalog.
pub struct DualSourceFetcher {
    source: Arc<dyn StorySource>,
    store: Arc<dyn KeyValueStore>,
    status: Arc<watch::Sender<FetchStatus>>,
}

impl DualSourceFetcher {
    pub fn new(source: Arc<dyn StorySource>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            source,
            store,
            status: Arc::new(watch::Sender::new(FetchStatus::InProgress)),
        }
    }

    pub fn status(&self) -> FetchStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<FetchStatus> {
        self.status.subscribe()
    }

    /// Start both legs and wait for the first usable result.
    pub async fn begin(&self) -> TwoPhaseFetch {
        self.status.send_replace(FetchStatus::InProgress);

        let source = self.source.clone();
        let status = self.status.clone();
        let network = Box::pin(async move {
            let result = source.fetch_stories().await;
            match &result {
                Ok(data) => {
                    debug!(stories = data.len(), "Network fetch succeeded");
                    status.send_replace(FetchStatus::Done);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to fetch stories from network");
                    status.send_replace(FetchStatus::Failed);
                }
            }
            result
        });
        let cache = Box::pin(read_cached(self.store.clone()));

        // The network leg is polled first so it wins a tie.
        match future::select(network, cache).await {
            Either::Left((Ok(data), _)) => TwoPhaseFetch {
                immediate: Sourced {
                    source: Source::Network,
                    data: data.clone(),
                },
                network: Box::pin(future::ready(Some(data))),
            },
            Either::Left((Err(_), cache)) => TwoPhaseFetch {
                immediate: Sourced {
                    source: Source::Cache,
                    data: cache.await,
                },
                network: Box::pin(future::ready(None)),
            },
            Either::Right((data, network)) => TwoPhaseFetch {
                immediate: Sourced {
                    source: Source::Cache,
                    data,
                },
                network: Box::pin(async move { network.await.ok() }),
            },
        }
    }
}

async fn read_cached(store: Arc<dyn KeyValueStore>) -> RawStoryData {
    match read_json::<RawStoryData>(store.as_ref(), keys::STORIES).await {
        Ok(data) => data.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Failed to read cached stories");
            RawStoryData::new()
        }
    }
}

// ============================================================================
// Story feed
// ============================================================================

/// Story data and everything derived from it.
pub struct StoryFeed {
    fetcher: DualSourceFetcher,
    store: Arc<dyn KeyValueStore>,
    raw: watch::Sender<RawStoryData>,
    stories: watch::Sender<Vec<Story>>,
    triggers: watch::Sender<KnownTriggers>,
    fetch_needed: watch::Sender<bool>,
}

impl StoryFeed {
    /// Create a feed. A fetch is needed from the start.
    pub fn new(source: Arc<dyn StorySource>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            fetcher: DualSourceFetcher::new(source, store.clone()),
            store,
            raw: watch::Sender::new(RawStoryData::new()),
            stories: watch::Sender::new(Vec::new()),
            triggers: watch::Sender::new(KnownTriggers::new()),
            fetch_needed: watch::Sender::new(true),
        }
    }

    pub fn stories(&self) -> Vec<Story> {
        self.stories.borrow().clone()
    }

    pub fn known_triggers(&self) -> KnownTriggers {
        self.triggers.borrow().clone()
    }

    pub fn raw(&self) -> RawStoryData {
        self.raw.borrow().clone()
    }

    pub fn status(&self) -> FetchStatus {
        self.fetcher.status()
    }

    pub fn is_fetch_needed(&self) -> bool {
        *self.fetch_needed.borrow()
    }

    pub fn subscribe_stories(&self) -> watch::Receiver<Vec<Story>> {
        self.stories.subscribe()
    }

    pub fn subscribe_triggers(&self) -> watch::Receiver<KnownTriggers> {
        self.triggers.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<FetchStatus> {
        self.fetcher.subscribe_status()
    }

    pub fn subscribe_fetch_needed(&self) -> watch::Receiver<bool> {
        self.fetch_needed.subscribe()
    }

    /// Ask for a fetch. Coalesces with one already pending or in flight.
    pub fn request_refresh(&self) {
        let raised = self.fetch_needed.send_if_modified(|needed| {
            let was = *needed;
            *needed = true;
            !was
        });
        if raised {
            debug!("Story refresh requested");
        }
    }

    /// Replace the raw catalog and re-derive the story list.
    ///
    /// Derived state is left untouched, and no change is signalled, when the
    /// new list is equal to the current one. Returns whether it changed.
    pub fn apply_raw(&self, raw: RawStoryData) -> bool {
        let stories = transform(&raw);
        self.raw.send_replace(raw);

        let changed = self.stories.send_if_modified(|current| {
            if *current == stories {
                false
            } else {
                *current = stories;
                true
            }
        });

        if changed {
            let triggers = extract_triggers(&self.stories.borrow());
            self.triggers.send_replace(triggers);
        } else {
            debug!("Story list unchanged");
        }
        changed
    }

    /// Run one fetch cycle to completion.
    ///
    /// The fetch-needed flag is cleared however the cycle ends.
    pub async fn run_fetch(&self) {
        let TwoPhaseFetch { immediate, network } = self.fetcher.begin().await;
        debug!(source = ?immediate.source, stories = immediate.data.len(), "Showing initial stories");
        self.apply_raw(immediate.data);

        if let Some(data) = network.await {
            if let Err(e) = write_json(self.store.as_ref(), keys::STORIES, &data).await {
                warn!(error = %e, "Failed to cache fetched stories");
            }
            self.apply_raw(data);
            info!(stories = self.stories.borrow().len(), "Stories refreshed from network");
        }

        self.fetch_needed.send_replace(false);
    }

    /// Fetch whenever the fetch-needed flag is raised.
    pub async fn run(self: Arc<Self>) {
        let mut needed = self.fetch_needed.subscribe();
        loop {
            let pending = *needed.borrow_and_update();
            if pending {
                self.run_fetch().await;
            }
            if needed.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::testing::{catalog, MockStorySource};
    use serde_json::json;

    fn one_story(id: &str, title: &str) -> RawStoryData {
        catalog(json!({ id: {"id": id, "lat": 0, "lon": 0, "title": title, "trigger_warnings": []} }))
    }

    fn cached(data: &RawStoryData) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_values([(
            keys::STORIES,
            serde_json::to_string(data).unwrap(),
        )]))
    }

    #[tokio::test]
    async fn test_network_wins_tie_and_is_persisted() {
        let source = Arc::new(MockStorySource::new());
        source.respond(one_story("1", "Fresh"));
        source.respond(one_story("1", "Fresh"));
        let store = cached(&one_story("2", "Stale"));
        let feed = StoryFeed::new(source.clone(), store.clone());

        let phase = feed.fetcher.begin().await;
        assert_eq!(phase.immediate.source, Source::Network);
        assert_eq!(phase.network.await, Some(one_story("1", "Fresh")));

        feed.run_fetch().await;
        assert_eq!(feed.stories()[0].title, "Fresh");
        assert_eq!(feed.status(), FetchStatus::Done);
        assert!(store.raw(keys::STORIES).unwrap().contains("Fresh"));
    }

    #[tokio::test]
    async fn test_cache_shown_first_then_network_replaces() {
        let source = Arc::new(MockStorySource::new());
        let gate = source.gate();
        let store = cached(&one_story("2", "Cached"));
        let feed = Arc::new(StoryFeed::new(source.clone(), store.clone()));

        let mut stories = feed.subscribe_stories();
        let task = tokio::spawn(feed.clone().run_fetch_owned());

        stories.changed().await.unwrap();
        assert_eq!(feed.stories()[0].title, "Cached");
        assert_eq!(feed.status(), FetchStatus::InProgress);
        assert!(feed.is_fetch_needed());

        gate.succeed(one_story("1", "Fresh"));
        task.await.unwrap();

        assert_eq!(feed.stories().len(), 1);
        assert_eq!(feed.stories()[0].title, "Fresh");
        assert_eq!(feed.status(), FetchStatus::Done);
        assert!(!feed.is_fetch_needed());
        assert!(store.raw(keys::STORIES).unwrap().contains("Fresh"));
    }

    #[tokio::test]
    async fn test_network_failure_falls_back_to_cache() {
        let source = Arc::new(MockStorySource::new());
        source.fail("connection refused");
        let store = cached(&one_story("2", "Cached"));
        let feed = StoryFeed::new(source, store.clone());

        feed.run_fetch().await;

        let stories = feed.stories();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].id, "2");
        assert_eq!(feed.status(), FetchStatus::Failed);
        assert!(!feed.is_fetch_needed());
        assert!(store.raw(keys::STORIES).unwrap().contains("Cached"));
    }

    #[tokio::test]
    async fn test_late_network_failure_keeps_cache() {
        let source = Arc::new(MockStorySource::new());
        let gate = source.gate();
        let feed = Arc::new(StoryFeed::new(source, cached(&one_story("2", "Cached"))));

        let task = tokio::spawn(feed.clone().run_fetch_owned());
        let mut stories = feed.subscribe_stories();
        let _ = stories.wait_for(|s| !s.is_empty()).await;

        gate.fail("timed out");
        task.await.unwrap();

        assert_eq!(feed.stories()[0].title, "Cached");
        assert_eq!(feed.status(), FetchStatus::Failed);
        assert!(!feed.is_fetch_needed());
    }

    #[tokio::test]
    async fn test_empty_cache_and_failed_network() {
        let source = Arc::new(MockStorySource::new());
        source.fail("offline");
        let feed = StoryFeed::new(source, Arc::new(MemoryStore::new()));

        feed.run_fetch().await;
        assert!(feed.stories().is_empty());
        assert_eq!(feed.status(), FetchStatus::Failed);
    }

    #[tokio::test]
    async fn test_status_resets_each_fetch() {
        let source = Arc::new(MockStorySource::new());
        source.fail("offline");
        let gate_source = source.clone();
        let feed = Arc::new(StoryFeed::new(source, Arc::new(MemoryStore::new())));

        feed.run_fetch().await;
        assert_eq!(feed.status(), FetchStatus::Failed);

        let gate = gate_source.gate();
        let task = tokio::spawn(feed.clone().run_fetch_owned());
        let mut status = feed.subscribe_status();
        let _ = status.wait_for(|s| *s == FetchStatus::InProgress).await;
        gate.succeed(one_story("1", "A"));
        task.await.unwrap();
        assert_eq!(feed.status(), FetchStatus::Done);
    }

    #[tokio::test]
    async fn test_equal_data_does_not_signal_change() {
        let feed = StoryFeed::new(
            Arc::new(MockStorySource::new()),
            Arc::new(MemoryStore::new()),
        );
        let data = catalog(json!({
            "1": {"lat": 0, "lon": 0, "trigger_warnings": [{"name": "grief", "text": "Loss"}]}
        }));

        assert!(feed.apply_raw(data.clone()));
        let mut triggers = feed.subscribe_triggers();
        let mut stories = feed.subscribe_stories();

        assert!(!feed.apply_raw(data));
        assert!(!triggers.has_changed().unwrap());
        assert!(!stories.has_changed().unwrap());
        assert_eq!(feed.known_triggers()["grief"].story_count, 1);
    }

    #[tokio::test]
    async fn test_request_refresh_coalesces() {
        let feed = StoryFeed::new(
            Arc::new(MockStorySource::new()),
            Arc::new(MemoryStore::new()),
        );
        let mut needed = feed.subscribe_fetch_needed();

        feed.request_refresh();
        assert!(!needed.has_changed().unwrap());

        feed.fetch_needed.send_replace(false);
        needed.borrow_and_update();
        feed.request_refresh();
        feed.request_refresh();
        assert!(needed.has_changed().unwrap());
        assert!(*needed.borrow_and_update());
        assert!(!needed.has_changed().unwrap());
    }

    impl StoryFeed {
        async fn run_fetch_owned(self: Arc<Self>) {
            self.run_fetch().await;
        }
    }
}
