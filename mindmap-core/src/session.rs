//! StorySession - the composition root for the story core.
//!
//! A session owns every store and background task. Presentation code talks
//! to it only through the four context bundles and the change watcher.

use crate::config::CoreConfig;
use crate::context::{ControlsContext, LocationContext, StoryContext, TriggerContext};
use crate::fetch::{FetchStatus, StoryFeed, StorySource};
use crate::location::{LocationFix, LocationProvider, LocationTracker, TrackerState};
use crate::persist::{FileStore, KeyValueStore, PersistError};
use crate::stores::{AuxiliaryMap, BlacklistSet, BlacklistStore, Settings, SettingsStore, UnlockStore, UnlockedSet};
use crate::story::{filter_by_blacklist, Story};
use crate::task::TaskGuard;
use mindmap_api::MindmapClient;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors from StorySession operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("API error: {0}")]
    Api(#[from] mindmap_api::Error),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// External collaborators a session depends on.
pub struct Services {
    pub store: Arc<dyn KeyValueStore>,
    pub source: Arc<dyn StorySource>,
    pub location: Arc<dyn LocationProvider>,
}

/// A running story session.
///
/// Dropping the session aborts its background tasks and releases the
/// location subscription.
pub struct StorySession {
    config: CoreConfig,
    feed: Arc<StoryFeed>,
    unlocks: Arc<UnlockStore>,
    blacklist: Arc<BlacklistStore>,
    settings: Arc<SettingsStore>,
    tracker: Arc<LocationTracker>,
    tasks: Vec<TaskGuard>,
}

impl StorySession {
    /// Start a session on the current tokio runtime.
    ///
    /// Stores begin loading, the first fetch starts and location permission
    /// is requested straight away.
    pub fn start(config: CoreConfig, services: Services) -> Self {
        let Services {
            store,
            source,
            location,
        } = services;

        let feed = Arc::new(StoryFeed::new(source, store.clone()));
        let unlocks = Arc::new(UnlockStore::new(store.clone()));
        let blacklist = Arc::new(BlacklistStore::new(store.clone()));
        let settings = Arc::new(SettingsStore::new(store));
        let tracker = Arc::new(LocationTracker::new(
            location,
            config.watch_options.clone(),
        ));

        let mut tasks = Vec::new();
        {
            let unlocks = unlocks.clone();
            tasks.push(TaskGuard::spawn(async move { unlocks.load().await }));
        }
        {
            let blacklist = blacklist.clone();
            tasks.push(TaskGuard::spawn(async move { blacklist.load().await }));
        }
        {
            let settings = settings.clone();
            tasks.push(TaskGuard::spawn(async move { settings.load().await }));
        }
        tasks.push(TaskGuard::spawn(feed.clone().run()));
        tasks.push(TaskGuard::spawn(auto_refresh(
            feed.clone(),
            settings.cell().subscribe(),
            config.auto_refresh_period,
        )));
        tasks.push(TaskGuard::spawn(tracker.clone().run()));

        info!("Story session started");
        Self {
            config,
            feed,
            unlocks,
            blacklist,
            settings,
            tracker,
            tasks,
        }
    }

    /// Start a session against the catalog API in `config`, persisting to
    /// `config.data_dir`.
    pub fn connect(
        config: CoreConfig,
        location: Arc<dyn LocationProvider>,
    ) -> Result<Self, SessionError> {
        let api_base = config
            .api_base
            .clone()
            .ok_or(mindmap_api::Error::NoApiBase)?;
        let client = MindmapClient::new(api_base)?.with_image_path(config.image_path.clone());
        let store = FileStore::new(&config.data_dir);

        Ok(Self::start(
            config,
            Services {
                store: Arc::new(store),
                source: Arc::new(client),
                location,
            },
        ))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Visible stories, unlock progress and fetch status.
    pub fn story_context(&self) -> StoryContext {
        let blacklist = self.blacklist.cell().get();
        StoryContext {
            stories: filter_by_blacklist(&self.feed.stories(), &blacklist),
            unlocked: self.unlocks.unlocked().get(),
            auxiliary: self.unlocks.auxiliary().get(),
            fetch_status: self.feed.status(),
            api_base: self.config.api_base.clone(),
            image_path: self.config.image_path.clone(),
        }
    }

    /// Current position and distance queries.
    pub fn location_context(&self) -> LocationContext {
        LocationContext {
            location: self.tracker.fix(),
            awaiting_location: self.tracker.is_awaiting(),
            state: self.tracker.state(),
            unlock_radius: self.config.unlock_radius,
            accuracy: self.config.distance_accuracy,
        }
    }

    /// Mutation entry points and current settings.
    pub fn controls(&self) -> ControlsContext {
        ControlsContext {
            settings: self.settings.get(),
            feed: self.feed.clone(),
            unlocks: self.unlocks.clone(),
            settings_store: self.settings.clone(),
            tracker: self.tracker.clone(),
        }
    }

    /// Known trigger tags and the blacklist.
    pub fn trigger_context(&self) -> TriggerContext {
        TriggerContext {
            known_triggers: self.feed.known_triggers(),
            blacklist: self.blacklist.cell().get(),
            store: self.blacklist.clone(),
        }
    }

    /// Whether every persisted store has finished loading.
    pub fn is_ready(&self) -> bool {
        self.unlocks.unlocked().is_ready()
            && self.unlocks.auxiliary().is_ready()
            && self.blacklist.cell().is_ready()
            && self.settings.cell().is_ready()
    }

    /// Wait until every persisted store has finished loading.
    ///
    /// A store whose storage could not be read never becomes ready, so do
    /// not await this without a timeout when storage may be failing.
    pub async fn wait_until_ready(&self) {
        tokio::join!(
            self.unlocks.unlocked().wait_ready(),
            self.unlocks.auxiliary().wait_ready(),
            self.blacklist.cell().wait_ready(),
            self.settings.cell().wait_ready(),
        );
        debug!("All stores ready");
    }

    /// A watcher that wakes on any state change visible through the contexts.
    pub fn watch(&self) -> SessionWatcher {
        SessionWatcher {
            stories: self.feed.subscribe_stories(),
            status: self.feed.subscribe_status(),
            unlocked: self.unlocks.unlocked().subscribe(),
            auxiliary: self.unlocks.auxiliary().subscribe(),
            blacklist: self.blacklist.cell().subscribe(),
            settings: self.settings.cell().subscribe(),
            fix: self.tracker.subscribe_fix(),
            state: self.tracker.subscribe_state(),
            awaiting: self.tracker.subscribe_awaiting(),
        }
    }

    /// Stop all background work.
    pub fn shutdown(mut self) {
        self.tasks.clear();
        info!("Story session shut down");
    }
}

/// Wakes when anything a context exposes changes.
pub struct SessionWatcher {
    stories: watch::Receiver<Vec<Story>>,
    status: watch::Receiver<FetchStatus>,
    unlocked: watch::Receiver<UnlockedSet>,
    auxiliary: watch::Receiver<AuxiliaryMap>,
    blacklist: watch::Receiver<BlacklistSet>,
    settings: watch::Receiver<Settings>,
    fix: watch::Receiver<LocationFix>,
    state: watch::Receiver<TrackerState>,
    awaiting: watch::Receiver<bool>,
}

impl SessionWatcher {
    /// Wait for the next change. Returns false once the session is gone.
    pub async fn changed(&mut self) -> bool {
        let result = tokio::select! {
            r = self.stories.changed() => r,
            r = self.status.changed() => r,
            r = self.unlocked.changed() => r,
            r = self.auxiliary.changed() => r,
            r = self.blacklist.changed() => r,
            r = self.settings.changed() => r,
            r = self.fix.changed() => r,
            r = self.state.changed() => r,
            r = self.awaiting.changed() => r,
        };
        result.is_ok()
    }
}

/// Raise the fetch-needed flag every `period` while auto-refresh is on.
///
/// Any settings change restarts the period.
async fn auto_refresh(feed: Arc<StoryFeed>, mut settings: watch::Receiver<Settings>, period: Duration) {
    if period.is_zero() {
        warn!("Auto-refresh period is zero, auto-refresh disabled");
        return;
    }

    loop {
        let enabled = settings.borrow_and_update().auto_refresh;
        if enabled {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Auto-refresh initiated");
                        feed.request_refresh();
                    }
                    changed = settings.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        } else if settings.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::testing::MockStorySource;

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_raises_flag_each_period() {
        let feed = Arc::new(StoryFeed::new(
            Arc::new(MockStorySource::new()),
            Arc::new(MemoryStore::new()),
        ));
        let (settings_tx, settings_rx) = watch::channel(Settings::default());

        // A finished fetch (even a failed one) lowers the flag.
        feed.run_fetch().await;
        assert!(!feed.is_fetch_needed());

        let _task = TaskGuard::spawn(auto_refresh(
            feed.clone(),
            settings_rx,
            Duration::from_secs(60),
        ));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!feed.is_fetch_needed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(feed.is_fetch_needed());

        feed.run_fetch().await;
        settings_tx.send_modify(|s| s.auto_refresh = false);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!feed.is_fetch_needed());

        settings_tx.send_modify(|s| s.auto_refresh = true);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(feed.is_fetch_needed());
    }

    #[tokio::test]
    async fn test_zero_period_disables_auto_refresh() {
        let feed = Arc::new(StoryFeed::new(
            Arc::new(MockStorySource::new()),
            Arc::new(MemoryStore::new()),
        ));
        let (_settings_tx, settings_rx) = watch::channel(Settings::default());

        // Returns immediately instead of panicking inside the interval.
        auto_refresh(feed, settings_rx, Duration::ZERO).await;
    }
}
