//! The four context bundles handed to presentation code.
//!
//! Each bundle is a snapshot taken when it was built plus explicit handles
//! to the services it may act on. Presentation code rebuilds its bundles when
//! the session reports a change; nothing here updates in place.

use crate::fetch::{FetchStatus, StoryFeed};
use crate::location::{distance_from_fix, Coordinates, LocationFix, LocationTracker, TrackerState};
use crate::stores::{AuxiliaryMap, BlacklistSet, BlacklistStore, Settings, SettingsStore, UnlockStore, UnlockedSet};
use crate::story::{KnownTriggers, Story};
use std::fmt;
use std::sync::Arc;

/// Visible stories and the user's progress through them.
#[derive(Debug, Clone)]
pub struct StoryContext {
    /// Stories with no blacklisted trigger, in catalog order.
    pub stories: Vec<Story>,
    pub unlocked: UnlockedSet,
    pub auxiliary: AuxiliaryMap,
    pub fetch_status: FetchStatus,
    pub(crate) api_base: Option<String>,
    pub(crate) image_path: String,
}

impl StoryContext {
    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|story| story.id == id)
    }

    pub fn is_unlocked(&self, id: &str) -> bool {
        self.unlocked.contains(id)
    }

    /// Visible stories the user has unlocked.
    pub fn unlocked_stories(&self) -> impl Iterator<Item = &Story> {
        self.stories
            .iter()
            .filter(|story| self.unlocked.contains(&story.id))
    }

    /// URL of the story's display image, if it has one.
    pub fn image_url(&self, story: &Story) -> Option<String> {
        let image = story.display_image.as_deref()?;
        match &self.api_base {
            Some(base) => mindmap_api::resolve_image_url(base, &self.image_path, image),
            None if image.starts_with("http://") || image.starts_with("https://") => {
                Some(image.to_string())
            }
            None => None,
        }
    }
}

/// Whether (and why not) a story can be unlocked right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnlockStatus {
    Unlocked,
    Unlockable,
    /// No position is available, so distance is unknown.
    NoLocation,
    /// The user is this many metres outside the unlock radius.
    TooFar { metres: f64 },
}

impl fmt::Display for UnlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockStatus::Unlocked => write!(f, "View"),
            UnlockStatus::Unlockable => write!(f, "Unlock"),
            UnlockStatus::NoLocation => write!(f, "Cannot unlock without location data."),
            UnlockStatus::TooFar { metres } => {
                write!(f, "You are {metres} metres too far to unlock.")
            }
        }
    }
}

/// The user's position and distance queries against it.
#[derive(Debug, Clone)]
pub struct LocationContext {
    pub location: LocationFix,
    /// A permission/subscribe sequence is still in flight.
    pub awaiting_location: bool,
    pub state: TrackerState,
    pub(crate) unlock_radius: f64,
    pub(crate) accuracy: f64,
}

impl LocationContext {
    pub fn unlock_radius(&self) -> f64 {
        self.unlock_radius
    }

    /// Distance to the story in metres; infinite without a position.
    pub fn distance(&self, story: &Story) -> f64 {
        distance_from_fix(
            &self.location,
            Coordinates::new(story.latitude, story.longitude),
            self.accuracy,
        )
    }

    /// Distance beyond the unlock radius. The story is unlockable exactly
    /// when this is zero or less.
    pub fn distance_adjusted(&self, story: &Story) -> f64 {
        self.distance(story) - self.unlock_radius
    }

    pub fn can_unlock(&self, story: &Story) -> bool {
        self.distance_adjusted(story) <= 0.0
    }

    pub fn unlock_status(&self, story: &Story, unlocked: bool) -> UnlockStatus {
        if unlocked {
            return UnlockStatus::Unlocked;
        }
        let adjusted = self.distance_adjusted(story);
        if adjusted <= 0.0 {
            UnlockStatus::Unlockable
        } else if adjusted.is_infinite() {
            UnlockStatus::NoLocation
        } else {
            UnlockStatus::TooFar { metres: adjusted }
        }
    }
}

/// Every mutation entry point apart from trigger toggling.
#[derive(Clone)]
pub struct ControlsContext {
    pub settings: Settings,
    pub(crate) feed: Arc<StoryFeed>,
    pub(crate) unlocks: Arc<UnlockStore>,
    pub(crate) settings_store: Arc<SettingsStore>,
    pub(crate) tracker: Arc<LocationTracker>,
}

impl ControlsContext {
    /// Restart the permission and subscription sequence.
    pub fn request_location(&self) {
        self.tracker.request_location();
    }

    /// Ask for the catalog to be fetched again.
    pub fn refresh(&self) {
        self.feed.request_refresh();
    }

    pub async fn unlock(&self, id: &str) {
        self.unlocks.unlock(id).await;
    }

    pub async fn lock(&self, id: &str) {
        self.unlocks.lock(id).await;
    }

    pub async fn clear_unlocks(&self) {
        self.unlocks.clear().await;
    }

    pub async fn set_settings(&self, settings: Settings) -> bool {
        self.settings_store.set(settings).await
    }

    /// Modify the current settings (not this snapshot's copy).
    pub async fn update_settings(&self, f: impl FnOnce(&mut Settings)) -> bool {
        self.settings_store.update(f).await
    }
}

impl fmt::Debug for ControlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlsContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Trigger tags and the user's blacklist.
#[derive(Clone)]
pub struct TriggerContext {
    pub known_triggers: KnownTriggers,
    pub blacklist: BlacklistSet,
    pub(crate) store: Arc<BlacklistStore>,
}

impl TriggerContext {
    pub fn is_blocked(&self, tag: &str) -> bool {
        self.blacklist.contains(tag)
    }

    /// Flip `tag` relative to this snapshot's blacklist.
    ///
    /// Repeated toggles from the same snapshot all request the same
    /// membership, so they amount to a single toggle. Returns the requested
    /// membership.
    pub async fn toggle(&self, tag: &str) -> bool {
        let blocked = !self.blacklist.contains(tag);
        self.store.set_blocked(tag, blocked).await;
        blocked
    }
}

impl fmt::Debug for TriggerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerContext")
            .field("known_triggers", &self.known_triggers)
            .field("blacklist", &self.blacklist)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Position;
    use crate::persist::MemoryStore;

    fn story_at(id: &str, latitude: f64, longitude: f64) -> Story {
        Story {
            id: id.to_string(),
            title: format!("Story {id}"),
            description: String::new(),
            display_image: None,
            latitude,
            longitude,
            trigger_warnings: Vec::new(),
        }
    }

    fn location(fix: LocationFix) -> LocationContext {
        LocationContext {
            location: fix,
            awaiting_location: false,
            state: TrackerState::Granted,
            unlock_radius: 50.0,
            accuracy: 1.0,
        }
    }

    fn stories_with_base(api_base: Option<&str>) -> StoryContext {
        StoryContext {
            stories: Vec::new(),
            unlocked: UnlockedSet::new(),
            auxiliary: AuxiliaryMap::new(),
            fetch_status: FetchStatus::Done,
            api_base: api_base.map(str::to_string),
            image_path: "img".to_string(),
        }
    }

    #[test]
    fn test_no_location_is_never_unlockable() {
        for fix in [LocationFix::Unrequested, LocationFix::Denied] {
            let ctx = location(fix);
            for (lat, lon) in [(0.0, 0.0), (51.75, -1.25), (-89.9, 179.9)] {
                let story = story_at("1", lat, lon);
                assert!(ctx.distance_adjusted(&story) > 0.0);
                assert!(!ctx.can_unlock(&story));
                assert_eq!(ctx.unlock_status(&story, false), UnlockStatus::NoLocation);
            }
        }
    }

    #[test]
    fn test_unlockable_within_radius() {
        let ctx = location(LocationFix::Known(Position::new(0.0, 0.0)));
        // ~44.5 m east of the user.
        let near = story_at("1", 0.0, 0.0004);
        // ~111 m east of the user.
        let far = story_at("2", 0.0, 0.001);

        assert_eq!(ctx.distance(&near), 45.0);
        assert!(ctx.can_unlock(&near));
        assert_eq!(ctx.unlock_status(&near, false), UnlockStatus::Unlockable);

        assert_eq!(ctx.distance_adjusted(&far), 61.0);
        assert_eq!(
            ctx.unlock_status(&far, false),
            UnlockStatus::TooFar { metres: 61.0 }
        );
        assert_eq!(ctx.unlock_status(&far, true), UnlockStatus::Unlocked);
    }

    #[test]
    fn test_boundary_is_unlockable() {
        let mut ctx = location(LocationFix::Known(Position::new(0.0, 0.0)));
        let story = story_at("1", 0.0, 0.001);
        ctx.unlock_radius = ctx.distance(&story);
        assert_eq!(ctx.distance_adjusted(&story), 0.0);
        assert!(ctx.can_unlock(&story));
    }

    #[test]
    fn test_unlock_status_messages() {
        assert_eq!(UnlockStatus::Unlockable.to_string(), "Unlock");
        assert_eq!(
            UnlockStatus::NoLocation.to_string(),
            "Cannot unlock without location data."
        );
        assert_eq!(
            UnlockStatus::TooFar { metres: 12.0 }.to_string(),
            "You are 12 metres too far to unlock."
        );
    }

    #[test]
    fn test_image_url() {
        let mut story = story_at("1", 0.0, 0.0);
        let ctx = stories_with_base(Some("https://example.org"));
        assert_eq!(ctx.image_url(&story), None);

        story.display_image = Some("a.jpg".to_string());
        assert_eq!(
            ctx.image_url(&story).as_deref(),
            Some("https://example.org/img/a.jpg")
        );

        let offline = stories_with_base(None);
        assert_eq!(offline.image_url(&story), None);
        story.display_image = Some("https://cdn.example.org/b.png".to_string());
        assert_eq!(
            offline.image_url(&story).as_deref(),
            Some("https://cdn.example.org/b.png")
        );
    }

    #[tokio::test]
    async fn test_stale_toggles_apply_once() {
        let store = Arc::new(BlacklistStore::new(Arc::new(MemoryStore::new())));
        store.load().await;

        let snapshot = TriggerContext {
            known_triggers: KnownTriggers::new(),
            blacklist: BlacklistSet::new(),
            store: store.clone(),
        };

        let (first, second) = tokio::join!(snapshot.toggle("violence"), snapshot.toggle("violence"));
        assert!(first && second);
        assert!(store.contains("violence"));
        assert_eq!(store.cell().get().len(), 1);

        let fresh = TriggerContext {
            blacklist: store.cell().get(),
            ..snapshot
        };
        assert!(!fresh.toggle("violence").await);
        assert!(!store.contains("violence"));
    }
}
