//! State synchronization core for a location-gated story map.
//!
//! This crate provides:
//! - Dual-source catalog fetching (network raced against the local cache)
//! - Persisted unlock progress, trigger blacklist and settings that merge
//!   cleanly with changes made before storage finished loading
//! - Location tracking with permission handling and unlock distance checks
//! - Context bundles that presentation code reads and acts through
//!
//! # Quick Start
//!
//! ```ignore
//! use mindmap_core::{CoreConfig, StorySession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::from_env().with_api_base("https://example.org");
//!     let session = StorySession::connect(config, my_location_provider())?;
//!     session.wait_until_ready().await;
//!
//!     let stories = session.story_context();
//!     let location = session.location_context();
//!     for story in &stories.stories {
//!         let unlocked = stories.is_unlocked(&story.id);
//!         println!("{}: {}", story.title, location.unlock_status(story, unlocked));
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod fetch;
pub mod location;
pub mod merge;
pub mod persist;
pub mod session;
pub mod stores;
pub mod story;
pub mod task;
pub mod testing;

// Primary public API
pub use config::CoreConfig;
pub use context::{ControlsContext, LocationContext, StoryContext, TriggerContext, UnlockStatus};
pub use fetch::{FetchStatus, StorySource};
pub use location::{
    LocationError, LocationFix, LocationProvider, PermissionStatus, Position, PositionStream,
    TrackerState, WatchOptions,
};
pub use persist::{FileStore, KeyValueStore, MemoryStore, PersistError};
pub use session::{Services, SessionError, SessionWatcher, StorySession};
pub use stores::Settings;
pub use story::{Story, StoryId, TriggerInfo, TriggerWarning};
pub use testing::{MockLocationProvider, MockStorySource, TestHarness};
