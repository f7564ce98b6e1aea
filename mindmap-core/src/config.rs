//! Session configuration.

use crate::location::WatchOptions;
use std::path::PathBuf;
use std::time::Duration;

pub use mindmap_api::API_BASE_ENV;

/// Environment variable naming the directory for persisted state.
pub const DATA_DIR_ENV: &str = "MINDMAP_DATA_DIR";

const DEFAULT_DATA_DIR: &str = "mindmap-data";
const DEFAULT_IMAGE_PATH: &str = "oxford-mindmap/api/get_image";

/// Configuration for a story session.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Base URL of the catalog API.
    pub api_base: Option<String>,

    /// Path under the API base that serves story images.
    pub image_path: String,

    /// Directory holding persisted state.
    pub data_dir: PathBuf,

    /// Distance in metres within which a story can be unlocked.
    pub unlock_radius: f64,

    /// Distances are rounded to a multiple of this many metres.
    pub distance_accuracy: f64,

    /// How often to re-fetch while auto-refresh is enabled.
    pub auto_refresh_period: Duration,

    /// Parameters for the live position subscription.
    pub watch_options: WatchOptions,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            image_path: DEFAULT_IMAGE_PATH.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            unlock_radius: 50.0,
            distance_accuracy: 1.0,
            auto_refresh_period: Duration::from_secs(60),
            watch_options: WatchOptions::default(),
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by MINDMAP_API_BASE and MINDMAP_DATA_DIR.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var(API_BASE_ENV) {
            config.api_base = Some(base);
        }
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }

    /// Set the catalog API base URL.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = Some(base.into());
        self
    }

    /// Set the image path under the API base.
    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = path.into();
        self
    }

    /// Set the directory for persisted state.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the unlock radius in metres.
    pub fn with_unlock_radius(mut self, metres: f64) -> Self {
        self.unlock_radius = metres;
        self
    }

    /// Set the rounding step for distances.
    pub fn with_distance_accuracy(mut self, metres: f64) -> Self {
        self.distance_accuracy = metres;
        self
    }

    /// Set the auto-refresh period.
    pub fn with_auto_refresh_period(mut self, period: Duration) -> Self {
        self.auto_refresh_period = period;
        self
    }

    /// Set the position subscription parameters.
    pub fn with_watch_options(mut self, options: WatchOptions) -> Self {
        self.watch_options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.api_base, None);
        assert_eq!(config.unlock_radius, 50.0);
        assert_eq!(config.distance_accuracy, 1.0);
        assert_eq!(config.auto_refresh_period, Duration::from_secs(60));
        assert_eq!(config.watch_options.time_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_builder() {
        let config = CoreConfig::new()
            .with_api_base("https://example.org")
            .with_data_dir("/tmp/mindmap")
            .with_unlock_radius(25.0)
            .with_auto_refresh_period(Duration::from_secs(5));

        assert_eq!(config.api_base.as_deref(), Some("https://example.org"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/mindmap"));
        assert_eq!(config.unlock_radius, 25.0);
        assert_eq!(config.auto_refresh_period, Duration::from_secs(5));
    }
}
