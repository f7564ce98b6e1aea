//! Location permission lifecycle, live position tracking and distances.
//!
//! The tracker is a small state machine:
//!
//! ```text
//! Unrequested -> Requesting -> Granted
//!                           \-> Denied
//! ```
//!
//! Every call to [`LocationTracker::request_location`] bumps a restart
//! counter; the driver tears down the current acquisition (and with it any
//! position subscription) and starts the permission -> subscribe sequence
//! again.

use crate::task::TaskGuard;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Mean equatorial radius used for distances, in metres.
pub const EARTH_RADIUS_METRES: f64 = 6_378_137.0;

/// Errors reported by a location provider.
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("Location provider error: {0}")]
    Provider(String),

    #[error("Location services unavailable")]
    Unavailable,
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A position report from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coords: Coordinates,
    /// Horizontal accuracy radius in metres, if reported.
    pub accuracy: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Position {
    /// A position at the given coordinates, stamped now.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            coords: Coordinates::new(latitude, longitude),
            accuracy: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Last known location, distinguishing "never asked" from "refused".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LocationFix {
    /// Permission has not been asked for yet.
    #[default]
    Unrequested,
    /// Permission was refused. Never reverts to `Unrequested`.
    Denied,
    Known(Position),
}

impl LocationFix {
    pub fn position(&self) -> Option<&Position> {
        match self {
            LocationFix::Known(position) => Some(position),
            _ => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, LocationFix::Denied)
    }
}

/// Where the tracker is in the permission lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerState {
    #[default]
    Unrequested,
    Requesting,
    Granted,
    Denied,
}

/// Outcome of a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Requested accuracy of position updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accuracy {
    Lowest,
    Low,
    Balanced,
    #[default]
    High,
    Highest,
}

/// Parameters for a continuous position subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    pub accuracy: Accuracy,
    /// Minimum time between updates.
    pub time_interval: Duration,
    /// Minimum movement between updates, in metres.
    pub distance_interval: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            accuracy: Accuracy::High,
            time_interval: Duration::from_secs(1),
            distance_interval: 1.0,
        }
    }
}

/// A live stream of position updates. Dropping it ends the subscription.
pub type PositionStream = Pin<Box<dyn Stream<Item = Position> + Send>>;

/// Platform location services.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Prompt for (or look up) location permission.
    async fn request_permission(&self) -> Result<PermissionStatus, LocationError>;

    /// One-shot read of the most recent cached position.
    async fn last_known_position(&self) -> Result<Option<Position>, LocationError>;

    /// Subscribe to continuous position updates.
    async fn watch_position(&self, options: WatchOptions) -> Result<PositionStream, LocationError>;
}

/// Great-circle distance between two points in metres, rounded to `accuracy`.
///
/// Uses the spherical law of cosines on a sphere of [`EARTH_RADIUS_METRES`].
pub fn geodesic_distance(from: Coordinates, to: Coordinates, accuracy: f64) -> f64 {
    let (lat1, lon1) = (from.latitude.to_radians(), from.longitude.to_radians());
    let (lat2, lon2) = (to.latitude.to_radians(), to.longitude.to_radians());

    let cos_angle = lat2.sin() * lat1.sin() + lat2.cos() * lat1.cos() * (lon1 - lon2).cos();
    // Rounding error can push the cosine just outside [-1, 1] for equal points.
    let distance = cos_angle.clamp(-1.0, 1.0).acos() * EARTH_RADIUS_METRES;

    if accuracy > 0.0 {
        (distance / accuracy).round() * accuracy
    } else {
        distance
    }
}

/// Distance from `fix` to `target`, or infinity without a known position.
pub fn distance_from_fix(fix: &LocationFix, target: Coordinates, accuracy: f64) -> f64 {
    match fix.position() {
        Some(position) => geodesic_distance(position.coords, target, accuracy),
        None => f64::INFINITY,
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Tracks permission state and the user's live position.
pub struct LocationTracker {
    provider: Arc<dyn LocationProvider>,
    options: WatchOptions,
    fix: watch::Sender<LocationFix>,
    state: watch::Sender<TrackerState>,
    awaiting: watch::Sender<bool>,
    restarts: watch::Sender<u64>,
}

impl LocationTracker {
    /// Create a tracker. It starts out awaiting its first request.
    pub fn new(provider: Arc<dyn LocationProvider>, options: WatchOptions) -> Self {
        Self {
            provider,
            options,
            fix: watch::Sender::new(LocationFix::Unrequested),
            state: watch::Sender::new(TrackerState::Unrequested),
            awaiting: watch::Sender::new(true),
            restarts: watch::Sender::new(0),
        }
    }

    pub fn fix(&self) -> LocationFix {
        *self.fix.borrow()
    }

    pub fn state(&self) -> TrackerState {
        *self.state.borrow()
    }

    /// Whether a permission/subscribe sequence is still in flight.
    pub fn is_awaiting(&self) -> bool {
        *self.awaiting.borrow()
    }

    /// Number of restarts requested so far.
    pub fn generation(&self) -> u64 {
        *self.restarts.borrow()
    }

    pub fn subscribe_fix(&self) -> watch::Receiver<LocationFix> {
        self.fix.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TrackerState> {
        self.state.subscribe()
    }

    pub fn subscribe_awaiting(&self) -> watch::Receiver<bool> {
        self.awaiting.subscribe()
    }

    /// Tear down any current subscription and ask for permission again.
    pub fn request_location(&self) {
        self.awaiting.send_replace(true);
        self.restarts.send_modify(|generation| *generation += 1);
    }

    /// Drive the tracker: one acquisition at start and one per restart.
    ///
    /// Cancelling this future releases the active subscription.
    pub async fn run(self: Arc<Self>) {
        let mut restarts = self.restarts.subscribe();
        let mut active: Option<TaskGuard> = None;

        loop {
            let generation = *restarts.borrow_and_update();
            if let Some(previous) = active.take() {
                drop(previous);
                info!("Unsubscribed from location service");
            }

            debug!(generation, "Starting location acquisition");
            active = Some(TaskGuard::spawn(self.clone().acquire()));

            if restarts.changed().await.is_err() {
                break;
            }
        }
    }

    async fn acquire(self: Arc<Self>) {
        self.state.send_replace(TrackerState::Requesting);

        match self.provider.request_permission().await {
            Ok(PermissionStatus::Granted) => info!("Permission to access location was granted"),
            Ok(PermissionStatus::Denied) => {
                info!("Permission to access location was denied");
                self.deny();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to get location permission");
                self.fail();
                return;
            }
        }

        let mut stream = match self.register().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to location service");
                self.fail();
                return;
            }
        };

        self.state.send_replace(TrackerState::Granted);
        self.awaiting.send_replace(false);
        info!("Subscribed to location service");

        while let Some(position) = stream.next().await {
            self.fix.send_replace(LocationFix::Known(position));
        }
        debug!("Location stream ended");
    }

    async fn register(&self) -> Result<PositionStream, LocationError> {
        if let Some(position) = self.provider.last_known_position().await? {
            self.fix.send_replace(LocationFix::Known(position));
        }
        self.provider.watch_position(self.options.clone()).await
    }

    fn deny(&self) {
        self.fix.send_replace(LocationFix::Denied);
        self.state.send_replace(TrackerState::Denied);
        self.awaiting.send_replace(false);
    }

    // A provider error before any fix reads as denial; a known fix is kept.
    fn fail(&self) {
        let has_fix = self.fix.borrow().position().is_some();
        if has_fix {
            self.state.send_replace(TrackerState::Granted);
            self.awaiting.send_replace(false);
        } else {
            self.deny();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLocationProvider;

    fn oxford() -> Coordinates {
        Coordinates::new(51.7520, -1.2577)
    }

    async fn settle(tracker: &LocationTracker) {
        let mut awaiting = tracker.subscribe_awaiting();
        let _ = awaiting.wait_for(|a| !*a).await;
    }

    async fn requested(provider: &MockLocationProvider, count: usize) {
        while provider.permission_requests() < count {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_distance_same_point_is_zero() {
        assert_eq!(geodesic_distance(oxford(), oxford(), 1.0), 0.0);
    }

    #[test]
    fn test_distance_one_degree_of_longitude_at_equator() {
        let d = geodesic_distance(Coordinates::new(0.0, 0.0), Coordinates::new(0.0, 1.0), 1.0);
        // 2 * pi * 6378137 / 360
        assert_eq!(d, 111_319.0);
    }

    #[test]
    fn test_distance_rounds_to_accuracy() {
        let from = Coordinates::new(0.0, 0.0);
        let to = Coordinates::new(0.0, 0.001);
        assert_eq!(geodesic_distance(from, to, 1.0), 111.0);
        assert_eq!(geodesic_distance(from, to, 10.0), 110.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = Coordinates::new(51.7520, -1.2577);
        let b = Coordinates::new(51.7548, -1.2544);
        assert_eq!(geodesic_distance(a, b, 1.0), geodesic_distance(b, a, 1.0));
    }

    #[test]
    fn test_distance_without_fix_is_infinite() {
        assert_eq!(
            distance_from_fix(&LocationFix::Unrequested, oxford(), 1.0),
            f64::INFINITY
        );
        assert_eq!(
            distance_from_fix(&LocationFix::Denied, oxford(), 1.0),
            f64::INFINITY
        );
    }

    #[tokio::test]
    async fn test_granted_reads_last_known_then_streams() {
        let provider = Arc::new(MockLocationProvider::granted(Some(Position::new(1.0, 2.0))));
        let tracker = Arc::new(LocationTracker::new(provider.clone(), WatchOptions::default()));
        assert!(tracker.is_awaiting());
        assert_eq!(tracker.fix(), LocationFix::Unrequested);

        let _driver = TaskGuard::spawn(tracker.clone().run());
        settle(&tracker).await;

        assert_eq!(tracker.state(), TrackerState::Granted);
        assert_eq!(tracker.fix().position().unwrap().coords, Coordinates::new(1.0, 2.0));
        assert_eq!(provider.last_watch_options(), Some(WatchOptions::default()));

        let mut fixes = tracker.subscribe_fix();
        assert!(provider.push(Position::new(3.0, 4.0)).await);
        fixes.changed().await.unwrap();
        assert_eq!(tracker.fix().position().unwrap().coords, Coordinates::new(3.0, 4.0));
    }

    #[tokio::test]
    async fn test_denied_is_sticky() {
        let provider = Arc::new(MockLocationProvider::denied());
        let tracker = Arc::new(LocationTracker::new(provider.clone(), WatchOptions::default()));

        let _driver = TaskGuard::spawn(tracker.clone().run());
        settle(&tracker).await;
        assert_eq!(tracker.fix(), LocationFix::Denied);
        assert_eq!(tracker.state(), TrackerState::Denied);

        tracker.request_location();
        settle(&tracker).await;

        assert_eq!(provider.permission_requests(), 2);
        assert_eq!(tracker.fix(), LocationFix::Denied);
    }

    #[tokio::test]
    async fn test_provider_error_without_fix_reads_as_denied() {
        let provider = Arc::new(MockLocationProvider::failing("no GPS"));
        let tracker = Arc::new(LocationTracker::new(provider, WatchOptions::default()));

        let _driver = TaskGuard::spawn(tracker.clone().run());
        settle(&tracker).await;

        assert_eq!(tracker.fix(), LocationFix::Denied);
        assert_eq!(tracker.state(), TrackerState::Denied);
    }

    #[tokio::test]
    async fn test_restart_releases_previous_subscription() {
        let provider = Arc::new(MockLocationProvider::granted(None));
        let tracker = Arc::new(LocationTracker::new(provider.clone(), WatchOptions::default()));

        let _driver = TaskGuard::spawn(tracker.clone().run());
        settle(&tracker).await;
        assert_eq!(provider.subscriptions(), 1);
        assert!(provider.is_subscribed());

        tracker.request_location();
        assert!(tracker.is_awaiting());
        assert_eq!(tracker.generation(), 1);
        settle(&tracker).await;

        assert_eq!(provider.permission_requests(), 2);
        assert_eq!(provider.subscriptions(), 2);
        assert!(provider.is_subscribed());
    }

    #[tokio::test]
    async fn test_dropping_driver_releases_subscription() {
        let provider = Arc::new(MockLocationProvider::granted(None));
        let tracker = Arc::new(LocationTracker::new(provider.clone(), WatchOptions::default()));

        let driver = TaskGuard::spawn(tracker.clone().run());
        settle(&tracker).await;
        assert!(provider.is_subscribed());

        drop(driver);
        provider.wait_released().await;
        assert!(!provider.is_subscribed());
    }

    #[tokio::test]
    async fn test_dropping_driver_while_requesting_never_subscribes() {
        let provider = Arc::new(MockLocationProvider::granted(None));
        let mut gate = provider.gate_permission();
        let tracker = Arc::new(LocationTracker::new(provider.clone(), WatchOptions::default()));

        let driver = TaskGuard::spawn(tracker.clone().run());
        requested(&provider, 1).await;
        assert_eq!(tracker.state(), TrackerState::Requesting);

        drop(driver);
        gate.abandoned().await;
        assert!(!gate.grant());

        tokio::task::yield_now().await;
        assert_eq!(provider.subscriptions(), 0);
        assert!(!provider.is_subscribed());
    }

    #[tokio::test]
    async fn test_restart_while_requesting_abandons_first_request() {
        let provider = Arc::new(MockLocationProvider::granted(None));
        let mut stale = provider.gate_permission();
        let tracker = Arc::new(LocationTracker::new(provider.clone(), WatchOptions::default()));

        let _driver = TaskGuard::spawn(tracker.clone().run());
        requested(&provider, 1).await;

        tracker.request_location();
        settle(&tracker).await;
        assert_eq!(provider.permission_requests(), 2);
        assert_eq!(provider.subscriptions(), 1);

        // A late answer to the first request changes nothing.
        stale.abandoned().await;
        assert!(!stale.grant());
        tokio::task::yield_now().await;
        assert_eq!(provider.subscriptions(), 1);
        assert!(provider.is_subscribed());
        assert_eq!(tracker.state(), TrackerState::Granted);
    }
}
