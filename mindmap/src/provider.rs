//! A location provider driven from the command line.

use async_trait::async_trait;
use futures::stream;
use mindmap_core::{LocationError, LocationProvider, PermissionStatus, Position, PositionStream, WatchOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// Reports whatever position it was last moved to.
pub struct SimulatedLocation {
    granted: AtomicBool,
    position: watch::Sender<Option<Position>>,
}

impl SimulatedLocation {
    pub fn new(position: Option<Position>, granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            position: watch::Sender::new(position),
        }
    }

    /// Move to a new position, notifying any live subscription.
    pub fn move_to(&self, latitude: f64, longitude: f64) {
        self.position
            .send_replace(Some(Position::new(latitude, longitude)));
    }

    /// Change the answer given to later permission requests.
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocationProvider for SimulatedLocation {
    async fn request_permission(&self) -> Result<PermissionStatus, LocationError> {
        if self.granted.load(Ordering::SeqCst) {
            Ok(PermissionStatus::Granted)
        } else {
            Ok(PermissionStatus::Denied)
        }
    }

    async fn last_known_position(&self) -> Result<Option<Position>, LocationError> {
        Ok(*self.position.borrow())
    }

    async fn watch_position(&self, options: WatchOptions) -> Result<PositionStream, LocationError> {
        debug!(?options, "Position subscription opened");
        let updates = self.position.subscribe();

        Ok(Box::pin(stream::unfold(updates, |mut updates| async move {
            updates.changed().await.ok()?;
            let position = *updates.borrow_and_update();
            position.map(|position| (position, updates))
        })))
    }
}
