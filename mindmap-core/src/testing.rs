//! Testing utilities for the story core.
//!
//! This module provides scripted stand-ins for every external boundary:
//! - `MockStorySource` for deterministic catalog fetches without HTTP
//! - `FailingStore` for exercising storage failure paths
//! - `MockLocationProvider` for permission and position scripting
//! - `TestHarness` for running a whole session against the mocks

use crate::config::CoreConfig;
use crate::fetch::StorySource;
use crate::location::{
    LocationError, LocationProvider, PermissionStatus, Position, PositionStream, WatchOptions,
};
use crate::persist::{KeyValueStore, MemoryStore, PersistError};
use crate::session::{Services, StorySession};
use crate::story::RawStoryData;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// Build a raw catalog from a JSON object literal.
///
/// Panics if `value` is not an object.
pub fn catalog(value: serde_json::Value) -> RawStoryData {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("catalog must be a JSON object, got {other}"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Story source
// ============================================================================

enum ScriptedFetch {
    Ready(Result<RawStoryData, String>),
    Gated(oneshot::Receiver<Result<RawStoryData, String>>),
}

/// A story source that replays scripted responses in order.
///
/// Once the script runs out every fetch fails with a network error.
#[derive(Default)]
pub struct MockStorySource {
    script: Mutex<VecDeque<ScriptedFetch>>,
    calls: AtomicUsize,
}

impl MockStorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful fetch.
    pub fn respond(&self, data: RawStoryData) -> &Self {
        lock(&self.script).push_back(ScriptedFetch::Ready(Ok(data)));
        self
    }

    /// Queue a failed fetch.
    pub fn fail(&self, message: impl Into<String>) -> &Self {
        lock(&self.script).push_back(ScriptedFetch::Ready(Err(message.into())));
        self
    }

    /// Queue a fetch that stays pending until the returned gate is released.
    pub fn gate(&self) -> FetchGate {
        let (tx, rx) = oneshot::channel();
        lock(&self.script).push_back(ScriptedFetch::Gated(rx));
        FetchGate(tx)
    }

    /// Number of fetches made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorySource for MockStorySource {
    async fn fetch_stories(&self) -> Result<RawStoryData, mindmap_api::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();

        let result = match next {
            Some(ScriptedFetch::Ready(result)) => result,
            Some(ScriptedFetch::Gated(rx)) => rx
                .await
                .unwrap_or_else(|_| Err("gate dropped".to_string())),
            None => Err("no scripted response".to_string()),
        };
        result.map_err(mindmap_api::Error::Network)
    }
}

/// Releases a gated fetch.
pub struct FetchGate(oneshot::Sender<Result<RawStoryData, String>>);

impl FetchGate {
    pub fn succeed(self, data: RawStoryData) {
        let _ = self.0.send(Ok(data));
    }

    pub fn fail(self, message: impl Into<String>) {
        let _ = self.0.send(Err(message.into()));
    }
}

// ============================================================================
// Storage
// ============================================================================

/// A store whose writes always fail and whose reads optionally fail.
pub struct FailingStore {
    fail_reads: bool,
    inner: MemoryStore,
    writes: AtomicUsize,
}

impl FailingStore {
    /// Every read and write fails.
    pub fn new() -> Self {
        Self {
            fail_reads: true,
            inner: MemoryStore::new(),
            writes: AtomicUsize::new(0),
        }
    }

    /// Reads succeed (and find nothing); writes fail.
    pub fn writes_only() -> Self {
        Self {
            fail_reads: false,
            ..Self::new()
        }
    }

    /// Number of write attempts made.
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        if self.fail_reads {
            return Err(PersistError::Unavailable(format!("cannot read {key}")));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, _value: String) -> Result<(), PersistError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(PersistError::Unavailable(format!("cannot write {key}")))
    }
}

// ============================================================================
// Location
// ============================================================================

/// A location provider with a scripted permission answer and a position feed
/// the test pushes into.
///
/// Queued permission gates are consumed first, one per request; after that
/// every request gets the scripted answer.
pub struct MockLocationProvider {
    permission: Mutex<Result<PermissionStatus, String>>,
    permission_gates: Mutex<VecDeque<oneshot::Receiver<PermissionStatus>>>,
    last_known: Mutex<Option<Position>>,
    feed: Mutex<Option<mpsc::Sender<Position>>>,
    last_options: Mutex<Option<WatchOptions>>,
    permission_requests: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl MockLocationProvider {
    fn with_permission(permission: Result<PermissionStatus, String>) -> Self {
        Self {
            permission: Mutex::new(permission),
            permission_gates: Mutex::new(VecDeque::new()),
            last_known: Mutex::new(None),
            feed: Mutex::new(None),
            last_options: Mutex::new(None),
            permission_requests: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Grants permission and reports `last_known` as the cached position.
    pub fn granted(last_known: Option<Position>) -> Self {
        let provider = Self::with_permission(Ok(PermissionStatus::Granted));
        *lock(&provider.last_known) = last_known;
        provider
    }

    pub fn denied() -> Self {
        Self::with_permission(Ok(PermissionStatus::Denied))
    }

    /// Every permission request errors.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_permission(Err(message.into()))
    }

    /// Change the answer given to later permission requests.
    pub fn set_permission(&self, status: PermissionStatus) {
        *lock(&self.permission) = Ok(status);
    }

    /// Hold the next permission request open until the returned gate is
    /// answered. A dropped gate answers with a provider error.
    pub fn gate_permission(&self) -> PermissionGate {
        let (tx, rx) = oneshot::channel();
        lock(&self.permission_gates).push_back(rx);
        PermissionGate(tx)
    }

    /// Deliver a position to the active subscription.
    ///
    /// Returns false if nothing is subscribed.
    pub async fn push(&self, position: Position) -> bool {
        let sender = lock(&self.feed).clone();
        match sender {
            Some(sender) => sender.send(position).await.is_ok(),
            None => false,
        }
    }

    /// Whether a subscription is currently held open.
    pub fn is_subscribed(&self) -> bool {
        lock(&self.feed)
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    /// Wait until the current subscription has been released.
    pub async fn wait_released(&self) {
        let sender = lock(&self.feed).clone();
        if let Some(sender) = sender {
            sender.closed().await;
        }
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn last_watch_options(&self) -> Option<WatchOptions> {
        lock(&self.last_options).clone()
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    async fn request_permission(&self) -> Result<PermissionStatus, LocationError> {
        let gate = lock(&self.permission_gates).pop_front();
        self.permission_requests.fetch_add(1, Ordering::SeqCst);

        let Some(rx) = gate else {
            let scripted = lock(&self.permission).clone();
            return scripted.map_err(LocationError::Provider);
        };
        rx.await
            .map_err(|_| LocationError::Provider("gate dropped".to_string()))
    }

    async fn last_known_position(&self) -> Result<Option<Position>, LocationError> {
        Ok(*lock(&self.last_known))
    }

    async fn watch_position(&self, options: WatchOptions) -> Result<PositionStream, LocationError> {
        let (tx, rx) = mpsc::channel(16);
        *lock(&self.feed) = Some(tx);
        *lock(&self.last_options) = Some(options);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Answers a held permission request.
pub struct PermissionGate(oneshot::Sender<PermissionStatus>);

impl PermissionGate {
    /// Returns false if the request was abandoned before the answer arrived.
    pub fn grant(self) -> bool {
        self.0.send(PermissionStatus::Granted).is_ok()
    }

    pub fn deny(self) -> bool {
        self.0.send(PermissionStatus::Denied).is_ok()
    }

    /// Wait until the caller stops waiting for an answer.
    pub async fn abandoned(&mut self) {
        self.0.closed().await;
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A running session wired to mock collaborators.
pub struct TestHarness {
    pub session: StorySession,
    pub store: Arc<MemoryStore>,
    pub source: Arc<MockStorySource>,
    pub location: Arc<MockLocationProvider>,
}

impl TestHarness {
    /// Start a session with an empty store, a granted location at
    /// `position` and whatever `source` has been scripted with.
    pub fn start(source: MockStorySource, position: Option<Position>) -> Self {
        Self::start_with(
            CoreConfig::default(),
            MemoryStore::new(),
            source,
            MockLocationProvider::granted(position),
        )
    }

    /// Start a session from fully specified parts.
    pub fn start_with(
        config: CoreConfig,
        store: MemoryStore,
        source: MockStorySource,
        location: MockLocationProvider,
    ) -> Self {
        let store = Arc::new(store);
        let source = Arc::new(source);
        let location = Arc::new(location);

        let session = StorySession::start(
            config,
            Services {
                store: store.clone(),
                source: source.clone(),
                location: location.clone(),
            },
        );

        Self {
            session,
            store,
            source,
            location,
        }
    }
}
