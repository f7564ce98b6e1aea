//! Minimal Oxford Mindmap catalog API client.
//!
//! This crate provides a focused client for the story catalog with:
//! - A single `get_stories` call with cache-busting headers
//! - Wire types for the loosely-typed story records the server returns
//! - Image URL resolution against the same API base

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, PRAGMA};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const STORIES_PATH: &str = "oxford-mindmap/api/get_stories";
const DEFAULT_IMAGE_PATH: &str = "oxford-mindmap/api/get_image";

/// Environment variable holding the API base URL.
pub const API_BASE_ENV: &str = "MINDMAP_API_BASE";

/// Raw catalog payload: story id to server-supplied fields.
pub type StoryCatalog = serde_json::Map<String, serde_json::Value>;

/// Errors that can occur when using the catalog client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API base URL not configured")]
    NoApiBase,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Story catalog API client.
#[derive(Clone)]
pub struct MindmapClient {
    client: reqwest::Client,
    api_base: String,
    image_path: String,
}

impl MindmapClient {
    /// Create a new client against the given API base URL.
    pub fn new(api_base: impl Into<String>) -> Result<Self, Error> {
        let api_base = normalize_base(api_base.into())?;
        // No timeouts: a slow catalog leaves the fetch in progress.
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base,
            image_path: DEFAULT_IMAGE_PATH.to_string(),
        })
    }

    /// Create a client from the MINDMAP_API_BASE environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let api_base = std::env::var(API_BASE_ENV).map_err(|_| Error::NoApiBase)?;
        Self::new(api_base)
    }

    /// Set the path (relative to the API base) that serves story images.
    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = path.into().trim_matches('/').to_string();
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Full URL of the story catalog endpoint.
    pub fn stories_url(&self) -> String {
        format!("{}/{STORIES_PATH}", self.api_base)
    }

    /// Resolve a story's display image reference to a fetchable URL.
    pub fn image_url(&self, image: &str) -> Option<String> {
        resolve_image_url(&self.api_base, &self.image_path, image)
    }

    /// Fetch the full story catalog, bypassing any HTTP caches.
    pub async fn fetch_stories(&self) -> Result<StoryCatalog, Error> {
        let url = self.stories_url();
        debug!(%url, "Fetching story catalog");

        let response = self
            .client
            .get(&url)
            .headers(no_cache_headers())
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        let catalog: StoryCatalog = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        debug!(stories = catalog.len(), "Fetched story catalog");
        Ok(catalog)
    }
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

fn normalize_base(base: String) -> Result<String, Error> {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::NoApiBase);
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(Error::Config(format!(
            "API base must be an http(s) URL: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Join an image reference onto the API base.
///
/// Empty references and the `noimage` marker mean the story has no image;
/// absolute URLs are returned untouched.
pub fn resolve_image_url(api_base: &str, image_path: &str, image: &str) -> Option<String> {
    let image = image.trim();
    if image.is_empty() || image == "noimage" {
        return None;
    }
    if image.starts_with("http://") || image.starts_with("https://") {
        return Some(image.to_string());
    }
    let base = api_base.trim_end_matches('/');
    let path = image_path.trim_matches('/');
    let image = image.trim_start_matches('/');
    if path.is_empty() {
        Some(format!("{base}/{image}"))
    } else {
        Some(format!("{base}/{path}/{image}"))
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// A single story record as the catalog serves it.
///
/// The server has used more than one spelling for coordinates over time, so
/// the common variants are all accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoryRecord {
    #[serde(default, deserialize_with = "id_from_any")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub display_image: Option<String>,
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude", alias = "lng")]
    pub lon: f64,
    #[serde(default)]
    pub trigger_warnings: Vec<TriggerWarningRecord>,
}

/// A trigger warning attached to a story record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TriggerWarningRecord {
    pub name: String,
    #[serde(default, alias = "description")]
    pub text: String,
}

// Ids arrive as strings or bare numbers depending on the server version.
fn id_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
