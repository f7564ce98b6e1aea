//! Story model and the transformer from raw catalog data.

use mindmap_api::{StoryCatalog, StoryRecord};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Story identifier as assigned by the catalog.
pub type StoryId = String;

/// Untransformed catalog payload.
pub type RawStoryData = StoryCatalog;

/// Trigger tag name to what is known about it.
pub type KnownTriggers = BTreeMap<String, TriggerInfo>;

/// A content-sensitivity label attached to a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerWarning {
    pub name: String,
    pub text: String,
}

/// A location-gated story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    pub description: String,
    /// Image reference relative to the API, if the story has one.
    pub display_image: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub trigger_warnings: Vec<TriggerWarning>,
}

impl Story {
    /// Whether any of this story's trigger tags is in `blacklist`.
    pub fn has_blacklisted_trigger(&self, blacklist: &BTreeSet<String>) -> bool {
        self.trigger_warnings
            .iter()
            .any(|tw| blacklist.contains(&tw.name))
    }
}

/// Aggregate information about one trigger tag across the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Description from the first story that carries the tag.
    pub description: String,
    /// Number of stories carrying the tag.
    pub story_count: usize,
}

/// Normalize a raw catalog into an ordered story list.
///
/// Records that cannot be decoded are skipped. The result is sorted by id,
/// so the same catalog always yields an equal list regardless of key order.
pub fn transform(raw: &RawStoryData) -> Vec<Story> {
    let mut stories: Vec<Story> = raw
        .iter()
        .filter_map(|(key, value)| {
            match serde_json::from_value::<StoryRecord>(value.clone()) {
                Ok(record) => Some(story_from_record(key, record)),
                Err(e) => {
                    warn!(story = %key, error = %e, "Skipping malformed story record");
                    None
                }
            }
        })
        .collect();

    stories.sort_by(|a, b| compare_ids(&a.id, &b.id));
    stories
}

fn story_from_record(key: &str, record: StoryRecord) -> Story {
    Story {
        id: record
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| key.to_string()),
        title: record.title,
        description: record.description,
        display_image: record.display_image.filter(|img| !img.trim().is_empty()),
        latitude: record.lat,
        longitude: record.lon,
        trigger_warnings: record
            .trigger_warnings
            .into_iter()
            .map(|tw| TriggerWarning {
                name: tw.name,
                text: tw.text,
            })
            .collect(),
    }
}

/// Numeric ids compare numerically and sort before non-numeric ids.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Derive the table of trigger tags that appear in `stories`.
pub fn extract_triggers(stories: &[Story]) -> KnownTriggers {
    let mut known = KnownTriggers::new();
    for story in stories {
        // A tag listed twice on one story still counts that story once.
        let mut seen = BTreeSet::new();
        for tw in &story.trigger_warnings {
            if !seen.insert(tw.name.as_str()) {
                continue;
            }
            known
                .entry(tw.name.clone())
                .and_modify(|info| info.story_count += 1)
                .or_insert_with(|| TriggerInfo {
                    description: tw.text.clone(),
                    story_count: 1,
                });
        }
    }
    known
}

/// Stories with no trigger tag in `blacklist`.
///
/// Matching stories are dropped entirely.
pub fn filter_by_blacklist(stories: &[Story], blacklist: &BTreeSet<String>) -> Vec<Story> {
    stories
        .iter()
        .filter(|story| !story.has_blacklisted_trigger(blacklist))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawStoryData {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn blacklist(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_transform_single_story() {
        let stories = transform(&raw(json!({
            "1": {"id": "1", "lat": 0, "lon": 0, "title": "A", "trigger_warnings": []}
        })));

        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].id, "1");
        assert_eq!(stories[0].title, "A");
        assert_eq!(stories[0].latitude, 0.0);
        assert_eq!(stories[0].display_image, None);
    }

    #[test]
    fn test_transform_orders_numeric_ids() {
        let stories = transform(&raw(json!({
            "10": {"lat": 0, "lon": 0},
            "2": {"lat": 0, "lon": 0},
            "intro": {"lat": 0, "lon": 0},
            "1": {"lat": 0, "lon": 0}
        })));

        let ids: Vec<_> = stories.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "10", "intro"]);
    }

    #[test]
    fn test_transform_skips_malformed_records() {
        let stories = transform(&raw(json!({
            "1": {"lat": 51.7, "lon": -1.2, "title": "Good"},
            "2": {"title": "No coordinates"},
            "3": "not even an object"
        })));

        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].title, "Good");
    }

    #[test]
    fn test_transform_is_deterministic() {
        let data = raw(json!({
            "2": {"lat": 1, "lon": 2, "trigger_warnings": [{"name": "grief", "text": "loss"}]},
            "1": {"lat": 3, "lon": 4, "display_image": "a.jpg"}
        }));

        assert_eq!(transform(&data), transform(&data.clone()));
    }

    #[test]
    fn test_extract_triggers_counts_stories() {
        let stories = transform(&raw(json!({
            "1": {"lat": 0, "lon": 0, "trigger_warnings": [
                {"name": "violence", "text": "A fight"},
                {"name": "violence", "text": "Duplicate"}
            ]},
            "2": {"lat": 0, "lon": 0, "trigger_warnings": [
                {"name": "violence", "text": "Another fight"},
                {"name": "grief", "text": "Loss"}
            ]}
        })));

        let known = extract_triggers(&stories);
        assert_eq!(known.len(), 2);
        assert_eq!(known["violence"].story_count, 2);
        assert_eq!(known["violence"].description, "A fight");
        assert_eq!(known["grief"].story_count, 1);
    }

    #[test]
    fn test_filter_by_blacklist_scenario() {
        let untagged = transform(&raw(json!({
            "1": {"id": "1", "lat": 0, "lon": 0, "title": "A", "trigger_warnings": []}
        })));

        assert_eq!(filter_by_blacklist(&untagged, &blacklist(&[])).len(), 1);
        assert_eq!(filter_by_blacklist(&untagged, &blacklist(&["violence"])).len(), 1);

        let tagged = transform(&raw(json!({
            "1": {"id": "1", "lat": 0, "lon": 0, "title": "A",
                  "trigger_warnings": [{"name": "violence", "text": "A fight"}]}
        })));
        assert!(filter_by_blacklist(&tagged, &blacklist(&["violence"])).is_empty());
    }
}
