//! Core data models used throughout the harvest pipeline.
//!
//! These types represent the messages, snapshot envelopes, canonical rows,
//! and detections that flow from the source through to the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Other,
}

/// A message as produced by the harvester, validated at the source boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub message_id: i64,
    pub channel: String,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub media: Option<MediaKind>,
    pub media_path: Option<PathBuf>,
    /// The item exactly as the source returned it.
    pub original: serde_json::Value,
}

impl RawMessage {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn has_photo(&self) -> bool {
        self.media == Some(MediaKind::Photo)
    }
}

/// The serialized form of one message inside a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotEntry {
    pub message_id: i64,
    pub channel_name: String,
    pub message_date: String,
    pub message_text: Option<String>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub has_media: bool,
    pub image_path: Option<String>,
    pub raw: serde_json::Value,
}

impl From<&RawMessage> for SnapshotEntry {
    fn from(msg: &RawMessage) -> Self {
        Self {
            message_id: msg.message_id,
            channel_name: msg.channel.clone(),
            message_date: msg.date.to_rfc3339(),
            message_text: msg.text.clone(),
            views: msg.views,
            forwards: msg.forwards,
            has_media: msg.has_media(),
            image_path: msg
                .media_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            raw: msg.original.clone(),
        }
    }
}

/// A row of the canonical message store, keyed by `message_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessageRecord {
    pub message_id: String,
    pub channel_name: String,
    pub post_date: DateTime<Utc>,
    pub message_text: String,
    pub view_count: i64,
    pub forward_count: i64,
    pub has_image: bool,
    pub raw_payload: String,
}

/// One object detected in one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub message_id: String,
    pub channel_name: String,
    pub image_path: String,
    pub detected_class: String,
    pub confidence_score: f64,
    pub image_category: ImageCategory,
}

/// Class label written when an image yields no detections.
pub const NO_DETECTION_CLASS: &str = "none";

/// Derived category of an image; never stored as independent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ImageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCategory::Promotional => "promotional",
            ImageCategory::ProductDisplay => "product_display",
            ImageCategory::Lifestyle => "lifestyle",
            ImageCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "promotional" => Some(ImageCategory::Promotional),
            "product_display" => Some(ImageCategory::ProductDisplay),
            "lifestyle" => Some(ImageCategory::Lifestyle),
            "other" => Some(ImageCategory::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy class lists used to derive an [`ImageCategory`].
#[derive(Debug, Clone)]
pub struct CategoryRules {
    pub person_classes: HashSet<String>,
    pub product_classes: HashSet<String>,
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self::new(["person"], ["bottle", "cell phone"])
    }
}

impl CategoryRules {
    pub fn new<P, Q>(person: P, product: Q) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        Q: IntoIterator,
        Q::Item: Into<String>,
    {
        Self {
            person_classes: person.into_iter().map(Into::into).collect(),
            product_classes: product.into_iter().map(Into::into).collect(),
        }
    }

    /// Category of an image from the labels detected in it.
    ///
    /// Only membership matters: order and duplicates are ignored.
    pub fn categorize<'a, I>(&self, classes: I) -> ImageCategory
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut has_person = false;
        let mut has_product = false;
        for class in classes {
            has_person |= self.person_classes.contains(class);
            has_product |= self.product_classes.contains(class);
        }

        match (has_person, has_product) {
            (true, true) => ImageCategory::Promotional,
            (false, true) => ImageCategory::ProductDisplay,
            (true, false) => ImageCategory::Lifestyle,
            (false, false) => ImageCategory::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(classes: &[&str]) -> ImageCategory {
        CategoryRules::default().categorize(classes.iter().copied())
    }

    #[test]
    fn category_table() {
        assert_eq!(category(&["person", "bottle"]), ImageCategory::Promotional);
        assert_eq!(category(&["car"]), ImageCategory::Other);
        assert_eq!(category(&[]), ImageCategory::Other);
        assert_eq!(category(&["person"]), ImageCategory::Lifestyle);
        assert_eq!(category(&["bottle"]), ImageCategory::ProductDisplay);
        assert_eq!(category(&["cell phone", "car"]), ImageCategory::ProductDisplay);
    }

    #[test]
    fn category_ignores_order_and_duplicates() {
        let a = category(&["bottle", "person", "person", "bottle"]);
        let b = category(&["person", "bottle"]);
        assert_eq!(a, b);
        assert_eq!(category(&["person", "person"]), category(&["person"]));
    }

    #[test]
    fn custom_rules() {
        let rules = CategoryRules::new(["person"], ["cup"]);
        assert_eq!(rules.categorize(["cup"]), ImageCategory::ProductDisplay);
        assert_eq!(rules.categorize(["bottle"]), ImageCategory::Other);
    }

    #[test]
    fn category_names_roundtrip() {
        for c in [
            ImageCategory::Promotional,
            ImageCategory::ProductDisplay,
            ImageCategory::Lifestyle,
            ImageCategory::Other,
        ] {
            assert_eq!(ImageCategory::parse(c.as_str()), Some(c));
        }
        assert_eq!(ImageCategory::parse("selfie"), None);
    }

    #[test]
    fn snapshot_entry_keeps_original() {
        let msg = RawMessage {
            message_id: 42,
            channel: "chemed".into(),
            date: DateTime::parse_from_rfc3339("2025-01-14T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            text: Some("Paracetamol in stock".into()),
            views: Some(120),
            forwards: None,
            media: Some(MediaKind::Photo),
            media_path: Some(PathBuf::from("data/raw/images/chemed/42.jpg")),
            original: serde_json::json!({"id": 42, "extra": true}),
        };
        let entry = SnapshotEntry::from(&msg);
        assert!(entry.has_media);
        assert_eq!(entry.message_date, "2025-01-14T08:30:00+00:00");
        assert_eq!(entry.image_path.as_deref(), Some("data/raw/images/chemed/42.jpg"));
        assert_eq!(entry.raw["extra"], true);
    }
}
