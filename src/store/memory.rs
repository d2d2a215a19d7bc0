//! In-memory [`CanonicalStore`] implementation for testing.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. A single write lock per
//! operation gives the same at-most-one-row-per-key guarantee as the
//! SQLite primary key.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ConflictPolicy;
use crate::error::{DetectError, RecordError};
use crate::models::{CanonicalMessageRecord, DetectionRecord};

use super::{CanonicalStore, WriteOutcome};

#[derive(Default)]
pub struct InMemoryStore {
    messages: RwLock<HashMap<String, CanonicalMessageRecord>>,
    detections: RwLock<HashMap<String, Vec<DetectionRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All message records, sorted by id.
    pub fn messages(&self) -> Vec<CanonicalMessageRecord> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = messages.values().cloned().collect();
        all.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        all
    }

    /// Number of images with at least one detection row.
    pub fn image_count(&self) -> usize {
        self.detections.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl CanonicalStore for InMemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn write_message(
        &self,
        record: &CanonicalMessageRecord,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, RecordError> {
        let mut messages = self.messages.write().unwrap_or_else(|e| e.into_inner());
        match (messages.get_mut(&record.message_id), policy) {
            (None, _) => {
                messages.insert(record.message_id.clone(), record.clone());
                Ok(WriteOutcome::Inserted)
            }
            (Some(_), ConflictPolicy::Ignore) => Ok(WriteOutcome::Skipped),
            (Some(existing), ConflictPolicy::Update) => {
                *existing = record.clone();
                Ok(WriteOutcome::Updated)
            }
        }
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<CanonicalMessageRecord>> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        Ok(messages.get(message_id).cloned())
    }

    async fn count_messages(&self) -> Result<i64> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        Ok(messages.len() as i64)
    }

    async fn replace_detections(
        &self,
        image_path: &str,
        rows: &[DetectionRecord],
    ) -> Result<(), DetectError> {
        let mut detections = self.detections.write().unwrap_or_else(|e| e.into_inner());
        detections.insert(image_path.to_string(), rows.to_vec());
        Ok(())
    }

    async fn detections_for(&self, image_path: &str) -> Result<Vec<DetectionRecord>> {
        let detections = self.detections.read().unwrap_or_else(|e| e.into_inner());
        Ok(detections.get(image_path).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, views: i64) -> CanonicalMessageRecord {
        CanonicalMessageRecord {
            message_id: id.into(),
            channel_name: "lobelia".into(),
            post_date: Utc::now(),
            message_text: String::new(),
            view_count: views,
            forward_count: 0,
            has_image: false,
            raw_payload: "{}".into(),
        }
    }

    #[tokio::test]
    async fn policies_match_sqlite_semantics() {
        let store = InMemoryStore::new();
        assert_eq!(
            store.write_message(&record("a", 1), ConflictPolicy::Ignore).await.unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            store.write_message(&record("a", 2), ConflictPolicy::Ignore).await.unwrap(),
            WriteOutcome::Skipped
        );
        assert_eq!(store.get_message("a").await.unwrap().unwrap().view_count, 1);
        assert_eq!(
            store.write_message(&record("a", 3), ConflictPolicy::Update).await.unwrap(),
            WriteOutcome::Updated
        );
        assert_eq!(store.get_message("a").await.unwrap().unwrap().view_count, 3);
        assert_eq!(store.count_messages().await.unwrap(), 1);
    }
}
