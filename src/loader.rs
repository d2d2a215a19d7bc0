//! Snapshot loading into the canonical store.
//!
//! Each snapshot entry is mapped to a [`CanonicalMessageRecord`] and written
//! through [`CanonicalStore::write_message`] keyed by `message_id`. With the
//! default [`ConflictPolicy::Ignore`] an existing row is never touched, so
//! late corrections to view or forward counts are dropped; choose
//! [`ConflictPolicy::Update`] for latest-wins.
//!
//! Failures are isolated at two levels:
//!
//! - a record that cannot be mapped or written is counted in
//!   [`LoadOutcome::rows_failed`] and the partition continues;
//! - a partition file that cannot be read or is not a JSON array fails on
//!   its own and the remaining partitions continue.
//!
//! Records within a partition are written by `loader.workers` concurrent
//! workers. Uniqueness comes from the store, not from a lock here.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConflictPolicy, LoaderConfig};
use crate::error::RecordError;
use crate::models::CanonicalMessageRecord;
use crate::raw_store::{Partition, RawStore};
use crate::store::{CanonicalStore, WriteOutcome};

/// Counters for one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub rows_seen: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_skipped: u64,
    pub rows_failed: u64,
}

impl LoadOutcome {
    pub fn merge(&mut self, other: &LoadOutcome) {
        self.rows_seen += other.rows_seen;
        self.rows_inserted += other.rows_inserted;
        self.rows_updated += other.rows_updated;
        self.rows_skipped += other.rows_skipped;
        self.rows_failed += other.rows_failed;
    }

    fn record(&mut self, result: &Result<WriteOutcome, RecordError>) {
        self.rows_seen += 1;
        match result {
            Ok(WriteOutcome::Inserted) => self.rows_inserted += 1,
            Ok(WriteOutcome::Updated) => self.rows_updated += 1,
            Ok(WriteOutcome::Skipped) => self.rows_skipped += 1,
            Err(_) => self.rows_failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PartitionStatus {
    Loaded(LoadOutcome),
    Failed(String),
    /// Not attempted because the run was cancelled.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PartitionLoad {
    pub partition: Partition,
    pub status: PartitionStatus,
}

pub struct Loader {
    store: Arc<dyn CanonicalStore>,
    policy: ConflictPolicy,
    workers: usize,
}

impl Loader {
    pub fn new(store: Arc<dyn CanonicalStore>, config: &LoaderConfig) -> Self {
        Self {
            store,
            policy: config.on_conflict,
            workers: config.workers.max(1),
        }
    }

    /// Map and write a batch of snapshot entries.
    pub async fn load_entries(&self, label: &str, entries: Vec<Value>) -> LoadOutcome {
        let results: Vec<Result<WriteOutcome, RecordError>> = stream::iter(entries)
            .map(|entry| async move {
                let record = map_entry(&entry)?;
                self.store.write_message(&record, self.policy).await
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut outcome = LoadOutcome::default();
        for result in &results {
            if let Err(e) = result {
                warn!(partition = label, kind = ?e.kind(), error = %e, "skipping record");
            }
            outcome.record(result);
        }
        outcome
    }

    pub async fn load_partition(
        &self,
        raw: &RawStore,
        partition: &Partition,
    ) -> anyhow::Result<LoadOutcome> {
        let entries = raw.read_partition(partition).await?;
        let label = partition.to_string();
        let outcome = self.load_entries(&label, entries).await;
        info!(
            partition = %label,
            seen = outcome.rows_seen,
            inserted = outcome.rows_inserted,
            updated = outcome.rows_updated,
            skipped = outcome.rows_skipped,
            failed = outcome.rows_failed,
            "loaded partition"
        );
        Ok(outcome)
    }

    /// Load partitions one after another, stopping at cancellation.
    pub async fn load_partitions(
        &self,
        raw: &RawStore,
        partitions: &[Partition],
        cancel: &CancellationToken,
    ) -> Vec<PartitionLoad> {
        let mut loads = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let status = if cancel.is_cancelled() {
                PartitionStatus::Cancelled
            } else {
                match self.load_partition(raw, partition).await {
                    Ok(outcome) => PartitionStatus::Loaded(outcome),
                    Err(e) => {
                        warn!(partition = %partition, error = %format!("{:#}", e), "partition load failed");
                        PartitionStatus::Failed(format!("{:#}", e))
                    }
                }
            };
            loads.push(PartitionLoad {
                partition: partition.clone(),
                status,
            });
        }
        loads
    }
}

/// Map one snapshot entry to a canonical record.
///
/// `message_id`, `channel_name` and `message_date` are required. Text,
/// counters and the media flag default to empty/zero/false when absent or
/// null. The whole entry is kept as `raw_payload`.
pub fn map_entry(entry: &Value) -> Result<CanonicalMessageRecord, RecordError> {
    let obj = entry.as_object().ok_or_else(|| RecordError::InvalidField {
        field: "entry",
        reason: "not a JSON object".into(),
    })?;

    let message_id = match obj.get("message_id") {
        None | Some(Value::Null) => return Err(RecordError::MissingField("message_id")),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(other) => {
            return Err(RecordError::InvalidField {
                field: "message_id",
                reason: format!("expected integer or string, got {}", other),
            })
        }
    };

    let channel_name = match obj.get("channel_name") {
        None | Some(Value::Null) => return Err(RecordError::MissingField("channel_name")),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(other) => {
            return Err(RecordError::InvalidField {
                field: "channel_name",
                reason: format!("expected non-empty string, got {}", other),
            })
        }
    };

    let post_date = match obj.get("message_date") {
        None | Some(Value::Null) => return Err(RecordError::MissingField("message_date")),
        Some(Value::String(s)) => parse_date(s).ok_or_else(|| RecordError::InvalidField {
            field: "message_date",
            reason: format!("unparseable timestamp '{}'", s),
        })?,
        Some(other) => {
            return Err(RecordError::InvalidField {
                field: "message_date",
                reason: format!("expected timestamp string, got {}", other),
            })
        }
    };

    let message_text = match obj.get("message_text") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(RecordError::InvalidField {
                field: "message_text",
                reason: format!("expected string, got {}", other),
            })
        }
    };

    let has_image = match obj.get("has_media") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(RecordError::InvalidField {
                field: "has_media",
                reason: format!("expected boolean, got {}", other),
            })
        }
    };

    Ok(CanonicalMessageRecord {
        message_id,
        channel_name,
        post_date,
        message_text,
        view_count: counter(obj.get("views"), "views")?,
        forward_count: counter(obj.get("forwards"), "forwards")?,
        has_image,
        raw_payload: entry.to_string(),
    })
}

fn counter(value: Option<&Value>, field: &'static str) -> Result<i64, RecordError> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) if v >= 0 => Ok(v),
            _ => Err(RecordError::InvalidField {
                field,
                reason: format!("expected non-negative integer, got {}", n),
            }),
        },
        Some(other) => Err(RecordError::InvalidField {
            field,
            reason: format!("expected integer, got {}", other),
        }),
    }
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn entry(id: i64, views: i64) -> Value {
        json!({
            "message_id": id,
            "channel_name": "chemed",
            "message_date": "2025-01-14T08:30:00+00:00",
            "message_text": "Paracetamol 500mg",
            "views": views,
            "forwards": 1,
            "has_media": id % 2 == 0,
            "image_path": null,
            "raw": {"id": id}
        })
    }

    fn loader(store: Arc<InMemoryStore>, policy: ConflictPolicy) -> Loader {
        Loader::new(
            store,
            &LoaderConfig {
                on_conflict: policy,
                workers: 3,
            },
        )
    }

    #[test]
    fn maps_full_entry() {
        let record = map_entry(&entry(42, 300)).unwrap();
        assert_eq!(record.message_id, "42");
        assert_eq!(record.channel_name, "chemed");
        assert_eq!(record.view_count, 300);
        assert!(record.has_image);
        let raw: Value = serde_json::from_str(&record.raw_payload).unwrap();
        assert_eq!(raw["raw"]["id"], 42);
    }

    #[test]
    fn optional_fields_default() {
        let record = map_entry(&json!({
            "message_id": "77",
            "channel_name": "lobelia",
            "message_date": "2025-01-14T08:30:00"
        }))
        .unwrap();
        assert_eq!(record.message_text, "");
        assert_eq!(record.view_count, 0);
        assert_eq!(record.forward_count, 0);
        assert!(!record.has_image);
        assert_eq!(record.post_date.to_rfc3339(), "2025-01-14T08:30:00+00:00");
    }

    #[test]
    fn malformed_required_fields_fail() {
        let mut missing = entry(1, 1);
        missing.as_object_mut().unwrap().remove("message_id");
        assert!(matches!(map_entry(&missing), Err(RecordError::MissingField("message_id"))));

        let mut bad_date = entry(1, 1);
        bad_date["message_date"] = json!("last tuesday");
        assert!(matches!(
            map_entry(&bad_date),
            Err(RecordError::InvalidField { field: "message_date", .. })
        ));

        let mut bad_views = entry(1, 1);
        bad_views["views"] = json!("lots");
        assert!(map_entry(&bad_views).is_err());

        assert!(map_entry(&json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn one_malformed_record_of_five() {
        let store = Arc::new(InMemoryStore::new());
        let loader = loader(store.clone(), ConflictPolicy::Ignore);

        let mut entries: Vec<Value> = (1..=5).map(|id| entry(id, id * 10)).collect();
        entries[2]["message_date"] = json!(12345);

        let outcome = loader.load_entries("test", entries).await;
        assert_eq!(outcome.rows_seen, 5);
        assert_eq!(outcome.rows_inserted, 4);
        assert_eq!(outcome.rows_failed, 1);
        assert_eq!(store.count_messages().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn reload_is_idempotent_and_keeps_first_counts() {
        let store = Arc::new(InMemoryStore::new());
        let loader = loader(store.clone(), ConflictPolicy::Ignore);

        let first: Vec<Value> = (1..=3).map(|id| entry(id, 10)).collect();
        loader.load_entries("day1", first.clone()).await;
        let again = loader.load_entries("day1", first).await;
        assert_eq!(again.rows_skipped, 3);
        assert_eq!(again.rows_inserted, 0);

        let revisited = loader.load_entries("day2", vec![entry(2, 999)]).await;
        assert_eq!(revisited.rows_skipped, 1);
        assert_eq!(store.get_message("2").await.unwrap().unwrap().view_count, 10);
        assert_eq!(store.count_messages().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn update_policy_is_latest_wins() {
        let store = Arc::new(InMemoryStore::new());
        let loader = loader(store.clone(), ConflictPolicy::Update);

        loader.load_entries("day1", vec![entry(2, 10)]).await;
        let outcome = loader.load_entries("day2", vec![entry(2, 999)]).await;
        assert_eq!(outcome.rows_updated, 1);
        assert_eq!(store.get_message("2").await.unwrap().unwrap().view_count, 999);
    }

    #[tokio::test]
    async fn duplicate_ids_within_one_batch_collapse() {
        let store = Arc::new(InMemoryStore::new());
        let loader = loader(store.clone(), ConflictPolicy::Ignore);

        let entries = vec![entry(5, 1), entry(5, 2), entry(5, 3), entry(6, 1)];
        let outcome = loader.load_entries("dupes", entries).await;
        assert_eq!(outcome.rows_inserted, 2);
        assert_eq!(outcome.rows_skipped, 2);
        assert_eq!(store.count_messages().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn bad_partition_does_not_stop_others() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raw = RawStore::new(tmp.path());
        let day = chrono::NaiveDate::from_ymd_opt(2025, 1, 14).unwrap();

        let good = raw.partition_path("a", day);
        std::fs::create_dir_all(good.parent().unwrap()).unwrap();
        std::fs::write(&good, serde_json::to_vec(&vec![entry(1, 1), entry(2, 2)]).unwrap()).unwrap();
        std::fs::write(raw.partition_path("b", day), "{not json").unwrap();

        let store = Arc::new(InMemoryStore::new());
        let loader = loader(store.clone(), ConflictPolicy::Ignore);
        let partitions = raw.list_partitions(Some(day)).unwrap();
        let loads = loader
            .load_partitions(&raw, &partitions, &CancellationToken::new())
            .await;

        assert!(matches!(loads[0].status, PartitionStatus::Loaded(o) if o.rows_inserted == 2));
        assert!(matches!(loads[1].status, PartitionStatus::Failed(_)));
        assert_eq!(store.count_messages().await.unwrap(), 2);
    }
}
