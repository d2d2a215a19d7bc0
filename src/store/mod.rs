//! Canonical record store abstraction.
//!
//! The [`CanonicalStore`] trait is the only way the loader and classifier
//! touch durable records, so both can be exercised against the in-memory
//! backend in tests and against SQLite in production.
//!
//! | Backend | Module |
//! |---------|--------|
//! | [`SqliteStore`] | [`sqlite`] |
//! | [`InMemoryStore`] | [`memory`] |
//!
//! Implementations must enforce at most one message row per `message_id`
//! themselves. The loader runs several workers against one store without
//! any application-level lock.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ConflictPolicy;
use crate::error::{DetectError, RecordError};
use crate::models::{CanonicalMessageRecord, DetectionRecord};

/// What a single message write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// The key already existed and the policy kept the existing row.
    Skipped,
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Create tables and indexes if absent. Safe to call repeatedly.
    async fn ensure_schema(&self) -> Result<()>;

    /// Write one message record according to `policy`.
    async fn write_message(
        &self,
        record: &CanonicalMessageRecord,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, RecordError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<CanonicalMessageRecord>>;

    async fn count_messages(&self) -> Result<i64>;

    /// Replace every detection row of `image_path` with `rows`, atomically.
    async fn replace_detections(
        &self,
        image_path: &str,
        rows: &[DetectionRecord],
    ) -> Result<(), DetectError>;

    /// Detection rows of one image, in insertion order.
    async fn detections_for(&self, image_path: &str) -> Result<Vec<DetectionRecord>>;
}
