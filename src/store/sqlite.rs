//! SQLite-backed [`CanonicalStore`].
//!
//! `message_id` is the table's primary key, so concurrent inserts of the
//! same key resolve inside SQLite: exactly one wins and the others see a
//! conflict.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::{Config, ConflictPolicy};
use crate::db;
use crate::error::{DetectError, RecordError};
use crate::migrate;
use crate::models::{CanonicalMessageRecord, DetectionRecord, ImageCategory};

use super::{CanonicalStore, WriteOutcome};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &Config) -> Result<Self> {
        Ok(Self::new(db::connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Canonical text form of a post date (`2025-01-14T08:30:00Z`).
pub fn format_post_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn row_to_message(row: &SqliteRow) -> Result<CanonicalMessageRecord> {
    let post_date: String = row.get("post_date");
    Ok(CanonicalMessageRecord {
        message_id: row.get("message_id"),
        channel_name: row.get("channel_name"),
        post_date: DateTime::parse_from_rfc3339(&post_date)?.with_timezone(&Utc),
        message_text: row.get("message_text"),
        view_count: row.get("view_count"),
        forward_count: row.get("forward_count"),
        has_image: row.get("has_image"),
        raw_payload: row.get("raw_payload"),
    })
}

/// Unknown category labels read back as [`ImageCategory::Other`].
pub(crate) fn row_to_detection(row: &SqliteRow) -> DetectionRecord {
    let category: String = row.get("image_category");
    DetectionRecord {
        message_id: row.get("message_id"),
        channel_name: row.get("channel_name"),
        image_path: row.get("image_path"),
        detected_class: row.get("detected_class"),
        confidence_score: row.get("confidence_score"),
        image_category: ImageCategory::parse(&category).unwrap_or(ImageCategory::Other),
    }
}

#[async_trait]
impl CanonicalStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        migrate::create_schema(&self.pool).await?;
        Ok(())
    }

    async fn write_message(
        &self,
        record: &CanonicalMessageRecord,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, RecordError> {
        let post_date = format_post_date(&record.post_date);

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (message_id, channel_name, post_date, message_text,
                                  view_count, forward_count, has_image, raw_payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.channel_name)
        .bind(&post_date)
        .bind(&record.message_text)
        .bind(record.view_count)
        .bind(record.forward_count)
        .bind(record.has_image)
        .bind(&record.raw_payload)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(WriteOutcome::Inserted);
        }

        match policy {
            ConflictPolicy::Ignore => Ok(WriteOutcome::Skipped),
            ConflictPolicy::Update => {
                sqlx::query(
                    r#"
                    UPDATE messages SET
                        channel_name = ?,
                        post_date = ?,
                        message_text = ?,
                        view_count = ?,
                        forward_count = ?,
                        has_image = ?,
                        raw_payload = ?
                    WHERE message_id = ?
                    "#,
                )
                .bind(&record.channel_name)
                .bind(&post_date)
                .bind(&record.message_text)
                .bind(record.view_count)
                .bind(record.forward_count)
                .bind(record.has_image)
                .bind(&record.raw_payload)
                .bind(&record.message_id)
                .execute(&self.pool)
                .await?;
                Ok(WriteOutcome::Updated)
            }
        }
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<CanonicalMessageRecord>> {
        let row = sqlx::query(
            "SELECT message_id, channel_name, post_date, message_text, view_count, \
             forward_count, has_image, raw_payload FROM messages WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn count_messages(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn replace_detections(
        &self,
        image_path: &str,
        rows: &[DetectionRecord],
    ) -> Result<(), DetectError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM image_detections WHERE image_path = ?")
            .bind(image_path)
            .execute(&mut *tx)
            .await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO image_detections (message_id, channel_name, image_path,
                                              detected_class, confidence_score, image_category)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.message_id)
            .bind(&row.channel_name)
            .bind(image_path)
            .bind(&row.detected_class)
            .bind(row.confidence_score)
            .bind(row.image_category.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn detections_for(&self, image_path: &str) -> Result<Vec<DetectionRecord>> {
        let rows = sqlx::query(
            "SELECT message_id, channel_name, image_path, detected_class, confidence_score, \
             image_category FROM image_detections WHERE image_path = ? ORDER BY id",
        )
        .bind(image_path)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_detection).collect())
    }
}
