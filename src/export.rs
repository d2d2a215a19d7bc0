//! Export detection rows as JSON.
//!
//! Produces the tabular detection output (one row per detected object, plus
//! sentinel rows for images without detections) for downstream transform
//! tooling that cannot read SQLite directly.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::models::DetectionRecord;
use crate::store::sqlite::row_to_detection;
use crate::store::SqliteStore;

#[derive(Serialize)]
struct ExportData {
    generated_at: String,
    detections: Vec<DetectionRecord>,
}

/// Export every detection row as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, output: Option<&Path>) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let detections = all_detections(&store).await?;

    let count = detections.len();
    let data = ExportData {
        generated_at: chrono::Utc::now().to_rfc3339(),
        detections,
    };
    let json = serde_json::to_string_pretty(&data)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)?;
            eprintln!("Exported {} detections to {}", count, path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    store.close().await;
    Ok(())
}

async fn all_detections(store: &SqliteStore) -> Result<Vec<DetectionRecord>> {
    let rows = sqlx::query(
        "SELECT message_id, channel_name, image_path, detected_class, confidence_score, \
         image_category FROM image_detections ORDER BY image_path, id",
    )
    .fetch_all(store.pool())
    .await?;
    Ok(rows.iter().map(row_to_detection).collect())
}
