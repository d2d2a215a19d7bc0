//! Canonical store statistics.
//!
//! Provides a quick summary of what has been loaded: message counts per
//! channel, the newest post per channel, and detections per image
//! category. Used by `harvest stats` to confirm that harvests, loads, and
//! classification runs are landing where expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::raw_store::RawStore;

/// Per-channel breakdown of loaded messages.
struct ChannelStats {
    channel: String,
    message_count: i64,
    image_count: i64,
    last_post: Option<String>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await?;

    let total_images: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT image_path) FROM image_detections")
            .fetch_one(&pool)
            .await?;

    let total_detections: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM image_detections WHERE detected_class != 'none'")
            .fetch_one(&pool)
            .await?;

    let partitions = RawStore::from_config(config).list_partitions(None)?.len();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Channel Harvest: Store Stats");
    println!("============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Partitions:  {}", partitions);
    println!();
    println!("  Messages:    {}", total_messages);
    println!("  Images:      {}", total_images);
    println!("  Detections:  {}", total_detections);

    // Per-channel breakdown
    let channel_rows = sqlx::query(
        r#"
        SELECT
            channel_name,
            COUNT(*) AS message_count,
            SUM(has_image) AS image_count,
            MAX(post_date) AS last_post
        FROM messages
        GROUP BY channel_name
        ORDER BY message_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let channel_stats: Vec<ChannelStats> = channel_rows
        .iter()
        .map(|row| ChannelStats {
            channel: row.get("channel_name"),
            message_count: row.get("message_count"),
            image_count: row.get::<Option<i64>, _>("image_count").unwrap_or(0),
            last_post: row.get("last_post"),
        })
        .collect();

    if !channel_stats.is_empty() {
        println!();
        println!("  By channel:");
        println!(
            "  {:<24} {:>8} {:>8}   {}",
            "CHANNEL", "MESSAGES", "IMAGES", "LAST POST"
        );
        println!("  {}", "-".repeat(64));

        for s in &channel_stats {
            let post_display = s
                .last_post
                .as_deref()
                .and_then(|p| chrono::DateTime::parse_from_rfc3339(p).ok())
                .map(|dt| format_ts_relative(dt.timestamp()))
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {:<24} {:>8} {:>8}   {}",
                s.channel, s.message_count, s.image_count, post_display
            );
        }
    }

    // Images per derived category
    let category_rows = sqlx::query(
        r#"
        SELECT image_category, COUNT(DISTINCT image_path) AS images
        FROM image_detections
        GROUP BY image_category
        ORDER BY images DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !category_rows.is_empty() {
        println!();
        println!("  By image category:");
        for row in &category_rows {
            let category: String = row.get("image_category");
            let images: i64 = row.get("images");
            println!("  {:<24} {:>8}", category, images);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
