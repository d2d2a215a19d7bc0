//! Date-partitioned raw snapshot files.
//!
//! Every harvested batch lands in exactly one partition keyed by
//! `(channel, day)`:
//!
//! ```text
//! <raw_data_path>/
//!   2025-01-14/
//!     chemed.json
//!     lobelia.json
//!   2025-01-15/
//!     chemed.json
//! ```
//!
//! A partition is a pretty-printed JSON array of [`SnapshotEntry`] values.
//! Writes go to a hidden temporary file in the same directory and are then
//! renamed into place, so readers see either the previous partition or the
//! new one, never a torn file. Writes to the same key are serialized;
//! different keys proceed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{RawMessage, SnapshotEntry};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// One `(channel, day)` snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Partition {
    pub day: NaiveDate,
    pub channel: String,
    pub path: PathBuf,
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.day.format(DAY_FORMAT), self.channel)
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct RawStore {
    root: PathBuf,
    locks: Mutex<HashMap<(String, NaiveDate), KeyLock>>,
}

impl RawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.storage.raw_data_path)
    }

    pub fn partition_path(&self, channel: &str, day: NaiveDate) -> PathBuf {
        self.root
            .join(day.format(DAY_FORMAT).to_string())
            .join(format!("{}.json", channel))
    }

    fn key_lock(&self, channel: &str, day: NaiveDate) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((channel.to_string(), day))
            .or_default()
            .clone()
    }

    /// Drop the map entry for a key once no other writer holds or awaits it.
    fn release_key_lock(&self, channel: &str, day: NaiveDate, lock: KeyLock) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let key = (channel.to_string(), day);
        // One reference lives in the map, the other is `lock`.
        let idle = locks
            .get(&key)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
        if idle {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Write (or replace) the partition for `(channel, day)`.
    pub async fn write_partition(
        &self,
        channel: &str,
        day: NaiveDate,
        messages: &[RawMessage],
    ) -> Result<Partition> {
        let entries: Vec<SnapshotEntry> = messages.iter().map(SnapshotEntry::from).collect();
        let json = serde_json::to_vec_pretty(&entries)?;
        let path = self.partition_path(channel, day);

        let lock = self.key_lock(channel, day);
        let written = {
            let _guard = lock.lock().await;
            write_atomic(&path, &json).await
        };
        self.release_key_lock(channel, day, lock);
        written.with_context(|| format!("Failed to write partition {}", path.display()))?;

        info!(
            partition = %path.display(),
            channel,
            messages = entries.len(),
            "wrote snapshot partition"
        );

        Ok(Partition {
            day,
            channel: channel.to_string(),
            path,
        })
    }

    /// All partitions, or only those of `day`, sorted by day then channel.
    pub fn list_partitions(&self, day: Option<NaiveDate>) -> Result<Vec<Partition>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut partitions = Vec::new();
        for day_entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?
        {
            let day_entry = day_entry?;
            if !day_entry.file_type()?.is_dir() {
                continue;
            }
            let name = day_entry.file_name().to_string_lossy().to_string();
            let Ok(dir_day) = NaiveDate::parse_from_str(&name, DAY_FORMAT) else {
                debug!(dir = %name, "skipping non-partition directory");
                continue;
            };
            if day.is_some_and(|d| d != dir_day) {
                continue;
            }

            for file in std::fs::read_dir(day_entry.path())? {
                let file = file?;
                let path = file.path();
                let file_name = file.file_name().to_string_lossy().to_string();
                if file_name.starts_with('.') || !file.file_type()?.is_file() {
                    continue;
                }
                let Some(channel) = file_name.strip_suffix(".json") else {
                    continue;
                };
                partitions.push(Partition {
                    day: dir_day,
                    channel: channel.to_string(),
                    path,
                });
            }
        }

        partitions.sort();
        Ok(partitions)
    }

    /// The entries of one partition as untyped JSON records.
    ///
    /// Records are left untyped so the loader can reject them one by one.
    /// A file that is not a JSON array is an error for the whole partition.
    pub async fn read_partition(&self, partition: &Partition) -> Result<Vec<serde_json::Value>> {
        let content = tokio::fs::read(&partition.path)
            .await
            .with_context(|| format!("Failed to read partition {}", partition.path.display()))?;
        let value: serde_json::Value = serde_json::from_slice(&content)
            .with_context(|| format!("Partition {} is not valid JSON", partition))?;
        match value {
            serde_json::Value::Array(items) => Ok(items),
            _ => anyhow::bail!("Partition {} is not a JSON array", partition),
        }
    }
}

/// Write `bytes` to `path` through a temporary sibling and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
