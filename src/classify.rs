//! Image classification.
//!
//! Runs a [`Detector`] over harvested images and writes one
//! [`DetectionRecord`] per detected object, or a single sentinel row
//! (`detected_class = "none"`, `confidence_score = 0.0`) when the model
//! finds nothing. Every row of an image carries the image's
//! [`ImageCategory`](crate::models::ImageCategory), derived from the set of
//! detected classes by [`CategoryRules`].
//!
//! All rows of one image are replaced together, so rerunning over the same
//! images reproduces the same rows (given a deterministic model).
//!
//! Images are found either from snapshot entries that reference a saved
//! photo, or by walking `<image_path>/<channel>/` for image files. A failure
//! on one image is logged and reported; the other images continue.
//! `classifier.workers` bounds how many images are in flight at once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ClassifierConfig;
use crate::detect::{Detection, Detector};
use crate::error::DetectError;
use crate::models::{CategoryRules, DetectionRecord, ImageCategory, NO_DETECTION_CLASS};
use crate::raw_store::{Partition, RawStore};
use crate::store::CanonicalStore;

/// An image to classify and the message it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageRef {
    pub path: PathBuf,
    pub message_id: String,
    pub channel_name: String,
}

impl ImageRef {
    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageStatus {
    Classified {
        detections: usize,
        category: ImageCategory,
    },
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ImageOutcome {
    pub image: ImageRef,
    pub status: ImageStatus,
}

/// Build the detection rows for one image.
pub fn detection_rows(
    image: &ImageRef,
    detections: &[Detection],
    rules: &CategoryRules,
) -> Vec<DetectionRecord> {
    let category = rules.categorize(detections.iter().map(|d| d.class.as_str()));
    let row = |class: &str, confidence: f64| DetectionRecord {
        message_id: image.message_id.clone(),
        channel_name: image.channel_name.clone(),
        image_path: image.path_str(),
        detected_class: class.to_string(),
        confidence_score: confidence,
        image_category: category,
    };

    if detections.is_empty() {
        return vec![row(NO_DETECTION_CLASS, 0.0)];
    }
    detections
        .iter()
        .map(|d| row(&d.class, d.confidence))
        .collect()
}

pub struct Classifier {
    detector: Arc<dyn Detector>,
    store: Arc<dyn CanonicalStore>,
    rules: CategoryRules,
    workers: usize,
}

impl Classifier {
    pub fn new(
        config: &ClassifierConfig,
        detector: Arc<dyn Detector>,
        store: Arc<dyn CanonicalStore>,
    ) -> Self {
        Self {
            detector,
            store,
            rules: CategoryRules::new(
                config.person_classes.iter().cloned(),
                config.product_classes.iter().cloned(),
            ),
            workers: config.workers.max(1),
        }
    }

    /// Detect, derive the category, and replace the image's rows.
    pub async fn classify_image(&self, image: &ImageRef) -> Result<Vec<DetectionRecord>, DetectError> {
        let detections = self.detector.detect(&image.path).await?;
        let rows = detection_rows(image, &detections, &self.rules);
        self.store.replace_detections(&image.path_str(), &rows).await?;
        debug!(
            image = %image.path.display(),
            detections = detections.len(),
            category = %rows[0].image_category,
            "classified image"
        );
        Ok(rows)
    }

    /// Classify every image with bounded concurrency.
    ///
    /// Outcomes are returned sorted by image path. Images not yet started
    /// when `cancel` fires are reported as cancelled.
    pub async fn classify_all(
        &self,
        images: &[ImageRef],
        cancel: &CancellationToken,
    ) -> Vec<ImageOutcome> {
        info!(
            images = images.len(),
            workers = self.workers,
            model = self.detector.model_name(),
            "classifying images"
        );

        let mut outcomes: Vec<ImageOutcome> = stream::iter(images.iter().cloned())
            .map(|image| async move {
                let status = if cancel.is_cancelled() {
                    ImageStatus::Cancelled
                } else {
                    match self.classify_image(&image).await {
                        Ok(rows) => ImageStatus::Classified {
                            detections: rows
                                .iter()
                                .filter(|r| r.detected_class != NO_DETECTION_CLASS)
                                .count(),
                            category: rows[0].image_category,
                        },
                        Err(e) => {
                            warn!(image = %image.path.display(), kind = ?e.kind(), error = %e, "classification failed");
                            ImageStatus::Failed(e.to_string())
                        }
                    }
                };
                ImageOutcome { image, status }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        outcomes.sort_by(|a, b| a.image.cmp(&b.image));
        outcomes
    }
}

/// Images referenced by snapshot entries (`image_path` set).
///
/// Unreadable partitions are skipped with a warning; the loader reports
/// them. Each image appears once.
pub async fn discover_from_snapshots(raw: &RawStore, partitions: &[Partition]) -> Vec<ImageRef> {
    let mut images = BTreeMap::new();
    for partition in partitions {
        let entries = match raw.read_partition(partition).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(partition = %partition, error = %format!("{:#}", e), "skipping partition for image discovery");
                continue;
            }
        };
        for image in images_in_entries(&entries) {
            images.insert(image.path.clone(), image);
        }
    }
    images.into_values().collect()
}

fn images_in_entries(entries: &[Value]) -> Vec<ImageRef> {
    entries
        .iter()
        .filter_map(|entry| {
            let path = entry.get("image_path")?.as_str()?;
            let message_id = match entry.get("message_id")? {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => return None,
            };
            let channel_name = entry.get("channel_name")?.as_str()?.to_string();
            Some(ImageRef {
                path: PathBuf::from(path),
                message_id,
                channel_name,
            })
        })
        .collect()
}

/// Images found by walking `<image_root>/<channel>/<message_id>.<ext>`.
///
/// The channel comes from the directory name and the message id from the
/// file stem. Extensions match case-insensitively.
pub fn discover_from_directory(image_root: &Path, extensions: &[String]) -> Result<Vec<ImageRef>> {
    if !image_root.exists() {
        return Ok(Vec::new());
    }

    let patterns: Vec<String> = extensions.iter().map(|ext| format!("*/*.{}", ext)).collect();
    let include_set = build_globset(&patterns)?;

    let mut images = Vec::new();
    for entry in WalkDir::new(image_root).min_depth(2).max_depth(2) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(image_root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if !include_set.is_match(&rel_str) {
            continue;
        }

        let (Some(stem), Some(channel)) = (
            path.file_stem().map(|s| s.to_string_lossy().to_string()),
            path.parent()
                .and_then(|p| p.file_name())
                .map(|s| s.to_string_lossy().to_string()),
        ) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }

        images.push(ImageRef {
            path: path.to_path_buf(),
            message_id: stem,
            channel_name: channel,
        });
    }

    // Sort for deterministic ordering
    images.sort();
    Ok(images)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()?,
        );
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Answers by file name; unknown names fail.
    struct TableDetector {
        answers: HashMap<String, Vec<Detection>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl TableDetector {
        fn new(answers: Vec<(&str, Vec<(&str, f64)>)>) -> Self {
            Self {
                answers: answers
                    .into_iter()
                    .map(|(name, dets)| {
                        (
                            name.to_string(),
                            dets.into_iter().map(|(c, s)| Detection::new(c, s)).collect(),
                        )
                    })
                    .collect(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Detector for TableDetector {
        fn model_name(&self) -> &str {
            "table"
        }

        async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let name = image.file_name().unwrap().to_string_lossy().to_string();
            self.answers
                .get(&name)
                .cloned()
                .ok_or_else(|| DetectError::Request(format!("model crashed on {}", name)))
        }
    }

    fn image(name: &str) -> ImageRef {
        ImageRef {
            path: PathBuf::from(format!("img/chemed/{}", name)),
            message_id: name.split('.').next().unwrap().to_string(),
            channel_name: "chemed".into(),
        }
    }

    fn classifier(detector: Arc<TableDetector>, store: Arc<InMemoryStore>, workers: usize) -> Classifier {
        let config = ClassifierConfig {
            workers,
            ..ClassifierConfig::default()
        };
        Classifier::new(&config, detector, store)
    }

    #[test]
    fn no_detections_yield_sentinel_row() {
        let rows = detection_rows(&image("1.jpg"), &[], &CategoryRules::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].detected_class, "none");
        assert_eq!(rows[0].confidence_score, 0.0);
        assert_eq!(rows[0].image_category, ImageCategory::Other);
    }

    #[test]
    fn every_row_carries_image_category() {
        let dets = vec![Detection::new("person", 0.9), Detection::new("bottle", 0.7)];
        let rows = detection_rows(&image("2.jpg"), &dets, &CategoryRules::default());
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.image_category == ImageCategory::Promotional));
        assert_eq!(rows[0].message_id, "2");
    }

    #[tokio::test]
    async fn failures_are_isolated_per_image() {
        let detector = Arc::new(TableDetector::new(vec![
            ("1.jpg", vec![("person", 0.8)]),
            ("3.jpg", vec![]),
        ]));
        let store = Arc::new(InMemoryStore::new());
        let classifier = classifier(detector, store.clone(), 2);

        let images = vec![image("1.jpg"), image("2.jpg"), image("3.jpg")];
        let outcomes = classifier.classify_all(&images, &CancellationToken::new()).await;

        assert_eq!(
            outcomes[0].status,
            ImageStatus::Classified { detections: 1, category: ImageCategory::Lifestyle }
        );
        assert!(matches!(outcomes[1].status, ImageStatus::Failed(_)));
        assert_eq!(
            outcomes[2].status,
            ImageStatus::Classified { detections: 0, category: ImageCategory::Other }
        );
        assert_eq!(store.image_count(), 2);
    }

    #[tokio::test]
    async fn rerun_reproduces_rows() {
        let detector = Arc::new(TableDetector::new(vec![("1.jpg", vec![("bottle", 0.6), ("bottle", 0.4)])]));
        let store = Arc::new(InMemoryStore::new());
        let classifier = classifier(detector, store.clone(), 1);
        let images = vec![image("1.jpg")];

        classifier.classify_all(&images, &CancellationToken::new()).await;
        let first = store.detections_for("img/chemed/1.jpg").await.unwrap();
        classifier.classify_all(&images, &CancellationToken::new()).await;
        let second = store.detections_for("img/chemed/1.jpg").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].image_category, ImageCategory::ProductDisplay);
    }

    #[tokio::test]
    async fn worker_count_bounds_concurrency() {
        let names: Vec<String> = (0..8).map(|i| format!("{}.jpg", i)).collect();
        let answers = names.iter().map(|n| (n.as_str(), vec![])).collect();
        let detector = Arc::new(TableDetector::new(answers));
        let store = Arc::new(InMemoryStore::new());
        let classifier = classifier(detector.clone(), store, 2);

        let images: Vec<ImageRef> = names.iter().map(|n| image(n)).collect();
        classifier.classify_all(&images, &CancellationToken::new()).await;
        assert!(detector.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_run_skips_images() {
        let detector = Arc::new(TableDetector::new(vec![("1.jpg", vec![])]));
        let store = Arc::new(InMemoryStore::new());
        let classifier = classifier(detector, store.clone(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = classifier.classify_all(&[image("1.jpg")], &cancel).await;
        assert_eq!(outcomes[0].status, ImageStatus::Cancelled);
        assert_eq!(store.image_count(), 0);
    }

    #[test]
    fn directory_discovery() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for rel in [
            "chemed/10.jpg",
            "chemed/11.PNG",
            "chemed/notes.txt",
            "lobelia/5.jpeg",
            "stray.jpg",
            "lobelia/nested/6.jpg",
        ] {
            let p = root.join(rel);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, b"img").unwrap();
        }

        let images = discover_from_directory(root, &ClassifierConfig::default().image_extensions).unwrap();
        let found: Vec<(String, String)> = images
            .iter()
            .map(|i| (i.channel_name.clone(), i.message_id.clone()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("chemed".to_string(), "10".to_string()),
                ("chemed".to_string(), "11".to_string()),
                ("lobelia".to_string(), "5".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_discovery_dedupes() {
        let tmp = TempDir::new().unwrap();
        let raw = RawStore::new(tmp.path());
        let entry = |id: i64, path: Option<&str>| {
            serde_json::json!({
                "message_id": id,
                "channel_name": "chemed",
                "message_date": "2025-01-14T08:30:00Z",
                "has_media": path.is_some(),
                "image_path": path,
            })
        };
        for (day, entries) in [
            ("2025-01-14", vec![entry(1, Some("img/chemed/1.jpg")), entry(2, None)]),
            ("2025-01-15", vec![entry(1, Some("img/chemed/1.jpg")), entry(3, Some("img/chemed/3.jpg"))]),
        ] {
            let d = chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap();
            let path = raw.partition_path("chemed", d);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, serde_json::to_vec(&entries).unwrap()).unwrap();
        }

        let partitions = raw.list_partitions(None).unwrap();
        let images = discover_from_snapshots(&raw, &partitions).await;
        let ids: Vec<&str> = images.iter().map(|i| i.message_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }
}
