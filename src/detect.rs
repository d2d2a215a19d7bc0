//! Object detection backends.
//!
//! Defines the [`Detector`] trait and concrete implementations:
//! - **[`DisabledDetector`]**: fails every image; used when no model is configured.
//! - **[`HttpDetector`]**: posts images to an inference endpoint serving the model.
//!
//! The model itself is opaque: an image goes in, zero or more
//! `(class, confidence)` pairs come out. Classification results are only as
//! reproducible as the model is deterministic for a given image.
//!
//! # Inference endpoint contract
//!
//! ```text
//! POST {endpoint}
//!   {"model": "<model>", "image": "<base64 bytes>"}
//! 200
//!   {"detections": [{"class": "person", "confidence": 0.91}, ...]}
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::DetectError;

/// One detected object.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: String,
    pub confidence: f64,
}

impl Detection {
    pub fn new(class: impl Into<String>, confidence: f64) -> Self {
        Self {
            class: class.into(),
            confidence,
        }
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Returns the model identifier (e.g. `"yolov8n"`).
    fn model_name(&self) -> &str;

    /// Run detection on one image file.
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectError>;
}

// ============ Disabled Detector ============

pub struct DisabledDetector;

#[async_trait]
impl Detector for DisabledDetector {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn detect(&self, _image: &Path) -> Result<Vec<Detection>, DetectError> {
        Err(DetectError::Disabled)
    }
}

// ============ HTTP Detector ============

pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_retries: u32,
}

impl HttpDetector {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("classifier.endpoint required"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("classifier.model required"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            model,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectError> {
        let bytes = tokio::fs::read(image).await.map_err(|source| DetectError::Read {
            path: image.display().to_string(),
            source,
        })?;

        let body = serde_json::json!({
            "model": self.model,
            "image": base64::engine::general_purpose::STANDARD.encode(&bytes),
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(image = %image.display(), attempt, "retrying detection");
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&self.endpoint).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_detections(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = DetectError::Request(format!("detector error {}: {}", status, body_text));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DetectError::Request("detection failed after retries".into())))
    }
}

/// Parse an inference response into detections.
///
/// Accepts `class` or `name` for the label and `confidence` or `score` for
/// the score. A score outside `[0, 1]` rejects the whole response.
pub fn parse_detections(json: &serde_json::Value) -> Result<Vec<Detection>, DetectError> {
    let items = json
        .get("detections")
        .and_then(|d| d.as_array())
        .ok_or_else(|| DetectError::InvalidResponse("missing detections array".into()))?;

    items
        .iter()
        .map(|item| {
            let class = item
                .get("class")
                .or_else(|| item.get("name"))
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .ok_or_else(|| DetectError::InvalidResponse(format!("detection without class: {}", item)))?;
            let confidence = item
                .get("confidence")
                .or_else(|| item.get("score"))
                .and_then(|c| c.as_f64())
                .ok_or_else(|| {
                    DetectError::InvalidResponse(format!("detection without confidence: {}", item))
                })?;
            if !(0.0..=1.0).contains(&confidence) {
                return Err(DetectError::InvalidResponse(format!(
                    "confidence {} out of range for '{}'",
                    confidence, class
                )));
            }
            Ok(Detection::new(class, confidence))
        })
        .collect()
}

/// Create the configured [`Detector`].
///
/// # Supported Providers
///
/// | Config Value | Detector |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledDetector`] |
/// | `"http"` | [`HttpDetector`] |
pub fn create_detector(config: &ClassifierConfig) -> Result<Box<dyn Detector>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledDetector)),
        "http" => Ok(Box::new(HttpDetector::new(config)?)),
        other => bail!("Unknown classifier provider: {}", other),
    }
}
