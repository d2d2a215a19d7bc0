//! Upstream message source abstraction and implementations.
//!
//! Defines the [`MessageSource`] trait and concrete implementations:
//! - **[`DisabledSource`]**: fails every request; used when no source is configured.
//! - **[`HttpSource`]**: talks to a JSON-over-HTTP channel gateway.
//!
//! # Gateway contract
//!
//! ```text
//! GET {base_url}/messages?channel=<url>&limit=<n>[&offset_id=<id>]
//!   200 {"messages": [{"id", "date", "text", "views", "forwards", "media"}]}
//!   429 Retry-After: <secs>   or   {"parameters": {"retry_after": <secs>}}
//! GET {base_url}/media?channel=<url>&message_id=<id>
//!   200 <bytes>
//! ```
//!
//! Messages arrive newest first. `offset_id` asks for messages strictly
//! older than that id, which is how the harvester pages backwards.
//!
//! Wire items are validated exactly once, in [`parse_message`]; everything
//! downstream works with typed [`RawMessage`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::{ChannelConfig, SourceConfig};
use crate::error::SourceError;
use crate::models::{MediaKind, RawMessage};
use crate::preflight::Credentials;

/// Throttle wait used when the source sends 429 without a duration.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// A source of channel messages.
///
/// Implementations do not retry or sleep on throttling. They return
/// [`SourceError::Throttled`] and leave the pause to the
/// [`RateGovernor`](crate::governor::RateGovernor), which is shared across
/// channels.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Identifier for logs (e.g. `"http"`).
    fn name(&self) -> &str;

    /// Fetch up to `limit` messages older than `offset_id` (newest first).
    ///
    /// An empty page means the channel has no older messages.
    async fn fetch_page(
        &self,
        channel: &ChannelConfig,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError>;

    /// Download the media bytes attached to one message.
    async fn download_media(
        &self,
        channel: &ChannelConfig,
        message_id: i64,
    ) -> Result<Vec<u8>, SourceError>;
}

// ============ Disabled Source ============

/// A source that refuses every request.
pub struct DisabledSource;

#[async_trait]
impl MessageSource for DisabledSource {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn fetch_page(
        &self,
        _channel: &ChannelConfig,
        _offset_id: Option<i64>,
        _limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        Err(SourceError::Disabled)
    }

    async fn download_media(
        &self,
        _channel: &ChannelConfig,
        _message_id: i64,
    ) -> Result<Vec<u8>, SourceError> {
        Err(SourceError::Disabled)
    }
}

// ============ HTTP Source ============

/// Client for the HTTP channel gateway.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSource {
    pub fn new(config: &SourceConfig, credentials: &Credentials) -> Result<Self, SourceError> {
        let base_url = config
            .base_url
            .as_ref()
            .ok_or_else(|| SourceError::Network("source.base_url not configured".into()))?
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: credentials.source_token.clone().unwrap_or_default(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response, SourceError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status.as_u16() == 429 {
            let header_wait = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            let wait = header_wait
                .or_else(|| retry_after_from_body(&body))
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(SourceError::Throttled { wait });
        }

        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(SourceError::NotFound(body));
        }
        Err(SourceError::Status {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl MessageSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_page(
        &self,
        channel: &ChannelConfig,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let mut query = vec![
            ("channel", channel.url.clone()),
            ("limit", limit.to_string()),
        ];
        if let Some(offset) = offset_id {
            query.push(("offset_id", offset.to_string()));
        }

        let json: serde_json::Value = self.get("/messages", &query).await?.json().await?;
        parse_page(&json, &channel.name)
    }

    async fn download_media(
        &self,
        channel: &ChannelConfig,
        message_id: i64,
    ) -> Result<Vec<u8>, SourceError> {
        let query = [
            ("channel", channel.url.clone()),
            ("message_id", message_id.to_string()),
        ];
        let bytes = self.get("/media", &query).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Read `parameters.retry_after` (or a top-level `retry_after`) from an error body.
fn retry_after_from_body(body: &str) -> Option<u64> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("parameters")
        .and_then(|p| p.get("retry_after"))
        .or_else(|| json.get("retry_after"))
        .and_then(|v| v.as_u64())
}

/// Parse a gateway page response into typed messages.
pub fn parse_page(json: &serde_json::Value, channel: &str) -> Result<Vec<RawMessage>, SourceError> {
    let items = json
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| SourceError::Malformed("missing messages array".into()))?;

    items.iter().map(|item| parse_message(item, channel)).collect()
}

/// Validate one wire item into a [`RawMessage`].
///
/// `id` and `date` are required; counters and text are optional. Any
/// `media` value marks the message as carrying media; `"photo"` (or an
/// object with `"type": "photo"`) marks it as downloadable.
pub fn parse_message(item: &serde_json::Value, channel: &str) -> Result<RawMessage, SourceError> {
    let message_id = item
        .get("id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| SourceError::Malformed(format!("message without numeric id: {}", item)))?;

    let date_str = item
        .get("date")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SourceError::Malformed(format!("message {} has no date", message_id)))?;
    let date = DateTime::parse_from_rfc3339(date_str)
        .map_err(|e| {
            SourceError::Malformed(format!("message {} has invalid date '{}': {}", message_id, date_str, e))
        })?
        .with_timezone(&Utc);

    let media = match item.get("media") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(kind)) if kind == "photo" => Some(MediaKind::Photo),
        Some(serde_json::Value::Object(obj))
            if obj.get("type").and_then(|t| t.as_str()) == Some("photo") =>
        {
            Some(MediaKind::Photo)
        }
        Some(serde_json::Value::Bool(false)) => None,
        Some(_) => Some(MediaKind::Other),
    };

    Ok(RawMessage {
        message_id,
        channel: channel.to_string(),
        date,
        text: item.get("text").and_then(|v| v.as_str()).map(str::to_string),
        views: item.get("views").and_then(|v| v.as_i64()),
        forwards: item.get("forwards").and_then(|v| v.as_i64()),
        media,
        media_path: None,
        original: item.clone(),
    })
}

/// Create the configured [`MessageSource`].
///
/// # Supported Providers
///
/// | Config Value | Source |
/// |-------------|--------|
/// | `"disabled"` | [`DisabledSource`] |
/// | `"http"` | [`HttpSource`] |
pub fn create_source(
    config: &SourceConfig,
    credentials: &Credentials,
) -> anyhow::Result<Box<dyn MessageSource>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledSource)),
        "http" => Ok(Box::new(HttpSource::new(config, credentials)?)),
        other => anyhow::bail!("Unknown source provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_message() {
        let item = json!({
            "id": 1001,
            "date": "2025-01-14T08:30:00Z",
            "text": "Vitamin C 1000mg available",
            "views": 532,
            "forwards": 4,
            "media": "photo"
        });
        let msg = parse_message(&item, "chemed").unwrap();
        assert_eq!(msg.message_id, 1001);
        assert_eq!(msg.channel, "chemed");
        assert_eq!(msg.views, Some(532));
        assert!(msg.has_photo());
        assert_eq!(msg.original, item);
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let msg = parse_message(&json!({"id": 7, "date": "2025-01-14T08:30:00+03:00"}), "c").unwrap();
        assert_eq!(msg.text, None);
        assert_eq!(msg.views, None);
        assert!(!msg.has_media());
        assert_eq!(msg.date.to_rfc3339(), "2025-01-14T05:30:00+00:00");
    }

    #[test]
    fn non_photo_media_is_not_downloadable() {
        let msg = parse_message(
            &json!({"id": 8, "date": "2025-01-14T08:30:00Z", "media": {"type": "document"}}),
            "c",
        )
        .unwrap();
        assert!(msg.has_media());
        assert!(!msg.has_photo());
    }

    #[test]
    fn missing_id_or_bad_date_is_malformed() {
        let err = parse_message(&json!({"date": "2025-01-14T08:30:00Z"}), "c").unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
        let err = parse_message(&json!({"id": 1, "date": "yesterday"}), "c").unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn page_without_messages_array_is_malformed() {
        assert!(parse_page(&json!({"items": []}), "c").is_err());
        assert!(parse_page(&json!({"messages": []}), "c").unwrap().is_empty());
    }

    #[test]
    fn retry_after_body_forms() {
        assert_eq!(
            retry_after_from_body(r#"{"ok":false,"parameters":{"retry_after":17}}"#),
            Some(17)
        );
        assert_eq!(retry_after_from_body(r#"{"retry_after":3}"#), Some(3));
        assert_eq!(retry_after_from_body("slow down"), None);
    }
}
