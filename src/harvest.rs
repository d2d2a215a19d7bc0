//! Channel harvesting.
//!
//! A [`ChannelCursor`] walks one channel backwards from the newest message,
//! one page at a time, and hands out messages one by one. It is lazy (no
//! request is made until a message is asked for) and interruptible at
//! request boundaries:
//!
//! - **Throttling**: a [`SourceError::Throttled`] response suspends the
//!   shared [`RateGovernor`]; the same request is reissued once the pause
//!   ends. Paging is keyed on the last *emitted* id, so a retried request
//!   neither skips nor repeats messages.
//! - **Cancellation**: checked before every request. Messages already
//!   emitted stay with the caller.
//! - **Failure**: any other source error ends the channel; the messages
//!   emitted so far are kept as a partial result.
//!
//! [`ChannelHarvester::harvest_all`] runs several cursors concurrently
//! (bounded by `harvest.max_concurrent_channels`). They share one governor,
//! so a throttle seen by one channel pauses all of them.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, Config};
use crate::error::{HarvestError, SourceError};
use crate::governor::RateGovernor;
use crate::models::RawMessage;
use crate::raw_store::write_atomic;
use crate::source::MessageSource;

/// How a channel harvest ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestStatus {
    Complete,
    /// Stopped by a per-channel failure; `messages` holds what was fetched.
    Partial { error: String },
    /// Stopped by operator cancellation; `messages` holds what was fetched.
    Cancelled,
}

/// The result of harvesting one channel.
#[derive(Debug, Clone)]
pub struct ChannelHarvest {
    pub channel: String,
    pub messages: Vec<RawMessage>,
    pub status: HarvestStatus,
}

/// Issue a source request through the governor, retrying after throttles.
async fn governed<T, F, Fut>(
    governor: &RateGovernor,
    cancel: &CancellationToken,
    mut request: F,
) -> Result<T, HarvestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    loop {
        governor.ready(cancel).await?;
        match request().await {
            Err(SourceError::Throttled { wait }) => governor.suspend(wait),
            other => return other.map_err(HarvestError::from),
        }
    }
}

/// Lazy, resumable iteration over one channel's messages, newest first.
pub struct ChannelCursor<'a> {
    source: &'a dyn MessageSource,
    governor: &'a RateGovernor,
    cancel: &'a CancellationToken,
    channel: &'a ChannelConfig,
    page_size: usize,
    remaining: usize,
    last_id: Option<i64>,
    buffer: VecDeque<RawMessage>,
    exhausted: bool,
    emitted: usize,
}

impl<'a> ChannelCursor<'a> {
    pub fn new(
        source: &'a dyn MessageSource,
        governor: &'a RateGovernor,
        cancel: &'a CancellationToken,
        channel: &'a ChannelConfig,
        page_size: usize,
        limit: usize,
    ) -> Self {
        Self {
            source,
            governor,
            cancel,
            channel,
            page_size: page_size.max(1),
            remaining: limit,
            last_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
            emitted: 0,
        }
    }

    /// Number of messages handed out so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Next message, `Ok(None)` at the end of the channel or the limit.
    pub async fn next(&mut self) -> Result<Option<RawMessage>, HarvestError> {
        loop {
            if self.remaining == 0 {
                return Ok(None);
            }
            if let Some(msg) = self.buffer.pop_front() {
                self.last_id = Some(msg.message_id);
                self.remaining -= 1;
                self.emitted += 1;
                return Ok(Some(msg));
            }
            if self.exhausted {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }

            let (source, channel, offset) = (self.source, self.channel, self.last_id);
            let limit = self.page_size.min(self.remaining);
            let page = governed(self.governor, self.cancel, move || {
                source.fetch_page(channel, offset, limit)
            })
            .await?;

            if page.is_empty() {
                self.exhausted = true;
                continue;
            }

            let fetched = page.len();
            let mut floor = self.last_id;
            for msg in page {
                // Keep strictly descending ids so nothing is emitted twice.
                if floor.is_some_and(|f| msg.message_id >= f) {
                    continue;
                }
                floor = Some(msg.message_id);
                self.buffer.push_back(msg);
            }

            if self.buffer.is_empty() {
                warn!(
                    channel = %self.channel.name,
                    fetched,
                    "source returned no messages older than the last one emitted, stopping"
                );
                self.exhausted = true;
            } else {
                debug!(
                    channel = %self.channel.name,
                    fetched,
                    accepted = self.buffer.len(),
                    "fetched page"
                );
            }
        }
    }
}

/// Harvests channels from a [`MessageSource`], downloading photos.
pub struct ChannelHarvester {
    source: Arc<dyn MessageSource>,
    governor: Arc<RateGovernor>,
    image_root: PathBuf,
    download_media: bool,
    page_size: usize,
    default_limit: usize,
    max_concurrent: usize,
}

impl ChannelHarvester {
    pub fn new(
        config: &Config,
        source: Arc<dyn MessageSource>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            source,
            governor,
            image_root: config.storage.image_path.clone(),
            download_media: config.harvest.download_media,
            page_size: config.source.page_size,
            default_limit: config.harvest.fetch_limit,
            max_concurrent: config.harvest.max_concurrent_channels.max(1),
        }
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// A cursor over `channel`, limited by its configured fetch limit.
    pub fn cursor<'a>(
        &'a self,
        channel: &'a ChannelConfig,
        cancel: &'a CancellationToken,
    ) -> ChannelCursor<'a> {
        ChannelCursor::new(
            self.source.as_ref(),
            &self.governor,
            cancel,
            channel,
            self.page_size,
            channel.fetch_limit(self.default_limit),
        )
    }

    /// Harvest one channel. Never fails: errors end the channel early and
    /// are reported in [`ChannelHarvest::status`].
    pub async fn harvest_channel(
        &self,
        channel: &ChannelConfig,
        cancel: &CancellationToken,
    ) -> ChannelHarvest {
        info!(channel = %channel.name, url = %channel.url, "starting harvest");

        let mut cursor = self.cursor(channel, cancel);
        let mut messages = Vec::new();

        let outcome: Result<(), HarvestError> = async {
            while let Some(mut msg) = cursor.next().await? {
                if self.download_media && msg.has_photo() {
                    let result = self.fetch_media(channel, msg.message_id, cancel).await;
                    match result {
                        Ok(path) => msg.media_path = Some(path),
                        Err(e) => {
                            messages.push(msg);
                            return Err(e);
                        }
                    }
                }
                messages.push(msg);
            }
            Ok(())
        }
        .await;

        let status = match outcome {
            Ok(()) => HarvestStatus::Complete,
            Err(HarvestError::Cancelled) => {
                warn!(channel = %channel.name, kept = messages.len(), "harvest cancelled");
                HarvestStatus::Cancelled
            }
            Err(e) => {
                warn!(
                    channel = %channel.name,
                    kept = messages.len(),
                    error = %e,
                    "harvest ended early"
                );
                HarvestStatus::Partial {
                    error: e.to_string(),
                }
            }
        };

        info!(channel = %channel.name, messages = messages.len(), "finished harvest");
        ChannelHarvest {
            channel: channel.name.clone(),
            messages,
            status,
        }
    }

    /// Harvest every channel with bounded concurrency.
    ///
    /// Results come back in the order of `channels`.
    pub async fn harvest_all(
        &self,
        channels: &[ChannelConfig],
        cancel: &CancellationToken,
    ) -> Vec<ChannelHarvest> {
        let mut results: Vec<(usize, ChannelHarvest)> =
            stream::iter(channels.iter().cloned().enumerate())
                .map(|(idx, channel)| async move {
                    (idx, self.harvest_channel(&channel, cancel).await)
                })
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, h)| h).collect()
    }

    async fn fetch_media(
        &self,
        channel: &ChannelConfig,
        message_id: i64,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, HarvestError> {
        let source = self.source.as_ref();
        let bytes = governed(&self.governor, cancel, move || {
            source.download_media(channel, message_id)
        })
        .await?;

        let path = media_path(&self.image_root, &channel.name, message_id);
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| HarvestError::Media {
                path: path.display().to_string(),
                source,
            })?;
        debug!(channel = %channel.name, message_id, path = %path.display(), "saved media");
        Ok(path)
    }
}

/// Deterministic location of a message's photo.
pub fn media_path(image_root: &Path, channel: &str, message_id: i64) -> PathBuf {
    image_root.join(channel).join(format!("{}.jpg", message_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::Instant;

    use crate::models::MediaKind;

    /// In-memory source with scripted failures keyed by call number.
    struct ScriptedSource {
        messages: HashMap<String, Vec<RawMessage>>,
        calls: Mutex<usize>,
        throttle_on: Vec<(usize, Duration)>,
        fail_on: Option<(String, usize)>,
        cancel_on: Option<(usize, CancellationToken)>,
        channel_calls: Mutex<HashMap<String, usize>>,
        offsets: Mutex<Vec<Option<i64>>>,
    }

    impl ScriptedSource {
        fn new(channels: &[(&str, i64)]) -> Self {
            let mut messages = HashMap::new();
            for (name, count) in channels {
                let msgs = (1..=*count)
                    .rev()
                    .map(|id| message(name, id, id % 2 == 0))
                    .collect();
                messages.insert(name.to_string(), msgs);
            }
            Self {
                messages,
                calls: Mutex::new(0),
                throttle_on: Vec::new(),
                fail_on: None,
                cancel_on: None,
                channel_calls: Mutex::new(HashMap::new()),
                offsets: Mutex::new(Vec::new()),
            }
        }
    }

    fn message(channel: &str, id: i64, photo: bool) -> RawMessage {
        RawMessage {
            message_id: id,
            channel: channel.to_string(),
            date: Utc.timestamp_opt(1_736_000_000 + id, 0).unwrap(),
            text: Some(format!("message {}", id)),
            views: Some(id * 10),
            forwards: Some(0),
            media: photo.then_some(MediaKind::Photo),
            media_path: None,
            original: serde_json::json!({ "id": id }),
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_page(
            &self,
            channel: &ChannelConfig,
            offset_id: Option<i64>,
            limit: usize,
        ) -> Result<Vec<RawMessage>, SourceError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            let channel_call = {
                let mut per = self.channel_calls.lock().unwrap();
                let n = per.entry(channel.name.clone()).or_insert(0);
                *n += 1;
                *n
            };
            self.offsets.lock().unwrap().push(offset_id);

            if let Some((_, wait)) = self.throttle_on.iter().find(|(n, _)| *n == call) {
                return Err(SourceError::Throttled { wait: *wait });
            }
            if let Some((name, n)) = &self.fail_on {
                if *name == channel.name && *n == channel_call {
                    return Err(SourceError::Network("connection reset".into()));
                }
            }
            if let Some((n, token)) = &self.cancel_on {
                if *n == call {
                    token.cancel();
                }
            }

            let all = self.messages.get(&channel.name).cloned().unwrap_or_default();
            Ok(all
                .into_iter()
                .filter(|m| offset_id.map_or(true, |o| m.message_id < o))
                .take(limit)
                .collect())
        }

        async fn download_media(
            &self,
            _channel: &ChannelConfig,
            message_id: i64,
        ) -> Result<Vec<u8>, SourceError> {
            Ok(format!("jpeg-bytes-{}", message_id).into_bytes())
        }
    }

    fn config(tmp: &TempDir, page_size: usize, download_media: bool) -> Config {
        let toml = format!(
            r#"
[db]
path = "{root}/harvest.sqlite"

[storage]
raw_data_path = "{root}/raw"
image_path = "{root}/images"

[source]
page_size = {page_size}

[harvest]
fetch_limit = 100
download_media = {download_media}
max_concurrent_channels = 2
"#,
            root = tmp.path().display(),
        );
        toml::from_str(&toml).unwrap()
    }

    fn channel(name: &str, limit: Option<usize>) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            url: format!("https://t.me/{}", name),
            limit,
        }
    }

    fn harvester(cfg: &Config, source: ScriptedSource) -> (ChannelHarvester, Arc<ScriptedSource>) {
        let source = Arc::new(source);
        let h = ChannelHarvester::new(cfg, source.clone(), Arc::new(RateGovernor::new()));
        (h, source)
    }

    fn ids(messages: &[RawMessage]) -> Vec<i64> {
        messages.iter().map(|m| m.message_id).collect()
    }

    #[tokio::test]
    async fn pages_until_limit_newest_first() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 2, false);
        let (h, source) = harvester(&cfg, ScriptedSource::new(&[("chemed", 5)]));
        let cancel = CancellationToken::new();

        let result = h.harvest_channel(&channel("chemed", Some(4)), &cancel).await;
        assert_eq!(result.status, HarvestStatus::Complete);
        assert_eq!(ids(&result.messages), vec![5, 4, 3, 2]);
        assert_eq!(*source.offsets.lock().unwrap(), vec![None, Some(4)]);
    }

    #[tokio::test]
    async fn stops_at_end_of_channel() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 2, false);
        let (h, _) = harvester(&cfg, ScriptedSource::new(&[("chemed", 3)]));
        let cancel = CancellationToken::new();

        let result = h.harvest_channel(&channel("chemed", None), &cancel).await;
        assert_eq!(result.status, HarvestStatus::Complete);
        assert_eq!(ids(&result.messages), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn throttle_pauses_then_resumes_without_duplicates() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 2, false);
        let mut source = ScriptedSource::new(&[("chemed", 6)]);
        source.throttle_on = vec![(2, Duration::from_millis(150))];
        let (h, source) = harvester(&cfg, source);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let result = h.harvest_channel(&channel("chemed", None), &cancel).await;

        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(result.status, HarvestStatus::Complete);
        assert_eq!(ids(&result.messages), vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(h.governor().stats().throttles, 1);
        // The throttled request is reissued with the same offset.
        let offsets = source.offsets.lock().unwrap().clone();
        assert_eq!(offsets[1], Some(5));
        assert_eq!(offsets[2], Some(5));
    }

    #[tokio::test]
    async fn cursor_is_lazy() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 2, false);
        let (h, source) = harvester(&cfg, ScriptedSource::new(&[("chemed", 6)]));
        let cancel = CancellationToken::new();
        let ch = channel("chemed", None);

        let mut cursor = h.cursor(&ch, &cancel);
        assert_eq!(*source.calls.lock().unwrap(), 0);
        assert_eq!(cursor.next().await.unwrap().unwrap().message_id, 6);
        assert_eq!(cursor.next().await.unwrap().unwrap().message_id, 5);
        assert_eq!(*source.calls.lock().unwrap(), 1);
        assert_eq!(cursor.emitted(), 2);
    }

    #[tokio::test]
    async fn failure_keeps_partial_result_and_spares_other_channels() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 2, false);
        let mut source = ScriptedSource::new(&[("chemed", 6), ("lobelia", 3)]);
        source.fail_on = Some(("chemed".into(), 2));
        let (h, _) = harvester(&cfg, source);
        let cancel = CancellationToken::new();

        let results = h
            .harvest_all(&[channel("chemed", None), channel("lobelia", None)], &cancel)
            .await;

        assert_eq!(results[0].channel, "chemed");
        assert!(matches!(results[0].status, HarvestStatus::Partial { .. }));
        assert_eq!(ids(&results[0].messages), vec![6, 5]);
        assert_eq!(results[1].channel, "lobelia");
        assert_eq!(results[1].status, HarvestStatus::Complete);
        assert_eq!(ids(&results[1].messages), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn cancellation_keeps_fetched_messages() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 2, false);
        let cancel = CancellationToken::new();
        let mut source = ScriptedSource::new(&[("chemed", 6)]);
        source.cancel_on = Some((1, cancel.clone()));
        let (h, _) = harvester(&cfg, source);

        let result = h.harvest_channel(&channel("chemed", None), &cancel).await;
        assert_eq!(result.status, HarvestStatus::Cancelled);
        assert_eq!(ids(&result.messages), vec![6, 5]);
    }

    #[tokio::test]
    async fn cancelled_before_start_fetches_nothing() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 2, false);
        let (h, source) = harvester(&cfg, ScriptedSource::new(&[("chemed", 6)]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.harvest_channel(&channel("chemed", None), &cancel).await;
        assert_eq!(result.status, HarvestStatus::Cancelled);
        assert!(result.messages.is_empty());
        assert_eq!(*source.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn photos_are_saved_at_deterministic_paths() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 10, true);
        let (h, _) = harvester(&cfg, ScriptedSource::new(&[("chemed", 4)]));
        let cancel = CancellationToken::new();
        let ch = channel("chemed", None);

        let first = h.harvest_channel(&ch, &cancel).await;
        let second = h.harvest_channel(&ch, &cancel).await;

        let expected = media_path(&cfg.storage.image_path, "chemed", 4);
        assert_eq!(first.messages[0].media_path.as_ref(), Some(&expected));
        assert_eq!(second.messages[0].media_path.as_ref(), Some(&expected));
        assert_eq!(std::fs::read(&expected).unwrap(), b"jpeg-bytes-4");
        // Odd ids carry no photo.
        assert!(first.messages[1].media_path.is_none());

        let leftovers: Vec<_> = std::fs::read_dir(expected.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
