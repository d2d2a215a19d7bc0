//! Typed errors for every pipeline seam.
//!
//! Each error carries an [`ErrorKind`] so that callers can tell a fatal
//! configuration problem apart from a failure that was isolated to one
//! channel, record, or image without inspecting message strings.
//!
//! | Kind | Raised by | Handling |
//! |------|-----------|----------|
//! | `TransientThrottle` | [`SourceError::Throttled`] | global pause, then resume |
//! | `PerChannelFailure` | [`HarvestError`] | channel ends with a partial batch |
//! | `PerRecordFailure` | [`RecordError`] | record skipped, batch continues |
//! | `PerImageFailure` | [`DetectError`] | image skipped, run continues |
//! | `FatalConfiguration` | [`PipelineError::FatalConfiguration`] | run aborts before any stage |

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// The five error kinds a run distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientThrottle,
    PerChannelFailure,
    PerRecordFailure,
    PerImageFailure,
    FatalConfiguration,
}

impl ErrorKind {
    /// Only configuration problems abort a run.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::FatalConfiguration)
    }
}

/// Errors returned by a [`MessageSource`](crate::source::MessageSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited by source, retry after {}s", wait.as_secs())]
    Throttled { wait: Duration },

    #[error("network error: {0}")]
    Network(String),

    #[error("source returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed item from source: {0}")]
    Malformed(String),

    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("source is disabled")]
    Disabled,
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Throttled { .. } => ErrorKind::TransientThrottle,
            _ => ErrorKind::PerChannelFailure,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Malformed(err.to_string())
    }
}

/// Why one channel's harvest stopped early.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to write media {path}: {source}")]
    Media {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("harvest cancelled")]
    Cancelled,
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PerChannelFailure
    }
}

/// A single snapshot record that could not be mapped or written.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("store rejected record: {0}")]
    Store(String),
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PerRecordFailure
    }
}

impl From<sqlx::Error> for RecordError {
    fn from(err: sqlx::Error) -> Self {
        RecordError::Store(err.to_string())
    }
}

/// Detection failed for one image.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to read image {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("detector request failed: {0}")]
    Request(String),

    #[error("invalid detector response: {0}")]
    InvalidResponse(String),

    #[error("detector is disabled")]
    Disabled,

    #[error("failed to store detections: {0}")]
    Store(String),
}

impl DetectError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PerImageFailure
    }
}

impl From<reqwest::Error> for DetectError {
    fn from(err: reqwest::Error) -> Self {
        DetectError::Request(err.to_string())
    }
}

impl From<sqlx::Error> for DetectError {
    fn from(err: sqlx::Error) -> Self {
        DetectError::Store(err.to_string())
    }
}

/// Errors that end a whole run (or a whole stage) rather than one unit.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    FatalConfiguration(String),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::FatalConfiguration(_) => Some(ErrorKind::FatalConfiguration),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_is_transient() {
        let err = SourceError::Throttled {
            wait: Duration::from_secs(3),
        };
        assert_eq!(err.kind(), ErrorKind::TransientThrottle);
        assert!(err.to_string().contains("3s"));
    }

    #[test]
    fn only_configuration_is_fatal() {
        assert!(ErrorKind::FatalConfiguration.is_fatal());
        assert!(!ErrorKind::PerChannelFailure.is_fatal());
        assert!(!ErrorKind::PerImageFailure.is_fatal());
        assert_eq!(
            PipelineError::FatalConfiguration("x".into()).kind(),
            Some(ErrorKind::FatalConfiguration)
        );
        assert_eq!(PipelineError::Cancelled.kind(), None);
    }
}
