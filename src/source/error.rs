//! Error types for source lookups.

use std::time::Duration;

use thiserror::Error;

use super::SourceKind;
use crate::download::{FailureType, classify_http_status};

/// Errors a [`super::SourceClient`] can return.
///
/// The transient/permanent split is what the retry policy acts on.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Timeout, connection failure, HTTP 429 or 5xx. Worth retrying.
    #[error("{source_name} temporarily unavailable: {message}")]
    Transient {
        /// Source that failed.
        source_name: SourceKind,
        /// What went wrong.
        message: String,
        /// Server-provided Retry-After.
        retry_after: Option<Duration>,
        /// True for HTTP 429.
        rate_limited: bool,
    },

    /// Other 4xx, malformed payload or client misconfiguration. Not retried.
    #[error("{source_name} request failed: {message}")]
    Permanent {
        /// Source that failed.
        source_name: SourceKind,
        /// What went wrong.
        message: String,
    },
}

impl SourceError {
    /// Creates a transient error.
    pub fn transient(source_name: SourceKind, message: impl Into<String>) -> Self {
        Self::Transient {
            source_name,
            message: message.into(),
            retry_after: None,
            rate_limited: false,
        }
    }

    /// Creates a permanent error.
    pub fn permanent(source_name: SourceKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            source_name,
            message: message.into(),
        }
    }

    /// Maps a non-success HTTP status to an error.
    #[must_use]
    pub fn from_status(source_name: SourceKind, status: u16, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            FailureType::RateLimited => Self::Transient {
                source_name,
                message: format!("HTTP {status} (rate limited)"),
                retry_after,
                rate_limited: true,
            },
            FailureType::Transient => Self::Transient {
                source_name,
                message: format!("HTTP {status}"),
                retry_after,
                rate_limited: false,
            },
            FailureType::Permanent => Self::permanent(source_name, format!("HTTP {status}")),
        }
    }

    /// Maps a reqwest send/read error. Everything but builder and decode
    /// errors is treated as transient.
    #[must_use]
    pub fn from_reqwest(source_name: SourceKind, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::transient(source_name, "request timed out");
        }
        if error.is_builder() || error.is_decode() {
            return Self::permanent(source_name, error.to_string());
        }
        Self::transient(source_name, error.to_string())
    }

    /// A response body that does not match the documented schema.
    pub fn malformed(source_name: SourceKind, detail: impl std::fmt::Display) -> Self {
        Self::permanent(source_name, format!("malformed response: {detail}"))
    }

    /// Source that produced the error.
    #[must_use]
    pub fn source_name(&self) -> SourceKind {
        match self {
            Self::Transient { source_name, .. } | Self::Permanent { source_name, .. } => {
                *source_name
            }
        }
    }

    /// Classifies this error for retry decisions.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Transient {
                rate_limited: true, ..
            } => FailureType::RateLimited,
            Self::Transient { .. } => FailureType::Transient,
            Self::Permanent { .. } => FailureType::Permanent,
        }
    }

    /// Server-provided Retry-After, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            Self::Permanent { .. } => None,
        }
    }
}
