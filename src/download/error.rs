//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so a failed attempt can be
//! logged and reported without extra context.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::retry::{FailureType, classify_http_status, is_tls_error};
use super::validator::RejectReason;

/// Errors that can occur while fetching a candidate PDF.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Parsed Retry-After header, if present.
        retry_after: Option<Duration>,
    },

    /// File system error while staging or publishing the download.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The candidate URL is malformed or uses a disallowed scheme.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("HTTP client construction failed: {message}")]
    ClientBuild {
        /// Builder failure description.
        message: String,
    },

    /// The body grew past the configured maximum size.
    #[error("{url} exceeds the {limit} byte size limit")]
    TooLarge {
        /// The URL being downloaded.
        url: String,
        /// Configured maximum in bytes.
        limit: u64,
    },

    /// The body was fetched but is not an acceptable PDF.
    #[error("rejected {url}: {reason}")]
    Rejected {
        /// The URL whose body was rejected.
        url: String,
        /// Why the validator rejected it.
        reason: RejectReason,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, mapping timeouts to [`DownloadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a parsed Retry-After delay.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a validation rejection.
    pub fn rejected(url: impl Into<String>, reason: RejectReason) -> Self {
        Self::Rejected {
            url: url.into(),
            reason,
        }
    }

    /// Classifies this error for retry decisions.
    ///
    /// Timeouts, 5xx and most network errors are transient; 429 is rate
    /// limited; TLS failures, other 4xx, local IO, oversize and rejected
    /// bodies are permanent.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::Timeout { .. } => FailureType::Transient,
            Self::Network { source, .. } => {
                if is_tls_error(source) {
                    FailureType::Permanent
                } else {
                    FailureType::Transient
                }
            }
            Self::Io { .. }
            | Self::InvalidUrl { .. }
            | Self::ClientBuild { .. }
            | Self::TooLarge { .. }
            | Self::Rejected { .. } => FailureType::Permanent,
        }
    }

    /// Server-provided Retry-After, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The validator rejection, when this error is one.
    #[must_use]
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
