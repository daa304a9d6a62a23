//! Per-citation results and the attempt trail behind them.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::download::RejectReason;
use crate::source::SourceKind;

/// Terminal status of one citation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// A validated PDF was written.
    Success,
    /// Every source was tried and none produced a valid download.
    Failed,
    /// Never attempted (quality gate, existing file, cancellation).
    Skipped,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        })
    }
}

/// Why a citation did not end in [`DownloadStatus::Success`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// No source yielded a valid download.
    SourcesExhausted,
    /// The last body downloaded for this citation failed validation.
    ValidationRejected {
        /// Validator verdict.
        reason: RejectReason,
    },
    /// Extraction quality below `min_quality_score`.
    BelowQualityThreshold {
        /// The citation's score.
        score: f64,
        /// Configured minimum.
        min: f64,
    },
    /// No title, DOI, arXiv id or raw text to query with.
    InsufficientMetadata,
    /// The target file already exists and `skip_existing` is set.
    AlreadyExists,
    /// The run was cancelled before this citation finished.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourcesExhausted => f.write_str("no source produced a valid PDF"),
            Self::ValidationRejected { reason } => write!(f, "download rejected: {reason}"),
            Self::BelowQualityThreshold { score, min } => {
                write!(f, "quality score {score:.2} below minimum {min:.2}")
            }
            Self::InsufficientMetadata => f.write_str("no title, DOI or arXiv id to search with"),
            Self::AlreadyExists => f.write_str("file already exists"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// How one source attempt ended.
///
/// The serialized names double as the keys of the per-source outcome
/// histogram in [`crate::pipeline::AggregateStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// A candidate was found and its download passed validation.
    Found,
    /// The source had nothing for this citation.
    NotFound,
    /// Transient failures outlasted the retry budget.
    TransientExhausted,
    /// The source answered with a non-retryable error.
    PermanentError,
    /// No rate-limit token within `rate_limit_wait`.
    RateLimitTimeout,
    /// The candidate body failed validation.
    ValidationRejected,
    /// The candidate could not be downloaded.
    DownloadFailed,
    /// The run was cancelled mid-attempt.
    Cancelled,
}

impl AttemptOutcome {
    /// Snake-case name used in logs and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::NotFound => "not_found",
            Self::TransientExhausted => "transient_exhausted",
            Self::PermanentError => "permanent_error",
            Self::RateLimitTimeout => "rate_limit_timeout",
            Self::ValidationRejected => "validation_rejected",
            Self::DownloadFailed => "download_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a citation's attempt trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAttempt {
    /// Source that was tried.
    pub source: SourceKind,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Wall time spent on this source (query, retries and download).
    pub elapsed_ms: u64,
    /// Error or rejection detail, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Terminal result for one citation.
///
/// Exactly one is produced per input citation, whatever happens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadResult {
    /// Id of the citation this result belongs to.
    pub citation_id: String,
    /// Terminal status.
    pub status: DownloadStatus,
    /// Source whose candidate was downloaded.
    pub source_used: Option<SourceKind>,
    /// Where the validated PDF was written.
    pub file_path: Option<PathBuf>,
    /// Bytes written to `file_path`.
    pub bytes_written: u64,
    /// Wall time for the whole citation.
    pub elapsed_ms: u64,
    /// Set for every non-success status.
    pub failure_reason: Option<FailureReason>,
    /// Sources tried, in the order they were tried.
    pub sources_tried: Vec<SourceAttempt>,
}

impl DownloadResult {
    /// A validated download.
    #[must_use]
    pub fn success(
        citation_id: impl Into<String>,
        source: SourceKind,
        file_path: PathBuf,
        bytes_written: u64,
    ) -> Self {
        Self {
            citation_id: citation_id.into(),
            status: DownloadStatus::Success,
            source_used: Some(source),
            file_path: Some(file_path),
            bytes_written,
            elapsed_ms: 0,
            failure_reason: None,
            sources_tried: Vec::new(),
        }
    }

    /// A citation every source failed on.
    #[must_use]
    pub fn failed(citation_id: impl Into<String>, reason: FailureReason) -> Self {
        Self::terminal(citation_id, DownloadStatus::Failed, reason)
    }

    /// A citation that was never attempted.
    #[must_use]
    pub fn skipped(citation_id: impl Into<String>, reason: FailureReason) -> Self {
        Self::terminal(citation_id, DownloadStatus::Skipped, reason)
    }

    fn terminal(citation_id: impl Into<String>, status: DownloadStatus, reason: FailureReason) -> Self {
        Self {
            citation_id: citation_id.into(),
            status,
            source_used: None,
            file_path: None,
            bytes_written: 0,
            elapsed_ms: 0,
            failure_reason: Some(reason),
            sources_tried: Vec::new(),
        }
    }

    /// Attaches the attempt trail.
    #[must_use]
    pub fn with_attempts(mut self, sources_tried: Vec<SourceAttempt>) -> Self {
        self.sources_tried = sources_tried;
        self
    }

    /// Sets the elapsed wall time.
    #[must_use]
    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    /// True for [`DownloadStatus::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == DownloadStatus::Success
    }

    /// Sources tried, in order.
    pub fn attempted_sources(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.sources_tried.iter().map(|attempt| attempt.source)
    }

    /// One human-readable line for terminal output.
    #[must_use]
    pub fn summary_line(&self) -> String {
        match (self.status, &self.failure_reason) {
            (DownloadStatus::Success, _) => format!(
                "[{}] {}: {} via {} ({} bytes)",
                self.status,
                self.citation_id,
                self.file_path
                    .as_deref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
                self.source_used.map_or("?", SourceKind::as_str),
                self.bytes_written
            ),
            (_, Some(reason)) => format!("[{}] {}: {reason}", self.status, self.citation_id),
            (_, None) => format!("[{}] {}", self.status, self.citation_id),
        }
    }
}
