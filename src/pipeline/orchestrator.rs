//! Per-citation resolution state machine.
//!
//! ```text
//! PENDING --admit--> QUERYING(0) --candidate--> DOWNLOADING(0) --valid--> SUCCESS
//!                       |   ^                         |
//!          not found/failed |       rejected/failed   |
//!                       v   |                         |
//!                   QUERYING(i+1) <-------------------+
//!                       |
//!               no sources left --> EXHAUSTED (FAILED)
//! ```
//!
//! Every query and every download attempt takes a token from the source's
//! shared [`RateLimiter`](crate::download::RateLimiter). Transient failures
//! are retried in place; anything else advances the cascade. The
//! cancellation flag is checked before each transition and before each
//! retry sleep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::aggregator::ResultAggregator;
use super::result::{AttemptOutcome, DownloadResult, FailureReason, SourceAttempt};
use crate::citation::Citation;
use crate::config::PipelineConfig;
use crate::download::{
    DownloadedFile, FailureType, HttpClient, RejectReason, RetryDecision, RetryPolicy,
    TargetPath, collision_paths, resolve_target_path,
};
use crate::source::{Candidate, RegisteredSource, SourceOutcome, SourceRegistry, select_best};

enum State {
    Querying {
        index: usize,
    },
    Downloading {
        index: usize,
        candidate: Candidate,
        started: Instant,
    },
    Exhausted,
    Done(DownloadResult),
}

/// Why a source attempt ended without a download.
struct AttemptFailure {
    outcome: AttemptOutcome,
    detail: String,
    rejection: Option<RejectReason>,
}

impl AttemptFailure {
    fn new(outcome: AttemptOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: detail.into(),
            rejection: None,
        }
    }

    fn cancelled() -> Self {
        Self::new(AttemptOutcome::Cancelled, "cancelled during retry backoff")
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            outcome: AttemptOutcome::ValidationRejected,
            detail: reason.to_string(),
            rejection: Some(reason),
        }
    }
}

enum Backoff {
    Retry,
    GiveUp(String),
    Cancelled,
}

#[derive(Default)]
struct Trail {
    attempts: Vec<SourceAttempt>,
    last_rejection: Option<RejectReason>,
}

/// Drives one citation through the source cascade.
///
/// Shared by every worker; all per-citation state lives on the stack of
/// [`ResolutionOrchestrator::resolve`].
#[derive(Debug)]
pub struct ResolutionOrchestrator {
    registry: Arc<SourceRegistry>,
    downloader: HttpClient,
    retry_policy: RetryPolicy,
    aggregator: Arc<ResultAggregator>,
    output_dir: PathBuf,
    min_quality_score: f64,
    max_filename_length: usize,
    skip_existing: bool,
    cancelled: Arc<AtomicBool>,
}

impl ResolutionOrchestrator {
    /// Creates an orchestrator writing into `output_dir`.
    ///
    /// Retry limits, the quality gate and filename rules come from `config`.
    #[must_use]
    pub fn new(
        registry: Arc<SourceRegistry>,
        downloader: HttpClient,
        config: &PipelineConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            downloader,
            retry_policy: config.retry_policy(),
            aggregator: Arc::new(ResultAggregator::new()),
            output_dir: output_dir.into(),
            min_quality_score: config.min_quality_score,
            max_filename_length: config.max_filename_length,
            skip_existing: config.skip_existing,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Uses a caller-owned cancellation flag (set it to stop the run).
    #[must_use]
    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// The cancellation flag observed by this orchestrator.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Statistics recorded so far.
    #[must_use]
    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    /// The source cascade.
    #[must_use]
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Resolves one citation to a terminal result.
    ///
    /// Never fails: every error is folded into the returned
    /// [`DownloadResult`].
    #[instrument(skip(self, citation), fields(citation_id = %citation.id))]
    pub async fn resolve(&self, citation: &Citation) -> DownloadResult {
        let started = Instant::now();
        let mut trail = Trail::default();
        let result = match self.admit(citation) {
            Ok(target) => self.cascade(citation, &target, &mut trail).await,
            Err(skipped) => skipped,
        };
        let result = result
            .with_attempts(trail.attempts)
            .with_elapsed_ms(millis(started.elapsed()));
        debug!(
            status = %result.status,
            sources_tried = result.sources_tried.len(),
            elapsed_ms = result.elapsed_ms,
            "citation finished"
        );
        result
    }

    /// PENDING: quality gate and target path, before any network call.
    fn admit(&self, citation: &Citation) -> Result<PathBuf, DownloadResult> {
        if self.is_cancelled() {
            return Err(DownloadResult::skipped(&citation.id, FailureReason::Cancelled));
        }
        if citation.quality_score < self.min_quality_score {
            debug!(
                score = citation.quality_score,
                min = self.min_quality_score,
                "below quality threshold"
            );
            return Err(DownloadResult::skipped(
                &citation.id,
                FailureReason::BelowQualityThreshold {
                    score: citation.quality_score,
                    min: self.min_quality_score,
                },
            ));
        }
        if citation.has_no_lookup_keys() {
            debug!("no title, DOI or arXiv id");
            return Err(DownloadResult::skipped(
                &citation.id,
                FailureReason::InsufficientMetadata,
            ));
        }
        match resolve_target_path(
            &self.output_dir,
            citation,
            self.max_filename_length,
            self.skip_existing,
        ) {
            TargetPath::Fresh(path) => Ok(path),
            TargetPath::Existing(path) => {
                info!(path = %path.display(), "file exists, skipping");
                let mut skipped = DownloadResult::skipped(&citation.id, FailureReason::AlreadyExists);
                skipped.file_path = Some(path);
                Err(skipped)
            }
        }
    }

    async fn cascade(&self, citation: &Citation, target: &Path, trail: &mut Trail) -> DownloadResult {
        let mut state = State::Querying { index: 0 };
        loop {
            state = match state {
                State::Done(result) => return result,
                State::Exhausted => {
                    let reason = trail
                        .last_rejection
                        .map_or(FailureReason::SourcesExhausted, |reason| {
                            FailureReason::ValidationRejected { reason }
                        });
                    info!(sources_tried = trail.attempts.len(), reason = %reason, "all sources exhausted");
                    return DownloadResult::failed(&citation.id, reason);
                }
                _ if self.is_cancelled() => {
                    info!("cancellation requested; stopping citation");
                    return DownloadResult::skipped(&citation.id, FailureReason::Cancelled);
                }
                State::Querying { index } => self.query(citation, index, trail).await,
                State::Downloading {
                    index,
                    candidate,
                    started,
                } => {
                    self.download(citation, index, &candidate, started, target, trail)
                        .await
                }
            };
        }
    }

    /// QUERYING(i): ask one source, pick its best candidate.
    async fn query(&self, citation: &Citation, index: usize, trail: &mut Trail) -> State {
        let Some(source) = self.registry.get(index) else {
            return State::Exhausted;
        };
        let started = Instant::now();
        match self.query_with_retry(source, citation).await {
            Ok(SourceOutcome::Found(candidates)) => {
                if let Some(best) = select_best(&candidates) {
                    debug!(
                        source = %source.kind(),
                        url = %best.url,
                        confidence = best.confidence,
                        candidates = candidates.len(),
                        "candidate selected"
                    );
                    return State::Downloading {
                        index,
                        candidate: best.clone(),
                        started,
                    };
                }
                self.finish_attempt(trail, source, started, AttemptOutcome::NotFound, None);
            }
            Ok(SourceOutcome::NotFound) => {
                self.finish_attempt(trail, source, started, AttemptOutcome::NotFound, None);
            }
            Err(failure) => {
                debug!(source = %source.kind(), outcome = %failure.outcome, detail = %failure.detail, "source failed");
                self.finish_attempt(trail, source, started, failure.outcome, Some(failure.detail));
            }
        }
        State::Querying { index: index + 1 }
    }

    /// DOWNLOADING(i): fetch and validate the chosen candidate.
    async fn download(
        &self,
        citation: &Citation,
        index: usize,
        candidate: &Candidate,
        started: Instant,
        target: &Path,
        trail: &mut Trail,
    ) -> State {
        let Some(source) = self.registry.get(index) else {
            return State::Exhausted;
        };
        match self.download_with_retry(source, citation, &candidate.url, target).await {
            Ok(DownloadedFile {
                path,
                bytes_written,
            }) => {
                self.finish_attempt(trail, source, started, AttemptOutcome::Found, None);
                info!(
                    source = %source.kind(),
                    path = %path.display(),
                    bytes = bytes_written,
                    "download complete"
                );
                State::Done(DownloadResult::success(
                    &citation.id,
                    source.kind(),
                    path,
                    bytes_written,
                ))
            }
            Err(failure) => {
                if let Some(reason) = failure.rejection {
                    trail.last_rejection = Some(reason);
                }
                info!(
                    source = %source.kind(),
                    url = %candidate.url,
                    outcome = %failure.outcome,
                    detail = %failure.detail,
                    "candidate unusable; trying next source"
                );
                self.finish_attempt(trail, source, started, failure.outcome, Some(failure.detail));
                State::Querying { index: index + 1 }
            }
        }
    }

    async fn query_with_retry(
        &self,
        source: &RegisteredSource,
        citation: &Citation,
    ) -> Result<SourceOutcome, AttemptFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            source
                .limiter
                .acquire()
                .await
                .map_err(|timeout| AttemptFailure::new(AttemptOutcome::RateLimitTimeout, timeout.to_string()))?;

            let error = match source.client.resolve(citation).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => error,
            };
            debug!(source = %source.kind(), attempt, error = %error, "query failed");

            let failure_type = error.failure_type();
            match self.backoff(source, failure_type, error.retry_after(), attempt).await {
                Backoff::Retry => {}
                Backoff::Cancelled => return Err(AttemptFailure::cancelled()),
                Backoff::GiveUp(reason) => {
                    let outcome = if failure_type == FailureType::Permanent {
                        AttemptOutcome::PermanentError
                    } else {
                        AttemptOutcome::TransientExhausted
                    };
                    return Err(AttemptFailure::new(outcome, format!("{error} ({reason})")));
                }
            }
        }
    }

    async fn download_with_retry(
        &self,
        source: &RegisteredSource,
        citation: &Citation,
        url: &str,
        target: &Path,
    ) -> Result<DownloadedFile, AttemptFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            source
                .limiter
                .acquire()
                .await
                .map_err(|timeout| AttemptFailure::new(AttemptOutcome::RateLimitTimeout, timeout.to_string()))?;

            // The target was free at admission; a repeated id may have taken
            // it since, so collision names stay available at publish time.
            let fallbacks = collision_paths(&self.output_dir, citation, self.max_filename_length);
            let error = match self
                .downloader
                .download_validated_with_fallbacks(url, target, fallbacks)
                .await
            {
                Ok(file) => return Ok(file),
                Err(error) => error,
            };
            if let Some(reason) = error.reject_reason() {
                return Err(AttemptFailure::rejected(reason));
            }
            debug!(source = %source.kind(), attempt, error = %error, "download failed");

            match self
                .backoff(source, error.failure_type(), error.retry_after(), attempt)
                .await
            {
                Backoff::Retry => {}
                Backoff::Cancelled => return Err(AttemptFailure::cancelled()),
                Backoff::GiveUp(reason) => {
                    return Err(AttemptFailure::new(
                        AttemptOutcome::DownloadFailed,
                        format!("{error} ({reason})"),
                    ));
                }
            }
        }
    }

    /// Applies the retry policy after a failed call and sleeps when retrying.
    ///
    /// A server Retry-After pauses the whole source, not just this citation.
    async fn backoff(
        &self,
        source: &RegisteredSource,
        failure_type: FailureType,
        retry_after: Option<Duration>,
        attempt: u32,
    ) -> Backoff {
        if let Some(delay) = retry_after {
            source.limiter.record_retry_after(delay).await;
        }
        match self.retry_policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                if self.is_cancelled() {
                    return Backoff::Cancelled;
                }
                let delay = self.retry_policy.effective_delay(delay, retry_after);
                info!(
                    source = %source.kind(),
                    attempt = next_attempt,
                    max_attempts = self.retry_policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    using_retry_after = retry_after.is_some(),
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                Backoff::Retry
            }
            RetryDecision::DoNotRetry { reason } => Backoff::GiveUp(reason),
        }
    }

    fn finish_attempt(
        &self,
        trail: &mut Trail,
        source: &RegisteredSource,
        started: Instant,
        outcome: AttemptOutcome,
        detail: Option<String>,
    ) {
        let attempt = SourceAttempt {
            source: source.kind(),
            outcome,
            elapsed_ms: millis(started.elapsed()),
            detail,
        };
        self.aggregator.record_attempt(&attempt);
        trail.attempts.push(attempt);
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
