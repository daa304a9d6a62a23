//! Bounded-concurrency executor running the orchestrator over many citations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::PipelineError;
use super::aggregator::RunReport;
use super::orchestrator::ResolutionOrchestrator;
use super::result::{DownloadResult, FailureReason};
use crate::citation::Citation;
use crate::config::MAX_THREADS_RANGE;

/// How often a worker waiting for a free slot re-checks cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Called once per finished citation, from the task that finished it.
pub type ProgressCallback = Arc<dyn Fn(&DownloadResult) + Send + Sync>;

/// Runs citations through a shared [`ResolutionOrchestrator`], at most
/// `max_threads` at a time.
///
/// # Concurrency Model
///
/// - Each citation runs in its own Tokio task
/// - A semaphore permit is acquired before spawning and released when the
///   task ends (RAII)
/// - Rate limiters and statistics are shared through the orchestrator
///
/// Results come back in input order regardless of completion order.
#[derive(Debug)]
pub struct WorkerPool {
    orchestrator: Arc<ResolutionOrchestrator>,
    semaphore: Arc<Semaphore>,
    max_threads: usize,
}

impl WorkerPool {
    /// Creates a pool.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConcurrency`] when `max_threads` is
    /// outside 1..=100.
    pub fn new(
        orchestrator: Arc<ResolutionOrchestrator>,
        max_threads: usize,
    ) -> Result<Self, PipelineError> {
        if !MAX_THREADS_RANGE.contains(&max_threads) {
            return Err(PipelineError::InvalidConcurrency { value: max_threads });
        }
        debug!(max_threads, sources = orchestrator.registry().len(), "creating worker pool");
        Ok(Self {
            orchestrator,
            semaphore: Arc::new(Semaphore::new(max_threads)),
            max_threads,
        })
    }

    /// Configured concurrency limit.
    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// The shared orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &ResolutionOrchestrator {
        &self.orchestrator
    }

    /// Resolves every citation and returns the full report.
    pub async fn run(&self, citations: Vec<Citation>) -> RunReport {
        self.run_with_progress(citations, None).await
    }

    /// Like [`WorkerPool::run`], reporting each result as it completes.
    #[instrument(skip_all, fields(citations = citations.len(), max_threads = self.max_threads))]
    pub async fn run_with_progress(
        &self,
        citations: Vec<Citation>,
        progress: Option<ProgressCallback>,
    ) -> RunReport {
        let cancelled = self.orchestrator.cancel_flag();
        let mut slots: Vec<Option<DownloadResult>> = (0..citations.len()).map(|_| None).collect();
        let mut handles: Vec<(usize, String, JoinHandle<DownloadResult>)> = Vec::new();

        info!("starting pipeline run");

        for (index, citation) in citations.into_iter().enumerate() {
            if cancelled.load(Ordering::SeqCst) {
                slots[index] = Some(not_started(&citation, progress.as_ref()));
                continue;
            }

            let permit = tokio::select! {
                biased;
                () = wait_for_cancel(&cancelled) => None,
                result = self.semaphore.clone().acquire_owned() => result.ok(),
            };
            let Some(permit) = permit else {
                slots[index] = Some(not_started(&citation, progress.as_ref()));
                continue;
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let progress = progress.clone();
            let citation_id = citation.id.clone();
            handles.push((
                index,
                citation_id,
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = orchestrator.resolve(&citation).await;
                    if let Some(progress) = &progress {
                        progress(&result);
                    }
                    result
                }),
            ));
        }

        debug!(task_count = handles.len(), "waiting for workers to finish");

        for (index, citation_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(error) => {
                    warn!(citation_id = %citation_id, error = %error, "worker task panicked");
                    let result = DownloadResult::failed(citation_id, FailureReason::SourcesExhausted);
                    if let Some(progress) = &progress {
                        progress(&result);
                    }
                    result
                }
            };
            slots[index] = Some(result);
        }

        let results: Vec<DownloadResult> = slots.into_iter().flatten().collect();
        let report = RunReport::new(
            results,
            self.orchestrator.aggregator().snapshot(),
            cancelled.load(Ordering::SeqCst),
        );
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            total = report.results.len(),
            cancelled = report.cancelled,
            "pipeline run complete"
        );
        report
    }
}

fn not_started(citation: &Citation, progress: Option<&ProgressCallback>) -> DownloadResult {
    debug!(citation_id = %citation.id, "cancelled before start");
    let result = DownloadResult::skipped(&citation.id, FailureReason::Cancelled);
    if let Some(progress) = progress {
        progress(&result);
    }
    result
}

async fn wait_for_cancel(cancelled: &AtomicBool) {
    while !cancelled.load(Ordering::SeqCst) {
        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::download::{DownloadValidator, HttpClient, RateLimiter};
    use crate::pipeline::DownloadStatus;
    use crate::source::{SourceClient, SourceError, SourceKind, SourceOutcome, SourceRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Sleeps, tracks peak concurrency, answers `NotFound`.
    #[derive(Default)]
    struct Slow {
        active: AtomicUsize,
        peak: AtomicUsize,
        panic_on: Option<String>,
        cancel_after_first: Option<Arc<AtomicBool>>,
    }

    #[async_trait]
    impl SourceClient for Slow {
        fn kind(&self) -> SourceKind {
            SourceKind::Arxiv
        }

        async fn resolve(&self, citation: &Citation) -> Result<SourceOutcome, SourceError> {
            assert!(
                self.panic_on.as_deref() != Some(citation.id.as_str()),
                "scripted panic"
            );
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if let Some(flag) = &self.cancel_after_first {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(SourceOutcome::NotFound)
        }
    }

    fn pool(source: Arc<Slow>, max_threads: usize, dir: &TempDir) -> WorkerPool {
        let mut registry = SourceRegistry::new();
        registry
            .register(
                source,
                1,
                Arc::new(RateLimiter::new("arxiv", 1000.0, 1000, Duration::from_secs(5))),
            )
            .unwrap();
        let downloader =
            HttpClient::new(DownloadValidator::new(1000), 1 << 20, Duration::from_secs(5), None)
                .unwrap();
        let orchestrator = ResolutionOrchestrator::new(
            Arc::new(registry),
            downloader,
            &PipelineConfig::default(),
            dir.path(),
        );
        WorkerPool::new(Arc::new(orchestrator), max_threads).unwrap()
    }

    fn citations(n: usize) -> Vec<Citation> {
        (0..n)
            .map(|i| Citation::new(i.to_string(), "").with_doi(format!("10.1/{i}")))
            .collect()
    }

    #[test]
    fn test_rejects_out_of_range_concurrency() {
        let orchestrator = Arc::new(ResolutionOrchestrator::new(
            Arc::new(SourceRegistry::new()),
            HttpClient::new(DownloadValidator::new(1000), 1 << 20, Duration::from_secs(5), None)
                .unwrap(),
            &PipelineConfig::default(),
            "out",
        ));
        assert!(matches!(
            WorkerPool::new(Arc::clone(&orchestrator), 0),
            Err(PipelineError::InvalidConcurrency { value: 0 })
        ));
        assert!(WorkerPool::new(orchestrator, 101).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded_and_order_preserved() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(Slow::default());
        let pool = pool(Arc::clone(&source), 3, &dir);

        let report = pool.run(citations(12)).await;
        assert_eq!(report.results.len(), 12);
        let ids: Vec<_> = report.results.iter().map(|r| r.citation_id.as_str()).collect();
        let expected: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
        assert!(source.peak.load(Ordering::SeqCst) <= 3);
        assert!(report.results.iter().all(|r| r.status == DownloadStatus::Failed));
    }

    #[tokio::test]
    async fn test_progress_called_once_per_citation() {
        let dir = TempDir::new().unwrap();
        let pool = pool(Arc::new(Slow::default()), 2, &dir);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let progress: ProgressCallback = Arc::new(move |_result| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pool.run_with_progress(citations(5), Some(progress)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_panicking_task_yields_failed_result() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(Slow {
            panic_on: Some("1".to_string()),
            ..Slow::default()
        });
        let report = pool(source, 2, &dir).run(citations(3)).await;

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[1].citation_id, "1");
        assert_eq!(report.results[1].status, DownloadStatus::Failed);
        assert_eq!(report.results[1].failure_reason, Some(FailureReason::SourcesExhausted));
    }

    #[tokio::test]
    async fn test_cancellation_skips_unstarted_citations() {
        let dir = TempDir::new().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let source = Arc::new(Slow {
            cancel_after_first: Some(Arc::clone(&flag)),
            ..Slow::default()
        });
        let mut registry = SourceRegistry::new();
        registry
            .register(
                source,
                1,
                Arc::new(RateLimiter::new("arxiv", 1000.0, 1000, Duration::from_secs(5))),
            )
            .unwrap();
        let orchestrator = ResolutionOrchestrator::new(
            Arc::new(registry),
            HttpClient::new(DownloadValidator::new(1000), 1 << 20, Duration::from_secs(5), None)
                .unwrap(),
            &PipelineConfig::default(),
            dir.path(),
        )
        .with_cancel_flag(Arc::clone(&flag));
        let pool = WorkerPool::new(Arc::new(orchestrator), 1).unwrap();

        let report = pool.run(citations(4)).await;
        assert!(report.cancelled);
        assert_eq!(report.results.len(), 4);
        // The in-flight citation stops at its next transition.
        assert_eq!(report.results[0].sources_tried.len(), 1);
        for result in &report.results {
            assert_eq!(result.status, DownloadStatus::Skipped);
            assert_eq!(result.failure_reason, Some(FailureReason::Cancelled));
        }
    }
}
