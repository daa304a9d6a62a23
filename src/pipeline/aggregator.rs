//! Concurrent per-source statistics and the end-of-run report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use super::result::{AttemptOutcome, DownloadResult, DownloadStatus, SourceAttempt};
use crate::source::SourceKind;

const OUTCOME_COUNT: usize = 8;

const OUTCOMES: [AttemptOutcome; OUTCOME_COUNT] = [
    AttemptOutcome::Found,
    AttemptOutcome::NotFound,
    AttemptOutcome::TransientExhausted,
    AttemptOutcome::PermanentError,
    AttemptOutcome::RateLimitTimeout,
    AttemptOutcome::ValidationRejected,
    AttemptOutcome::DownloadFailed,
    AttemptOutcome::Cancelled,
];

/// Success rate (percent) under which the report adds troubleshooting hints.
const LOW_SUCCESS_RATE: f64 = 30.0;
/// Success rate (percent) above which the report says coverage is good.
const HIGH_SUCCESS_RATE: f64 = 70.0;

#[derive(Debug, Default)]
struct SourceCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    latency_ms_total: AtomicU64,
    outcomes: [AtomicU64; OUTCOME_COUNT],
}

/// Thread-safe accumulation of per-source attempt statistics.
///
/// Counters are atomics behind a sharded map, so recording an attempt never
/// waits on another source and only briefly on the same one.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    sources: DashMap<SourceKind, SourceCounters>,
}

impl ResultAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one finished source attempt.
    pub fn record(&self, source: SourceKind, outcome: AttemptOutcome, latency: Duration) {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let counters = self.sources.entry(source).or_default();
        counters.attempts.fetch_add(1, Ordering::Relaxed);
        if outcome == AttemptOutcome::Found {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
        counters.outcomes[outcome as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Records an entry of a citation's attempt trail.
    pub fn record_attempt(&self, attempt: &SourceAttempt) {
        self.record(
            attempt.source,
            attempt.outcome,
            Duration::from_millis(attempt.elapsed_ms),
        );
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> AggregateStats {
        let sources = self
            .sources
            .iter()
            .map(|entry| {
                let counters = entry.value();
                let attempts = counters.attempts.load(Ordering::Relaxed);
                let latency_total = counters.latency_ms_total.load(Ordering::Relaxed);
                let outcomes = OUTCOMES
                    .iter()
                    .zip(&counters.outcomes)
                    .filter_map(|(outcome, count)| {
                        let count = count.load(Ordering::Relaxed);
                        (count > 0).then_some((*outcome, count))
                    })
                    .collect();
                (
                    *entry.key(),
                    SourceStats {
                        attempts,
                        successes: counters.successes.load(Ordering::Relaxed),
                        avg_latency_ms: average(latency_total, attempts),
                        outcomes,
                    },
                )
            })
            .collect();
        AggregateStats(sources)
    }
}

#[allow(clippy::cast_precision_loss)]
fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Counters for one source at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
    /// Source attempts that reached a terminal outcome.
    pub attempts: u64,
    /// Attempts that ended in a validated download.
    pub successes: u64,
    /// Mean wall time per attempt.
    pub avg_latency_ms: f64,
    /// Attempt count per outcome; zero counts are omitted.
    pub outcomes: BTreeMap<AttemptOutcome, u64>,
}

impl SourceStats {
    /// Count for one outcome.
    #[must_use]
    pub fn outcome(&self, outcome: AttemptOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

/// Per-source statistics keyed by source name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AggregateStats(BTreeMap<SourceKind, SourceStats>);

impl AggregateStats {
    /// Statistics for one source, if it was ever attempted.
    #[must_use]
    pub fn get(&self, source: SourceKind) -> Option<&SourceStats> {
        self.0.get(&source)
    }

    /// Sources in name order.
    pub fn iter(&self) -> impl Iterator<Item = (SourceKind, &SourceStats)> {
        self.0.iter().map(|(source, stats)| (*source, stats))
    }

    /// True when no attempt was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything a run hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// One result per citation, in input order.
    pub results: Vec<DownloadResult>,
    /// Per-source statistics.
    pub stats: AggregateStats,
    /// Citations with status SUCCESS.
    pub succeeded: usize,
    /// Citations with status FAILED.
    pub failed: usize,
    /// Citations with status SKIPPED.
    pub skipped: usize,
    /// True if the run was cancelled.
    pub cancelled: bool,
}

impl RunReport {
    /// Builds a report and tallies statuses.
    #[must_use]
    pub fn new(results: Vec<DownloadResult>, stats: AggregateStats, cancelled: bool) -> Self {
        let count = |status: DownloadStatus| results.iter().filter(|r| r.status == status).count();
        let succeeded = count(DownloadStatus::Success);
        let failed = count(DownloadStatus::Failed);
        let skipped = count(DownloadStatus::Skipped);
        Self {
            results,
            stats,
            succeeded,
            failed,
            skipped,
            cancelled,
        }
    }

    /// Citations that were actually run through the cascade.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Percentage of attempted citations that succeeded.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        percent(self.succeeded, self.attempted())
    }

    /// Human-readable summary: totals, per-source breakdown and hints.
    #[must_use]
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Processed {} citations: {} downloaded, {} failed, {} skipped",
            self.results.len(),
            self.succeeded,
            self.failed,
            self.skipped
        )];
        if self.cancelled {
            lines.push("Run interrupted; unfinished citations were skipped".to_string());
        }

        let attempted = self.attempted();
        if attempted > 0 {
            lines.push(format!("Success rate: {:.1}%", self.success_rate()));
        }

        if !self.stats.is_empty() {
            lines.push("Per-source results:".to_string());
            for (source, stats) in self.stats.iter() {
                let breakdown = stats
                    .outcomes
                    .iter()
                    .map(|(outcome, count)| format!("{outcome} {count}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                lines.push(format!(
                    "  {:<17} {}/{} succeeded, avg {:.0} ms ({breakdown})",
                    source.as_str(),
                    stats.successes,
                    stats.attempts,
                    stats.avg_latency_ms
                ));
            }
        }

        if attempted == 0 {
            return lines;
        }
        let rate = self.success_rate();
        if self.succeeded == 0 {
            lines.push(
                "No downloads succeeded. Check network access, set contact_email so Unpaywall \
                 is enabled, and add API keys for Semantic Scholar and CORE."
                    .to_string(),
            );
        } else if rate < LOW_SUCCESS_RATE {
            lines.push(
                "Low success rate. Many cited works may not have open-access copies; enabling \
                 CORE and Unpaywall usually helps, and `-v` shows why each source failed."
                    .to_string(),
            );
        } else if rate > HIGH_SUCCESS_RATE {
            lines.push("Good coverage: most references were retrieved.".to_string());
        }
        lines
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::FailureReason;
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_counts_and_averages() {
        let aggregator = ResultAggregator::new();
        aggregator.record(SourceKind::Arxiv, AttemptOutcome::NotFound, Duration::from_millis(100));
        aggregator.record(SourceKind::Arxiv, AttemptOutcome::Found, Duration::from_millis(300));
        aggregator.record(
            SourceKind::Crossref,
            AttemptOutcome::PermanentError,
            Duration::from_millis(50),
        );

        let stats = aggregator.snapshot();
        let arxiv = stats.get(SourceKind::Arxiv).unwrap();
        assert_eq!(arxiv.attempts, 2);
        assert_eq!(arxiv.successes, 1);
        assert!((arxiv.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(arxiv.outcome(AttemptOutcome::NotFound), 1);
        assert_eq!(arxiv.outcome(AttemptOutcome::RateLimitTimeout), 0);
        assert!(stats.get(SourceKind::Core).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_are_not_lost() {
        let aggregator = Arc::new(ResultAggregator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let aggregator = Arc::clone(&aggregator);
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    aggregator.record(
                        SourceKind::OpenAlex,
                        AttemptOutcome::Found,
                        Duration::from_millis(1),
                    );
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let stats = aggregator.snapshot();
        assert_eq!(stats.get(SourceKind::OpenAlex).unwrap().attempts, 2000);
        assert_eq!(stats.get(SourceKind::OpenAlex).unwrap().successes, 2000);
    }

    #[test]
    fn test_stats_serialize_keyed_by_source_name() {
        let aggregator = ResultAggregator::new();
        aggregator.record(
            SourceKind::SemanticScholar,
            AttemptOutcome::TransientExhausted,
            Duration::ZERO,
        );
        let value = serde_json::to_value(aggregator.snapshot()).unwrap();
        assert_eq!(
            value["semantic_scholar"]["outcomes"]["transient_exhausted"],
            1
        );
    }

    fn report(successes: usize, failures: usize) -> RunReport {
        let mut results = Vec::new();
        for i in 0..successes {
            results.push(DownloadResult::success(
                i.to_string(),
                SourceKind::Arxiv,
                PathBuf::from("x.pdf"),
                1,
            ));
        }
        for i in 0..failures {
            results.push(DownloadResult::failed(
                format!("f{i}"),
                FailureReason::SourcesExhausted,
            ));
        }
        results.push(DownloadResult::skipped("s", FailureReason::InsufficientMetadata));
        RunReport::new(results, AggregateStats::default(), false)
    }

    #[test]
    fn test_report_counts_exclude_skipped_from_rate() {
        let report = report(3, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.attempted(), 4);
        assert!((report.success_rate() - 75.0).abs() < f64::EPSILON);
        let lines = report.summary_lines();
        assert_eq!(lines[0], "Processed 5 citations: 3 downloaded, 1 failed, 1 skipped");
        assert!(lines.iter().any(|l| l.starts_with("Good coverage")));
    }

    #[test]
    fn test_report_hints() {
        assert!(
            report(0, 3)
                .summary_lines()
                .iter()
                .any(|l| l.starts_with("No downloads succeeded"))
        );
        assert!(
            report(1, 9)
                .summary_lines()
                .iter()
                .any(|l| l.starts_with("Low success rate"))
        );
        let middling = report(1, 1).summary_lines();
        assert!(!middling.iter().any(|l| l.starts_with("Low") || l.starts_with("Good")));
    }
}
