//! Integration tests for the resolution pipeline.
//!
//! These drive `WorkerPool` and `ResolutionOrchestrator` through the public
//! API with scripted sources and a mock PDF host.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bibp_core::{
    AttemptOutcome, Candidate, Citation, DownloadStatus, DownloadValidator, FailureReason,
    HttpClient, PipelineConfig, RateLimiter, ResolutionOrchestrator, SourceClient, SourceError,
    SourceKind, SourceOutcome, SourceRegistry, WorkerPool,
};
use tempfile::TempDir;
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return Ok(());
        };
        mock_server
    }};
}

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Source giving a fixed answer, recording when it was called.
struct ScriptedSource {
    kind: SourceKind,
    repeat: Option<SourceOutcome>,
    calls: Mutex<Vec<Instant>>,
    cancel_on_call: Option<Arc<AtomicBool>>,
}

impl ScriptedSource {
    fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            repeat: None,
            calls: Mutex::new(Vec::new()),
            cancel_on_call: None,
        }
    }

    fn always(kind: SourceKind, outcome: SourceOutcome) -> Self {
        Self {
            repeat: Some(outcome),
            ..Self::new(kind)
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn resolve(&self, _citation: &Citation) -> Result<SourceOutcome, SourceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Instant::now());
        }
        if let Some(flag) = &self.cancel_on_call {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(self.repeat.clone().unwrap_or(SourceOutcome::NotFound))
    }
}

fn found(kind: SourceKind, url: String) -> SourceOutcome {
    SourceOutcome::Found(vec![Candidate::new(kind, url, 1.0)])
}

fn pdf_body(len: usize) -> Vec<u8> {
    let mut body = b"%PDF-1.5\n".to_vec();
    body.resize(len, b'x');
    body
}

async fn mount_pdf(server: &MockServer, route: &str, len: usize) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(pdf_body(len), "application/pdf"))
        .mount(server)
        .await;
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..PipelineConfig::default()
    }
}

fn build_orchestrator(
    sources: Vec<Arc<ScriptedSource>>,
    config: &PipelineConfig,
    dir: &Path,
    rate: f64,
    burst: u32,
) -> Result<ResolutionOrchestrator, Box<dyn std::error::Error>> {
    let mut registry = SourceRegistry::new();
    for (priority, source) in (1u32..).zip(sources) {
        let limiter = RateLimiter::new(source.kind.as_str(), rate, burst, config.rate_limit_wait);
        registry.register(source, priority, Arc::new(limiter))?;
    }
    let downloader = HttpClient::new(
        DownloadValidator::new(config.min_pdf_size),
        config.max_pdf_size,
        config.download_timeout,
        None,
    )?
    .allow_plain_http(true);
    Ok(ResolutionOrchestrator::new(Arc::new(registry), downloader, config, dir))
}

fn doi_citation(id: &str) -> Citation {
    Citation::new(id, "").with_doi("10.1234/x")
}

#[tokio::test]
async fn test_doi_citation_falls_through_to_second_source() -> TestResult {
    let server = require_mock_server!();
    mount_pdf(&server, "/oa.pdf", 4096).await;

    let dir = TempDir::new()?;
    let arxiv = Arc::new(ScriptedSource::always(SourceKind::Arxiv, SourceOutcome::NotFound));
    let openalex = Arc::new(ScriptedSource::always(
        SourceKind::OpenAlex,
        found(SourceKind::OpenAlex, format!("{}/oa.pdf", server.uri())),
    ));
    let orchestrator =
        build_orchestrator(vec![arxiv, openalex], &fast_config(), dir.path(), 50.0, 50)?;
    let pool = WorkerPool::new(Arc::new(orchestrator), 2)?;

    let report = pool.run(vec![doi_citation("7")]).await;
    let result = &report.results[0];
    assert_eq!(result.status, DownloadStatus::Success);
    assert_eq!(result.source_used, Some(SourceKind::OpenAlex));
    assert_eq!(result.bytes_written, 4096);
    assert_eq!(
        result.attempted_sources().collect::<Vec<_>>(),
        vec![SourceKind::Arxiv, SourceKind::OpenAlex]
    );
    assert_eq!(result.sources_tried[0].outcome, AttemptOutcome::NotFound);

    let file = result.file_path.as_ref().ok_or("file path missing")?;
    assert!(file.starts_with(dir.path()));
    assert_eq!(std::fs::read(file)?.len(), 4096);

    let openalex_stats = report.stats.get(SourceKind::OpenAlex).ok_or("no openalex stats")?;
    assert_eq!(openalex_stats.successes, 1);
    assert_eq!(report.succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn test_too_small_pdf_does_not_stop_the_cascade() -> TestResult {
    let server = require_mock_server!();
    mount_pdf(&server, "/stub.pdf", 100).await;
    mount_pdf(&server, "/full.pdf", 8192).await;

    let dir = TempDir::new()?;
    let unpaywall = Arc::new(ScriptedSource::always(
        SourceKind::Unpaywall,
        found(SourceKind::Unpaywall, format!("{}/stub.pdf", server.uri())),
    ));
    let crossref = Arc::new(ScriptedSource::always(
        SourceKind::Crossref,
        found(SourceKind::Crossref, format!("{}/full.pdf", server.uri())),
    ));
    let orchestrator =
        build_orchestrator(vec![unpaywall, crossref], &fast_config(), dir.path(), 50.0, 50)?;

    let result = orchestrator.resolve(&doi_citation("1")).await;
    assert_eq!(result.status, DownloadStatus::Success);
    assert_eq!(result.source_used, Some(SourceKind::Crossref));
    assert_eq!(result.sources_tried[0].outcome, AttemptOutcome::ValidationRejected);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_sources_are_tried_in_priority_order() -> TestResult {
    let dir = TempDir::new()?;
    let kinds = [
        SourceKind::Crossref,
        SourceKind::Arxiv,
        SourceKind::SemanticScholar,
    ];
    let mut registry = SourceRegistry::new();
    // Registered out of order; priorities decide the cascade.
    for (kind, priority) in kinds.into_iter().zip([30, 10, 20]) {
        let limiter = RateLimiter::new(kind.as_str(), 100.0, 100, Duration::from_secs(5));
        registry.register(
            Arc::new(ScriptedSource::new(kind)),
            priority,
            Arc::new(limiter),
        )?;
    }
    let downloader = HttpClient::new(DownloadValidator::new(1000), 1 << 20, Duration::from_secs(5), None)?;
    let orchestrator =
        ResolutionOrchestrator::new(Arc::new(registry), downloader, &fast_config(), dir.path());

    for _ in 0..2 {
        let result = orchestrator.resolve(&doi_citation("p")).await;
        assert_eq!(result.status, DownloadStatus::Failed);
        assert_eq!(result.failure_reason, Some(FailureReason::SourcesExhausted));
        assert_eq!(
            result.attempted_sources().collect::<Vec<_>>(),
            vec![
                SourceKind::Arxiv,
                SourceKind::SemanticScholar,
                SourceKind::Crossref
            ]
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_rerun_downloads_again_from_same_source() -> TestResult {
    let server = require_mock_server!();
    mount_pdf(&server, "/paper.pdf", 2048).await;

    let dir = TempDir::new()?;
    let build = || {
        let arxiv = Arc::new(ScriptedSource::always(SourceKind::Arxiv, SourceOutcome::NotFound));
        let pmc = Arc::new(ScriptedSource::always(
            SourceKind::PubMed,
            found(SourceKind::PubMed, format!("{}/paper.pdf", server.uri())),
        ));
        build_orchestrator(vec![arxiv, pmc], &fast_config(), dir.path(), 50.0, 50)
    };

    let first = build()?.resolve(&doi_citation("42")).await;
    let second = build()?.resolve(&doi_citation("42")).await;
    assert_eq!(first.status, DownloadStatus::Success);
    assert_eq!(second.status, DownloadStatus::Success);
    assert_eq!(first.source_used, second.source_used);
    // The second run does not overwrite the first file.
    assert_ne!(first.file_path, second.file_path);
    Ok(())
}

#[tokio::test]
async fn test_rerun_with_skip_existing_is_skipped() -> TestResult {
    let server = require_mock_server!();
    mount_pdf(&server, "/paper.pdf", 2048).await;

    let dir = TempDir::new()?;
    let config = PipelineConfig {
        skip_existing: true,
        ..fast_config()
    };
    let source = Arc::new(ScriptedSource::always(
        SourceKind::OpenAlex,
        found(SourceKind::OpenAlex, format!("{}/paper.pdf", server.uri())),
    ));
    let orchestrator =
        build_orchestrator(vec![Arc::clone(&source)], &config, dir.path(), 50.0, 50)?;

    let first = orchestrator.resolve(&doi_citation("9")).await;
    let second = orchestrator.resolve(&doi_citation("9")).await;
    assert_eq!(first.status, DownloadStatus::Success);
    assert_eq!(second.status, DownloadStatus::Skipped);
    assert_eq!(second.failure_reason, Some(FailureReason::AlreadyExists));
    assert_eq!(second.file_path, first.file_path);
    assert_eq!(source.call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_registry_fails_every_citation() -> TestResult {
    let dir = TempDir::new()?;
    let orchestrator = build_orchestrator(Vec::new(), &fast_config(), dir.path(), 1.0, 1)?;
    let pool = WorkerPool::new(Arc::new(orchestrator), 4)?;

    let report = pool.run(vec![doi_citation("a"), doi_citation("b")]).await;
    assert_eq!(report.failed, 2);
    for result in &report.results {
        assert_eq!(result.failure_reason, Some(FailureReason::SourcesExhausted));
        assert!(result.sources_tried.is_empty());
    }
    assert!(report.stats.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_queries_across_workers() -> TestResult {
    let dir = TempDir::new()?;
    let source = Arc::new(ScriptedSource::new(SourceKind::SemanticScholar));
    let orchestrator =
        build_orchestrator(vec![Arc::clone(&source)], &fast_config(), dir.path(), 1.0, 1)?;
    let pool = WorkerPool::new(Arc::new(orchestrator), 5)?;
    let start = Instant::now();

    let citations = (0..5).map(|i| doi_citation(&i.to_string())).collect();
    let report = pool.run(citations).await;
    assert_eq!(report.failed, 5);

    let calls = source.calls.lock().map_err(|e| e.to_string())?.clone();
    let mut offsets: Vec<u64> = calls
        .iter()
        .map(|at| at.duration_since(start).as_secs_f64().round() as u64)
        .collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_marks_remaining_citations_skipped() -> TestResult {
    let dir = TempDir::new()?;
    let flag = Arc::new(AtomicBool::new(false));
    let source = Arc::new(ScriptedSource {
        cancel_on_call: Some(Arc::clone(&flag)),
        ..ScriptedSource::new(SourceKind::Crossref)
    });
    let orchestrator =
        build_orchestrator(vec![Arc::clone(&source)], &fast_config(), dir.path(), 50.0, 50)?
            .with_cancel_flag(Arc::clone(&flag));
    let pool = WorkerPool::new(Arc::new(orchestrator), 1)?;

    let citations = (0..3).map(|i| doi_citation(&i.to_string())).collect();
    let report = pool.run(citations).await;
    assert!(report.cancelled);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.skipped, 3);
    assert_eq!(source.call_count(), 1);
    assert!(
        report
            .results
            .iter()
            .all(|r| r.failure_reason == Some(FailureReason::Cancelled))
    );
    assert!(
        report
            .summary_lines()
            .iter()
            .any(|line| line.contains("interrupted"))
    );
    Ok(())
}
