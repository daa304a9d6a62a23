//! Reference resolution and download pipeline.
//!
//! # Architecture
//!
//! - [`ResolutionOrchestrator`] - Per-citation state machine over the source cascade
//! - [`WorkerPool`] - Bounded concurrency across citations
//! - [`ResultAggregator`] - Lock-free per-source statistics
//! - [`Pipeline`] - Wires the above together from a [`PipelineConfig`]
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use bibp_core::{Citation, Pipeline, PipelineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::load(None)?;
//! let cancel = Arc::new(AtomicBool::new(false));
//! let pipeline = Pipeline::from_config(&config, Path::new("./papers"), cancel)?;
//! let report = pipeline
//!     .run(vec![Citation::new("1", "").with_doi("10.48550/arXiv.1706.03762")])
//!     .await;
//! for line in report.summary_lines() {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```

mod aggregator;
mod orchestrator;
mod result;
mod worker_pool;

pub use aggregator::{AggregateStats, ResultAggregator, RunReport, SourceStats};
pub use orchestrator::ResolutionOrchestrator;
pub use result::{AttemptOutcome, DownloadResult, DownloadStatus, FailureReason, SourceAttempt};
pub use worker_pool::{ProgressCallback, WorkerPool};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;
use tracing::{info, warn};

use crate::citation::Citation;
use crate::config::{ConfigError, MAX_THREADS_RANGE, PipelineConfig};
use crate::download::{DownloadError, DownloadValidator, HttpClient};
use crate::source::SourceRegistry;

/// Errors that stop a run before any citation is processed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `max_threads` outside the supported range.
    #[error(
        "invalid max_threads {value}: must be between {} and {}",
        MAX_THREADS_RANGE.start(),
        MAX_THREADS_RANGE.end()
    )]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// Configuration could not be turned into a source cascade.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The download client could not be built.
    #[error(transparent)]
    Client(#[from] DownloadError),

    /// The output directory is unusable.
    #[error(
        "cannot use output directory {path}: {source}\n  Suggestion: check the path and its permissions"
    )]
    OutputDir {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// A ready-to-run pipeline: registry, download client, orchestrator and pool.
#[derive(Debug)]
pub struct Pipeline {
    pool: WorkerPool,
}

impl Pipeline {
    /// Validates `config` and builds every component from it, creating
    /// `output_dir` if needed.
    ///
    /// Setting `cancel` to `true` stops the run at the next safe point.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for configuration errors (including no
    /// enabled sources), an unusable output directory, or a client that
    /// cannot be built.
    pub fn from_config(
        config: &PipelineConfig,
        output_dir: &Path,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, PipelineError> {
        for warning in config.validate()? {
            warn!("{warning}");
        }
        std::fs::create_dir_all(output_dir).map_err(|source| PipelineError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let registry = SourceRegistry::from_config(config)?;
        let downloader = HttpClient::new(
            DownloadValidator::new(config.min_pdf_size),
            config.max_pdf_size,
            config.download_timeout,
            config.contact_email.as_deref(),
        )?
        .allow_plain_http(!config.https_only);

        let orchestrator =
            ResolutionOrchestrator::new(Arc::new(registry), downloader, config, output_dir)
                .with_cancel_flag(cancel);
        let pool = WorkerPool::new(Arc::new(orchestrator), config.max_threads)?;
        info!(
            output_dir = %output_dir.display(),
            max_threads = config.max_threads,
            "pipeline ready"
        );
        Ok(Self { pool })
    }

    /// Source names in cascade order.
    #[must_use]
    pub fn source_names(&self) -> Vec<crate::source::SourceKind> {
        self.pool.orchestrator().registry().names()
    }

    /// Resolves every citation.
    pub async fn run(&self, citations: Vec<Citation>) -> RunReport {
        self.pool.run(citations).await
    }

    /// Resolves every citation, calling `progress` as each one finishes.
    pub async fn run_with_progress(
        &self,
        citations: Vec<Citation>,
        progress: ProgressCallback,
    ) -> RunReport {
        self.pool.run_with_progress(citations, Some(progress)).await
    }
}
