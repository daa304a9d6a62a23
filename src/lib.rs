//! BibP core library.
//!
//! Turns a bibliography (a list of [`Citation`]s extracted from a paper) into
//! downloaded, validated open-access PDFs of the cited works.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`citation`] - Citation records and lookup-key normalization
//! - [`config`] - Pipeline and per-source configuration (TOML + environment)
//! - [`source`] - Bibliographic API clients and the priority registry
//! - [`download`] - Rate limiting, retries, validation and streaming downloads
//! - [`pipeline`] - Orchestrator state machine, worker pool and statistics

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod citation;
pub mod config;
pub mod download;
pub mod pipeline;
pub mod source;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use citation::Citation;
pub use config::{ConfigError, PipelineConfig, SourceConfig};
pub use download::{
    DownloadError, DownloadValidator, FailureType, HttpClient, RateLimitTimeout, RateLimiter,
    RejectReason, RetryDecision, RetryPolicy,
};
pub use pipeline::{
    AggregateStats, AttemptOutcome, DownloadResult, DownloadStatus, FailureReason, Pipeline,
    PipelineError, ResolutionOrchestrator, ResultAggregator, RunReport, SourceAttempt,
    SourceStats, WorkerPool,
};
pub use source::{
    Candidate, SourceClient, SourceError, SourceKind, SourceOutcome, SourceRegistry, select_best,
};
