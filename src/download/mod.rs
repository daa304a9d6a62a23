//! Rate limiting, retrying, and validated PDF downloads.
//!
//! # Features
//!
//! - Per-source token buckets shared by every worker ([`RateLimiter`])
//! - Capped exponential backoff with jitter ([`RetryPolicy`])
//! - Streaming downloads staged in `.part` files ([`HttpClient`])
//! - Content-type, size and magic-byte checks ([`DownloadValidator`])
//! - Deterministic, collision-free output filenames
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use bibp_core::download::{DownloadValidator, HttpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new(DownloadValidator::new(1000), 1 << 20, Duration::from_secs(60), None)?;
//! let file = client
//!     .download_validated("https://arxiv.org/pdf/1706.03762.pdf", Path::new("./out/ref_1.pdf"))
//!     .await?;
//! println!("Downloaded {} bytes", file.bytes_written);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod filename;
pub mod rate_limiter;
mod retry;
mod validator;

pub use client::{DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_MAX_PDF_SIZE, DownloadedFile, HttpClient};
pub use error::DownloadError;
pub use filename::{
    TargetPath, citation_filename, collision_filename, collision_paths, part_path,
    resolve_target_path, staging_path,
};
pub use rate_limiter::{RateLimitTimeout, RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, FailureType, RetryDecision,
    RetryPolicy, classify_http_status,
};
pub use validator::{DEFAULT_MIN_PDF_SIZE, DownloadValidator, PDF_MAGIC, RejectReason};
