//! Acceptance rules for downloaded bodies.
//!
//! A body is accepted only when all three checks pass, evaluated in this order:
//!
//! 1. the declared `Content-Type` indicates a PDF (or is generic/absent)
//! 2. the body is at least `min_pdf_size` bytes
//! 3. the body starts with the `%PDF-` magic signature
//!
//! The validator only needs the first few bytes plus the total length, so the
//! HTTP client can stream large bodies to disk and keep a small head buffer.

use std::fmt;

use serde::Serialize;
use tracing::debug;

/// PDF magic signature.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// Default minimum acceptable PDF size in bytes.
pub const DEFAULT_MIN_PDF_SIZE: u64 = 1000;

/// Why a body was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// Shorter than the configured minimum.
    TooSmall {
        /// Observed size in bytes.
        size: u64,
        /// Configured minimum in bytes.
        min: u64,
    },
    /// Declared content type is not a PDF (HTML landing pages, mostly).
    WrongType,
    /// Leading bytes are not `%PDF-`.
    BadMagic,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall { size, min } => write!(f, "too small ({size} bytes, minimum {min})"),
            Self::WrongType => f.write_str("content type is not PDF"),
            Self::BadMagic => f.write_str("missing %PDF- signature"),
        }
    }
}

/// Checks fetched content against the PDF acceptance rules.
#[derive(Debug, Clone, Copy)]
pub struct DownloadValidator {
    min_pdf_size: u64,
}

impl Default for DownloadValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PDF_SIZE)
    }
}

impl DownloadValidator {
    /// Creates a validator with the given minimum size.
    #[must_use]
    pub fn new(min_pdf_size: u64) -> Self {
        Self { min_pdf_size }
    }

    /// Number of leading bytes the validator inspects.
    #[must_use]
    pub fn head_len(&self) -> usize {
        PDF_MAGIC.len()
    }

    /// Validates a body given its leading bytes, total size and declared type.
    ///
    /// # Errors
    ///
    /// Returns the first failing [`RejectReason`].
    pub fn validate(
        &self,
        head: &[u8],
        total_size: u64,
        declared_content_type: Option<&str>,
    ) -> Result<(), RejectReason> {
        self.check_content_type(declared_content_type)?;
        if total_size < self.min_pdf_size {
            return Err(RejectReason::TooSmall {
                size: total_size,
                min: self.min_pdf_size,
            });
        }
        if !head.starts_with(PDF_MAGIC) {
            return Err(RejectReason::BadMagic);
        }
        Ok(())
    }

    /// Checks only the declared content type, so a client can give up before
    /// streaming an HTML landing page.
    ///
    /// # Errors
    ///
    /// Returns [`RejectReason::WrongType`] for non-PDF types.
    pub fn check_content_type(&self, declared_content_type: Option<&str>) -> Result<(), RejectReason> {
        if content_type_allows_pdf(declared_content_type) {
            Ok(())
        } else {
            debug!(content_type = ?declared_content_type, "rejecting non-PDF content type");
            Err(RejectReason::WrongType)
        }
    }

    /// Convenience for fully buffered bodies.
    ///
    /// # Errors
    ///
    /// Returns the first failing [`RejectReason`].
    pub fn validate_bytes(
        &self,
        body: &[u8],
        declared_content_type: Option<&str>,
    ) -> Result<(), RejectReason> {
        self.validate(body, body.len() as u64, declared_content_type)
    }
}

/// Generic binary types are accepted because many repositories serve PDFs as
/// `application/octet-stream`; the magic check still guards them.
fn content_type_allows_pdf(content_type: Option<&str>) -> bool {
    let Some(raw) = content_type else {
        return true;
    };
    let mime = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    mime.is_empty()
        || mime.contains("pdf")
        || mime == "application/octet-stream"
        || mime == "binary/octet-stream"
        || mime == "application/download"
        || mime == "application/force-download"
}
