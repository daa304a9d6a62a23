//! HTTP client for streaming candidate PDFs to disk.
//!
//! A body is written to `<final>.part` while its size and leading bytes are
//! tracked; only after [`DownloadValidator`] accepts it is the staging file
//! linked into place. Any failure removes the staging file, so the output
//! directory never holds a partial or unvalidated PDF under its final name.
//!
//! Staging files are created exclusively and publishing uses a hard link,
//! which fails instead of replacing an existing file. Two downloads aimed at
//! the same name therefore both land, the later one under a fallback name.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::DownloadError;
use super::filename::{part_path, staging_path};
use super::rate_limiter::parse_retry_after;
use super::validator::DownloadValidator;
use crate::source::http_client::build_http_client;
use crate::user_agent;

/// Default total timeout for one PDF download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Concurrent downloads that may stage towards one final name.
const MAX_STAGING_ATTEMPTS: usize = 100;

/// Default maximum accepted body size (200 MiB).
pub const DEFAULT_MAX_PDF_SIZE: u64 = 200 * 1024 * 1024;

/// A validated file published under its final name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// Final output path.
    pub path: PathBuf,
    /// Size of the body in bytes.
    pub bytes_written: u64,
}

/// HTTP client for downloading and validating PDFs.
///
/// Create once and share (cheap to clone) so connections are pooled.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    validator: DownloadValidator,
    max_pdf_size: u64,
    allow_plain_http: bool,
}

impl HttpClient {
    /// Creates a download client.
    ///
    /// # Arguments
    ///
    /// * `validator` - Acceptance rules applied to every body
    /// * `max_pdf_size` - Bodies larger than this are aborted mid-stream
    /// * `timeout` - Total time allowed for one download
    /// * `contact_email` - Included in the User-Agent when set
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] when the underlying client cannot
    /// be constructed.
    pub fn new(
        validator: DownloadValidator,
        max_pdf_size: u64,
        timeout: Duration,
        contact_email: Option<&str>,
    ) -> Result<Self, DownloadError> {
        let ua = user_agent::default_user_agent(contact_email);
        let client = build_http_client(&ua, timeout)
            .map_err(|message| DownloadError::ClientBuild { message })?;
        Ok(Self {
            client,
            validator,
            max_pdf_size,
            allow_plain_http: false,
        })
    }

    /// Allows `http://` URLs (local mock servers in tests).
    #[must_use]
    pub fn allow_plain_http(mut self, allow: bool) -> Self {
        self.allow_plain_http = allow;
        self
    }

    /// Downloads `url`, validates the body and publishes it at `final_path`.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::InvalidUrl`] for malformed or disallowed URLs
    /// - [`DownloadError::HttpStatus`] / [`DownloadError::Network`] /
    ///   [`DownloadError::Timeout`] for transport failures
    /// - [`DownloadError::TooLarge`] when the body exceeds `max_pdf_size`
    /// - [`DownloadError::Rejected`] when the validator refuses the body
    /// - [`DownloadError::Io`] for staging or publish failures, including
    ///   `final_path` already existing
    pub async fn download_validated(
        &self,
        url: &str,
        final_path: &Path,
    ) -> Result<DownloadedFile, DownloadError> {
        self.download_validated_with_fallbacks(url, final_path, std::iter::empty())
            .await
    }

    /// Like [`download_validated`](Self::download_validated), but when
    /// `final_path` is taken at publish time the body goes to the first free
    /// path in `fallbacks`. No existing file is ever replaced.
    ///
    /// # Errors
    ///
    /// As for `download_validated`; [`DownloadError::Io`] with
    /// `AlreadyExists` when every path is taken.
    #[instrument(skip(self, final_path, fallbacks), fields(url = %url, path = %final_path.display()))]
    pub async fn download_validated_with_fallbacks(
        &self,
        url: &str,
        final_path: &Path,
        fallbacks: impl IntoIterator<Item = PathBuf>,
    ) -> Result<DownloadedFile, DownloadError> {
        self.check_url(url)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| DownloadError::network(url, error))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.validator
            .check_content_type(content_type.as_deref())
            .map_err(|reason| DownloadError::rejected(url, reason))?;

        if let Some(length) = response.content_length()
            && length > self.max_pdf_size
        {
            return Err(DownloadError::TooLarge {
                url: url.to_string(),
                limit: self.max_pdf_size,
            });
        }

        let (staging, file) = create_staging(final_path).await?;
        let streamed = self.stream_to_staging(response, url, &staging, file).await;
        let (bytes_written, head) = match streamed {
            Ok(streamed) => streamed,
            Err(error) => {
                remove_staging(&staging).await;
                return Err(error);
            }
        };

        if let Err(reason) = self
            .validator
            .validate(&head, bytes_written, content_type.as_deref())
        {
            debug!(bytes_written, %reason, "validator rejected body");
            remove_staging(&staging).await;
            return Err(DownloadError::rejected(url, reason));
        }

        let published = publish(&staging, final_path, fallbacks).await;
        remove_staging(&staging).await;
        let path = published?;

        debug!(bytes_written, path = %path.display(), "download published");
        Ok(DownloadedFile {
            path,
            bytes_written,
        })
    }

    fn check_url(&self, url: &str) -> Result<(), DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        match parsed.scheme() {
            "https" => Ok(()),
            "http" if self.allow_plain_http => Ok(()),
            _ => Err(DownloadError::invalid_url(url)),
        }
    }

    /// Streams the body into `staging`, returning the byte count and the
    /// leading bytes the validator needs.
    async fn stream_to_staging(
        &self,
        response: reqwest::Response,
        url: &str,
        staging: &Path,
        file: File,
    ) -> Result<(u64, Vec<u8>), DownloadError> {
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let head_len = self.validator.head_len();
        let mut head = Vec::with_capacity(head_len);
        let mut bytes_written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| DownloadError::network(url, error))?;
            if head.len() < head_len {
                let take = (head_len - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            bytes_written += chunk.len() as u64;
            if bytes_written > self.max_pdf_size {
                return Err(DownloadError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_pdf_size,
                });
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|error| DownloadError::io(staging, error))?;
        }

        writer
            .flush()
            .await
            .map_err(|error| DownloadError::io(staging, error))?;
        Ok((bytes_written, head))
    }
}

/// Creates a staging file no other download is using.
async fn create_staging(final_path: &Path) -> Result<(PathBuf, File), DownloadError> {
    let mut last_error = None;
    for n in 0..MAX_STAGING_ATTEMPTS {
        let staging = staging_path(final_path, n);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .await
        {
            Ok(file) => return Ok((staging, file)),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => last_error = Some(error),
            Err(error) => return Err(DownloadError::io(staging, error)),
        }
    }
    let error = last_error.unwrap_or_else(|| ErrorKind::AlreadyExists.into());
    Err(DownloadError::io(part_path(final_path), error))
}

/// Links `staging` to the first free path, starting with `final_path`.
async fn publish(
    staging: &Path,
    final_path: &Path,
    fallbacks: impl IntoIterator<Item = PathBuf>,
) -> Result<PathBuf, DownloadError> {
    let first = tokio::fs::hard_link(staging, final_path).await;
    match first {
        Ok(()) => return Ok(final_path.to_path_buf()),
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
        Err(error) => return Err(DownloadError::io(final_path, error)),
    }
    for target in fallbacks {
        match tokio::fs::hard_link(staging, &target).await {
            Ok(()) => {
                info!(
                    wanted = %final_path.display(),
                    path = %target.display(),
                    "target appeared during download; published under another name"
                );
                return Ok(target);
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
            Err(error) => return Err(DownloadError::io(target, error)),
        }
    }
    Err(DownloadError::io(final_path, ErrorKind::AlreadyExists.into()))
}

async fn remove_staging(staging: &Path) {
    if let Err(error) = tokio::fs::remove_file(staging).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %staging.display(), %error, "failed to remove staging file");
    }
}
