//! Shared HTTP client construction and response handling for sources.
//!
//! Every source client and the PDF downloader are built here so timeout,
//! user-agent, compression and proxy behavior stay consistent.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, ClientBuilder, Proxy, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{ClientSettings, SourceError, SourceKind};
use crate::download::parse_retry_after;
use crate::user_agent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the reqwest client for one source.
///
/// # Errors
///
/// Returns a permanent [`SourceError`] when client construction fails.
pub fn build_source_http_client(
    kind: SourceKind,
    settings: &ClientSettings,
) -> Result<Client, SourceError> {
    let ua = user_agent::default_user_agent(settings.contact_email.as_deref());
    build_http_client(&ua, settings.timeout)
        .map_err(|error| SourceError::permanent(kind, format!("HTTP client construction failed: {error}")))
}

/// Builds a reqwest client with the shared policy.
///
/// Some sandboxed environments panic while reading system proxy settings; the
/// builder then retries with env-var proxies only.
pub(crate) fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client, String> {
    match try_build_client(user_agent, timeout, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            warn!("HTTP client builder panicked on system proxy lookup; using env-proxy fallback");
            match try_build_client(user_agent, timeout, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Panic) => {
                    Err("client builder panicked while initializing networking".to_string())
                }
                Err(BuildClientFailure::Build(error)) => Err(error.to_string()),
            }
        }
        Err(BuildClientFailure::Build(error)) => Err(error.to_string()),
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build_client(
    user_agent: &str,
    timeout: Duration,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    let user_agent = user_agent.to_string();
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .user_agent(user_agent)
            .gzip(true);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    let https = find_first_env(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]);
    if let Some(proxy) = https
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    let http = find_first_env(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]);
    if let Some(proxy) = http
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn find_first_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Sends a request and returns the response when the status is 2xx.
///
/// `404` maps to `Ok(None)`: for identifier lookups it means "this source does
/// not know the work", which is a `NotFound`, not an error.
pub(crate) async fn send(
    kind: SourceKind,
    request: RequestBuilder,
) -> Result<Option<Response>, SourceError> {
    let response = request
        .send()
        .await
        .map_err(|error| SourceError::from_reqwest(kind, &error))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        debug!(source = %kind, "lookup returned 404");
        return Ok(None);
    }
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        return Err(SourceError::from_status(kind, status.as_u16(), retry_after));
    }
    Ok(Some(response))
}

/// Sends a request and decodes a JSON body.
pub(crate) async fn get_json<T: DeserializeOwned>(
    kind: SourceKind,
    request: RequestBuilder,
) -> Result<Option<T>, SourceError> {
    let Some(response) = send(kind, request).await? else {
        return Ok(None);
    };
    let body = response
        .bytes()
        .await
        .map_err(|error| SourceError::from_reqwest(kind, &error))?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|error| SourceError::malformed(kind, error))
}

/// Sends a request and returns the body as text.
pub(crate) async fn get_text(
    kind: SourceKind,
    request: RequestBuilder,
) -> Result<Option<String>, SourceError> {
    let Some(response) = send(kind, request).await? else {
        return Ok(None);
    };
    response
        .text()
        .await
        .map(Some)
        .map_err(|error| SourceError::from_reqwest(kind, &error))
}
