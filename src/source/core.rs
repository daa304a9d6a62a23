//! CORE aggregator client (API v3, Bearer token required).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::citation::{Citation, clean_doi};

use super::http_client::{build_source_http_client, get_json};
use super::{Candidate, ClientSettings, SourceClient, SourceError, SourceKind, SourceOutcome};

const SEARCH_LIMIT: usize = 3;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CoreWork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoreWork {
    title: Option<String>,
    #[serde(default)]
    authors: Vec<CoreAuthor>,
    doi: Option<String>,
    download_url: Option<String>,
    #[serde(default, alias = "sourceFulltextUrls")]
    fulltext_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CoreAuthor {
    name: Option<String>,
}

impl CoreWork {
    /// `downloadUrl` when present, else the first full-text URL that ends in `.pdf`.
    fn pdf_url(&self) -> Option<&str> {
        self.download_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .or_else(|| {
                self.fulltext_urls
                    .iter()
                    .map(|url| url.trim())
                    .find(|url| url.to_ascii_lowercase().ends_with(".pdf"))
            })
    }

    fn doi(&self) -> Option<String> {
        self.doi.as_deref().and_then(clean_doi)
    }
}

/// Resolves citations against CORE.
pub struct CoreClient {
    client: Client,
    settings: ClientSettings,
}

impl CoreClient {
    /// Creates a client from its settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if HTTP client construction fails.
    pub fn new(settings: ClientSettings) -> Result<Self, SourceError> {
        let client = build_source_http_client(SourceKind::Core, &settings)?;
        Ok(Self { client, settings })
    }

    fn candidate(&self, work: &CoreWork, confidence: f64) -> Option<Candidate> {
        let url = work.pdf_url()?;
        Some(
            self.settings
                .candidate(SourceKind::Core, url, confidence)
                .with_doi(work.doi()),
        )
    }

    fn score(&self, citation: &Citation, doi: Option<&str>, work: &CoreWork) -> Option<f64> {
        match doi {
            Some(doi) => work
                .doi()
                .is_some_and(|found| found.eq_ignore_ascii_case(doi))
                .then_some(1.0),
            None => self.settings.match_policy.title_confidence(
                citation,
                work.title.as_deref()?,
                work.authors.iter().filter_map(|a| a.name.as_deref()),
            ),
        }
    }
}

impl std::fmt::Debug for CoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreClient")
            .field("base_url", &self.settings.base_url)
            .field("has_api_key", &self.settings.auth_token.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for CoreClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Core
    }

    #[tracing::instrument(skip(self, citation), fields(source = "core", citation_id = %citation.id))]
    async fn resolve(&self, citation: &Citation) -> Result<SourceOutcome, SourceError> {
        let Some(token) = self.settings.auth_token.as_deref() else {
            return Err(SourceError::permanent(
                SourceKind::Core,
                "an API key is required (set CORE_API_KEY)",
            ));
        };
        let doi = citation.clean_doi();
        let query = match (&doi, self.settings.match_policy.query_title(citation)) {
            (Some(doi), _) => format!("doi:\"{doi}\""),
            (None, Some(title)) => format!("title:\"{}\"", title.replace('"', " ")),
            (None, None) => return Ok(SourceOutcome::NotFound),
        };
        let url = format!(
            "{}/v3/search/works?q={}&limit={SEARCH_LIMIT}",
            self.settings.base_url,
            urlencoding::encode(&query)
        );
        debug!(api_url = %url, "calling CORE search");

        let request = self.client.get(&url).bearer_auth(token);
        let Some(body) = get_json::<SearchResponse>(SourceKind::Core, request).await? else {
            return Ok(SourceOutcome::NotFound);
        };
        let candidates = body
            .results
            .iter()
            .filter_map(|work| {
                let confidence = self.score(citation, doi.as_deref(), work)?;
                self.candidate(work, confidence)
            })
            .collect();
        Ok(SourceOutcome::from_candidates(candidates))
    }
}
