//! Semantic Scholar Graph API client.
//!
//! The API works without a key but throttles anonymous callers hard; a
//! configured key is sent as `x-api-key`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::citation::{Citation, clean_doi};

use super::http_client::{build_source_http_client, get_json};
use super::{Candidate, ClientSettings, SourceClient, SourceError, SourceKind, SourceOutcome};

const FIELDS: &str = "title,authors,openAccessPdf,externalIds";
const SEARCH_LIMIT: usize = 3;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Paper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Paper {
    title: Option<String>,
    #[serde(default)]
    authors: Vec<PaperAuthor>,
    open_access_pdf: Option<OpenAccessPdf>,
    external_ids: Option<ExternalIds>,
}

#[derive(Debug, Deserialize)]
struct PaperAuthor {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAccessPdf {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

impl Paper {
    fn pdf_url(&self) -> Option<&str> {
        self.open_access_pdf
            .as_ref()?
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    fn doi(&self) -> Option<String> {
        self.external_ids.as_ref()?.doi.as_deref().and_then(clean_doi)
    }
}

/// Resolves citations against Semantic Scholar.
pub struct SemanticScholarClient {
    client: Client,
    settings: ClientSettings,
}

impl SemanticScholarClient {
    /// Creates a client from its settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if HTTP client construction fails.
    pub fn new(settings: ClientSettings) -> Result<Self, SourceError> {
        let client = build_source_http_client(SourceKind::SemanticScholar, &settings)?;
        Ok(Self { client, settings })
    }

    fn get(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        match self.settings.auth_token.as_deref() {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    fn candidate(&self, paper: &Paper, confidence: f64) -> Option<Candidate> {
        let url = paper.pdf_url()?;
        Some(
            self.settings
                .candidate(SourceKind::SemanticScholar, url, confidence)
                .with_doi(paper.doi()),
        )
    }

    async fn lookup_doi(&self, doi: &str) -> Result<SourceOutcome, SourceError> {
        let url = format!(
            "{}/graph/v1/paper/DOI:{}?fields={FIELDS}",
            self.settings.base_url,
            urlencoding::encode(doi)
        );
        debug!(api_url = %url, "calling Semantic Scholar paper endpoint");

        let Some(paper) = get_json::<Paper>(SourceKind::SemanticScholar, self.get(&url)).await? else {
            return Ok(SourceOutcome::NotFound);
        };
        Ok(SourceOutcome::from_candidates(
            self.candidate(&paper, 1.0).into_iter().collect(),
        ))
    }

    async fn search(&self, citation: &Citation, title: &str) -> Result<SourceOutcome, SourceError> {
        let url = format!(
            "{}/graph/v1/paper/search?query={}&limit={SEARCH_LIMIT}&fields={FIELDS}",
            self.settings.base_url,
            urlencoding::encode(title)
        );
        debug!(api_url = %url, "calling Semantic Scholar search");

        let Some(body) =
            get_json::<SearchResponse>(SourceKind::SemanticScholar, self.get(&url)).await?
        else {
            return Ok(SourceOutcome::NotFound);
        };
        let policy = self.settings.match_policy;
        let candidates = body
            .data
            .iter()
            .filter_map(|paper| {
                let confidence = policy.title_confidence(
                    citation,
                    paper.title.as_deref()?,
                    paper.authors.iter().filter_map(|a| a.name.as_deref()),
                )?;
                self.candidate(paper, confidence)
            })
            .collect();
        Ok(SourceOutcome::from_candidates(candidates))
    }
}

impl std::fmt::Debug for SemanticScholarClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticScholarClient")
            .field("base_url", &self.settings.base_url)
            .field("has_api_key", &self.settings.auth_token.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for SemanticScholarClient {
    fn kind(&self) -> SourceKind {
        SourceKind::SemanticScholar
    }

    #[tracing::instrument(skip(self, citation), fields(source = "semantic_scholar", citation_id = %citation.id))]
    async fn resolve(&self, citation: &Citation) -> Result<SourceOutcome, SourceError> {
        if let Some(doi) = citation.clean_doi() {
            return self.lookup_doi(&doi).await;
        }
        match self.settings.match_policy.query_title(citation) {
            Some(title) => self.search(citation, &title).await,
            None => Ok(SourceOutcome::NotFound),
        }
    }
}
