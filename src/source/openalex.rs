//! OpenAlex client.
//!
//! DOI lookups hit `works/doi:{doi}` directly; title lookups use the
//! `works?search=` endpoint and fuzzy-match `display_name`. Candidates come
//! from `open_access.oa_url` and from open-access `locations[].pdf_url`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::citation::{Citation, clean_doi};

use super::http_client::{build_source_http_client, get_json};
use super::{Candidate, ClientSettings, SourceClient, SourceError, SourceKind, SourceOutcome};

const SEARCH_PER_PAGE: usize = 5;

/// `oa_url` may point at a landing page rather than the PDF itself.
const LANDING_URL_FACTOR: f64 = 0.9;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<OpenAlexWork>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexWork {
    doi: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    authorships: Vec<Authorship>,
    open_access: Option<OpenAccess>,
    #[serde(default)]
    locations: Vec<Location>,
}

#[derive(Debug, Deserialize)]
struct Authorship {
    author: Option<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAccess {
    #[serde(default)]
    is_oa: bool,
    oa_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Location {
    #[serde(default)]
    is_oa: bool,
    pdf_url: Option<String>,
}

impl OpenAlexWork {
    fn author_names(&self) -> impl Iterator<Item = &str> {
        self.authorships
            .iter()
            .filter_map(|a| a.author.as_ref()?.display_name.as_deref())
    }

    /// Distinct OA URLs, each with its relative weight.
    fn oa_urls(&self) -> Vec<(&str, f64)> {
        let mut urls: Vec<(&str, f64)> = Vec::new();
        for location in self.locations.iter().filter(|l| l.is_oa) {
            if let Some(pdf_url) = location.pdf_url.as_deref() {
                push_distinct(&mut urls, pdf_url, 1.0);
            }
        }
        if let Some(oa) = &self.open_access
            && oa.is_oa
            && let Some(oa_url) = oa.oa_url.as_deref()
        {
            let weight = if oa_url.to_ascii_lowercase().ends_with(".pdf") {
                1.0
            } else {
                LANDING_URL_FACTOR
            };
            push_distinct(&mut urls, oa_url, weight);
        }
        urls
    }
}

fn push_distinct<'a>(urls: &mut Vec<(&'a str, f64)>, url: &'a str, weight: f64) {
    let url = url.trim();
    if !url.is_empty() && !urls.iter().any(|(seen, _)| *seen == url) {
        urls.push((url, weight));
    }
}

/// Resolves citations against the OpenAlex works catalogue.
pub struct OpenAlexClient {
    client: Client,
    settings: ClientSettings,
}

impl OpenAlexClient {
    /// Creates a client from its settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if HTTP client construction fails.
    pub fn new(settings: ClientSettings) -> Result<Self, SourceError> {
        let client = build_source_http_client(SourceKind::OpenAlex, &settings)?;
        Ok(Self { client, settings })
    }

    fn with_mailto(&self, mut url: String) -> String {
        if let Some(email) = self.settings.contact_email.as_deref() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str("mailto=");
            url.push_str(&urlencoding::encode(email));
        }
        url
    }

    fn work_candidates(&self, work: &OpenAlexWork, confidence: f64) -> Vec<Candidate> {
        let matched_doi = work.doi.as_deref().and_then(clean_doi);
        work.oa_urls()
            .into_iter()
            .map(|(url, weight)| {
                self.settings
                    .candidate(SourceKind::OpenAlex, url, confidence * weight)
                    .with_doi(matched_doi.clone())
            })
            .collect()
    }

    async fn lookup_doi(&self, doi: &str) -> Result<SourceOutcome, SourceError> {
        // OpenAlex wants the DOI path unescaped.
        let encoded = urlencoding::encode(doi).replace("%2F", "/");
        let url = self.with_mailto(format!("{}/works/doi:{encoded}", self.settings.base_url));
        debug!(api_url = %url, "calling OpenAlex works endpoint");

        let Some(work) = get_json::<OpenAlexWork>(SourceKind::OpenAlex, self.client.get(&url)).await?
        else {
            return Ok(SourceOutcome::NotFound);
        };
        Ok(SourceOutcome::from_candidates(self.work_candidates(&work, 1.0)))
    }

    async fn search(&self, citation: &Citation, title: &str) -> Result<SourceOutcome, SourceError> {
        let url = self.with_mailto(format!(
            "{}/works?search={}&per-page={SEARCH_PER_PAGE}",
            self.settings.base_url,
            urlencoding::encode(title)
        ));
        debug!(api_url = %url, "calling OpenAlex search");

        let Some(body) = get_json::<SearchResponse>(SourceKind::OpenAlex, self.client.get(&url)).await?
        else {
            return Ok(SourceOutcome::NotFound);
        };
        let policy = self.settings.match_policy;
        let mut candidates = Vec::new();
        for work in &body.results {
            let Some(name) = work.display_name.as_deref() else {
                continue;
            };
            if let Some(confidence) = policy.title_confidence(citation, name, work.author_names()) {
                candidates.extend(self.work_candidates(work, confidence));
            }
        }
        Ok(SourceOutcome::from_candidates(candidates))
    }
}

impl std::fmt::Debug for OpenAlexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAlexClient")
            .field("base_url", &self.settings.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for OpenAlexClient {
    fn kind(&self) -> SourceKind {
        SourceKind::OpenAlex
    }

    #[tracing::instrument(skip(self, citation), fields(source = "openalex", citation_id = %citation.id))]
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
