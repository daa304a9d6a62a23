//! PubMed Central client.
//!
//! Searches `esearch.fcgi` on the `pmc` database so a single request yields
//! PMC ids directly; every PMC article has a stable PDF route.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::citation::Citation;

use super::http_client::{build_source_http_client, get_json};
use super::{ClientSettings, SourceClient, SourceError, SourceKind, SourceOutcome};

/// Article PDF route; `{id}` is the numeric PMC id.
const PMC_PDF_BASE: &str = "https://www.ncbi.nlm.nih.gov/pmc/articles";

/// Two ids are enough to tell a unique hit from an ambiguous one.
const RETMAX: usize = 2;

const UNIQUE_TITLE_CONFIDENCE: f64 = 0.9;
const AMBIGUOUS_TITLE_CONFIDENCE: f64 = 0.75;

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

/// Query strategy for one citation.
#[derive(Debug, Clone, PartialEq)]
enum Term {
    Doi(String),
    Title(String),
}

impl Term {
    fn render(&self) -> String {
        match self {
            Term::Doi(doi) => format!("{doi}[doi]"),
            Term::Title(title) => format!("\"{}\"[Title]", title.replace('"', " ")),
        }
    }

    fn confidence(&self, hits: usize) -> f64 {
        match self {
            Term::Doi(_) => 1.0,
            Term::Title(_) if hits == 1 => UNIQUE_TITLE_CONFIDENCE,
            Term::Title(_) => AMBIGUOUS_TITLE_CONFIDENCE,
        }
    }
}

/// Resolves citations to PubMed Central PDFs.
pub struct PubMedClient {
    client: Client,
    settings: ClientSettings,
}

impl PubMedClient {
    /// Creates a client from its settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if HTTP client construction fails.
    pub fn new(settings: ClientSettings) -> Result<Self, SourceError> {
        let client = build_source_http_client(SourceKind::PubMed, &settings)?;
        Ok(Self { client, settings })
    }

    fn search_url(&self, term: &Term) -> String {
        let mut url = format!(
            "{}/entrez/eutils/esearch.fcgi?db=pmc&term={}&retmode=json&retmax={RETMAX}&tool=bibp",
            self.settings.base_url,
            urlencoding::encode(&term.render())
        );
        if let Some(email) = self.settings.contact_email.as_deref() {
            url.push_str("&email=");
            url.push_str(&urlencoding::encode(email));
        }
        if let Some(key) = self.settings.auth_token.as_deref() {
            url.push_str("&api_key=");
            url.push_str(&urlencoding::encode(key));
        }
        url
    }
}

impl std::fmt::Debug for PubMedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubMedClient")
            .field("base_url", &self.settings.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for PubMedClient {
    fn kind(&self) -> SourceKind {
        SourceKind::PubMed
    }

    #[tracing::instrument(skip(self, citation), fields(source = "pubmed", citation_id = %citation.id))]
    async fn resolve(&self, citation: &Citation) -> Result<SourceOutcome, SourceError> {
        let term = match citation.clean_doi() {
            Some(doi) => Term::Doi(doi),
            None => match self.settings.match_policy.query_title(citation) {
                Some(title) => Term::Title(title),
                None => return Ok(SourceOutcome::NotFound),
            },
        };
        let url = self.search_url(&term);
        debug!(api_url = %url, "calling PMC esearch");

        let Some(body) = get_json::<ESearchResponse>(SourceKind::PubMed, self.client.get(&url)).await?
        else {
            return Ok(SourceOutcome::NotFound);
        };
        let ids = body.esearchresult.idlist;
        let Some(pmc_id) = ids.first().map(|id| id.trim().trim_start_matches("PMC")) else {
            return Ok(SourceOutcome::NotFound);
        };
        if pmc_id.is_empty() || !pmc_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SourceError::malformed(
                SourceKind::PubMed,
                format!("unexpected PMC id {pmc_id:?}"),
            ));
        }
        let matched_doi = match &term {
            Term::Doi(doi) => Some(doi.clone()),
            Term::Title(_) => None,
        };
        let candidate = self
            .settings
            .candidate(
                SourceKind::PubMed,
                &format!("{PMC_PDF_BASE}/PMC{pmc_id}/pdf/"),
                term.confidence(ids.len()),
            )
            .with_doi(matched_doi);
        Ok(SourceOutcome::Found(vec![candidate]))
    }
}
