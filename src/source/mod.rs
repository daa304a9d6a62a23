//! Bibliographic source clients behind one uniform contract.
//!
//! Each external API (arXiv, Unpaywall, OpenAlex, Semantic Scholar, Crossref,
//! PubMed Central, CORE) is wrapped by a [`SourceClient`] that turns a
//! [`Citation`] into zero or more open-access [`Candidate`]s.
//!
//! # Architecture
//!
//! - [`SourceClient`] - Async trait every source variant implements
//! - [`SourceKind`] - Closed set of supported sources
//! - [`SourceRegistry`] - Priority-ordered cascade built once at startup
//! - [`SourceOutcome`] - `Found(candidates)` or `NotFound`
//! - [`SourceError`] - Transient vs permanent failures, which drive retries
//!
//! Adding a source means adding a [`SourceKind`] variant and its client; the
//! registry is never mutated after the pipeline starts.

mod arxiv;
mod core;
mod crossref;
mod error;
pub(crate) mod http_client;
pub mod matching;
mod openalex;
mod pubmed;
mod registry;
mod semantic_scholar;
mod unpaywall;

pub use arxiv::ArxivClient;
pub use self::core::CoreClient;
pub use crossref::CrossrefClient;
pub use error::SourceError;
pub use http_client::build_source_http_client;
pub use matching::MatchPolicy;
pub use openalex::OpenAlexClient;
pub use pubmed::PubMedClient;
pub use registry::{RegisteredSource, SourceRegistry, build_source_client};
pub use semantic_scholar::SemanticScholarClient;
pub use unpaywall::UnpaywallClient;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::citation::Citation;

/// The closed set of supported bibliographic sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// arXiv preprint server.
    Arxiv,
    /// Unpaywall OA index (DOI lookups only).
    Unpaywall,
    /// OpenAlex works catalogue.
    #[serde(rename = "openalex")]
    OpenAlex,
    /// Semantic Scholar Graph API.
    SemanticScholar,
    /// Crossref REST API.
    Crossref,
    /// NCBI PubMed Central.
    #[serde(rename = "pubmed")]
    PubMed,
    /// CORE aggregator (requires an API key).
    Core,
}

impl SourceKind {
    /// All sources in default priority order.
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Arxiv,
        SourceKind::Unpaywall,
        SourceKind::OpenAlex,
        SourceKind::SemanticScholar,
        SourceKind::Crossref,
        SourceKind::PubMed,
        SourceKind::Core,
    ];

    /// Returns the stable configuration/report name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Arxiv => "arxiv",
            SourceKind::Unpaywall => "unpaywall",
            SourceKind::OpenAlex => "openalex",
            SourceKind::SemanticScholar => "semantic_scholar",
            SourceKind::Crossref => "crossref",
            SourceKind::PubMed => "pubmed",
            SourceKind::Core => "core",
        }
    }

    /// Parses a configuration name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// Production API base URL.
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            SourceKind::Arxiv => "https://export.arxiv.org",
            SourceKind::Unpaywall => "https://api.unpaywall.org",
            SourceKind::OpenAlex => "https://api.openalex.org",
            SourceKind::SemanticScholar => "https://api.semanticscholar.org",
            SourceKind::Crossref => "https://api.crossref.org",
            SourceKind::PubMed => "https://eutils.ncbi.nlm.nih.gov",
            SourceKind::Core => "https://api.core.ac.uk",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tentative open-access location proposed by one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    /// Source that proposed the location.
    pub source_name: SourceKind,
    /// Download URL.
    pub url: String,
    /// Match confidence in `[0, 1]`.
    pub confidence: f64,
    /// DOI of the matched work, when the source reported one.
    pub matched_doi: Option<String>,
}

impl Candidate {
    /// Creates a candidate, clamping confidence into `[0, 1]`.
    #[must_use]
    pub fn new(source_name: SourceKind, url: impl Into<String>, confidence: f64) -> Self {
        Self {
            source_name,
            url: url.into(),
            confidence: confidence.clamp(0.0, 1.0),
            matched_doi: None,
        }
    }

    /// Attaches the matched DOI.
    #[must_use]
    pub fn with_doi(mut self, doi: Option<String>) -> Self {
        self.matched_doi = doi;
        self
    }
}

/// Result of a single `resolve` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    /// One or more candidate locations.
    Found(Vec<Candidate>),
    /// The source has no open-access copy for this citation.
    NotFound,
}

impl SourceOutcome {
    /// Wraps candidates, collapsing an empty list into [`SourceOutcome::NotFound`].
    #[must_use]
    pub fn from_candidates(candidates: Vec<Candidate>) -> Self {
        if candidates.is_empty() {
            Self::NotFound
        } else {
            Self::Found(candidates)
        }
    }
}

/// Picks the best candidate: highest confidence, ties broken by shortest URL,
/// then lexicographic URL so the choice is fully deterministic.
#[must_use]
pub fn select_best(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.url.len().cmp(&b.url.len()))
            .then_with(|| a.url.cmp(&b.url))
    })
}

/// Per-client construction settings derived from configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// API base URL (no trailing slash).
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Bearer token / API key.
    pub auth_token: Option<String>,
    /// Contact e-mail for polite pools.
    pub contact_email: Option<String>,
    /// Title matching thresholds.
    pub match_policy: MatchPolicy,
    /// Upgrade `http://` candidate URLs to `https://`.
    pub https_only: bool,
}

impl ClientSettings {
    /// Settings pointing at `kind`'s production API with default thresholds.
    #[must_use]
    pub fn for_kind(kind: SourceKind) -> Self {
        Self {
            base_url: kind.default_base_url().to_string(),
            timeout: Duration::from_secs(15),
            auth_token: None,
            contact_email: None,
            match_policy: MatchPolicy::default(),
            https_only: true,
        }
    }

    /// Overrides the base URL (used by tests against a mock server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Builds a candidate, applying the https upgrade policy to its URL.
    pub(crate) fn candidate(&self, kind: SourceKind, url: &str, confidence: f64) -> Candidate {
        Candidate::new(kind, self.normalize_candidate_url(url), confidence)
    }

    fn normalize_candidate_url(&self, url: &str) -> String {
        let trimmed = url.trim();
        if self.https_only
            && let Some(rest) = trimmed.strip_prefix("http://")
        {
            return format!("https://{rest}");
        }
        trimmed.to_string()
    }
}

/// Trait every bibliographic source implements.
///
/// # Contract
///
/// - `Ok(SourceOutcome::Found(..))` with at least one candidate, or `Ok(NotFound)`
/// - `Err(SourceError::Transient)` for timeouts, HTTP 429 and 5xx (retried)
/// - `Err(SourceError::Permanent)` for other 4xx and malformed payloads (not retried)
///
/// # Object Safety
///
/// Uses `async_trait` so the registry can hold `Arc<dyn SourceClient>`.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Which source this client talks to.
    fn kind(&self) -> SourceKind;

    /// Looks up open-access locations for a citation.
    async fn resolve(&self, citation: &Citation) -> Result<SourceOutcome, SourceError>;
}
