//! Normalized citation records handed over by the extraction collaborator.
//!
//! A [`Citation`] is immutable once it enters the pipeline. The helpers in this
//! module derive the lookup keys sources query with (cleaned DOI, arXiv id,
//! normalized title, first-author family name) without mutating the record, so
//! citations with missing fields degrade to weaker lookups instead of erroring.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bare DOI after prefix stripping: `10.<registrant>/<suffix>`.
#[allow(clippy::expect_used)]
static DOI_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^10\.\d+(?:\.\d+)*/\S+$").expect("DOI regex is valid") // Static pattern, safe to panic
});

/// `https://doi.org/` / `http://dx.doi.org/` / `doi:` prefixes.
#[allow(clippy::expect_used)]
static DOI_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:https?://(?:dx\.)?doi\.org/|doi:\s*)").expect("DOI prefix regex is valid")
});

/// New-style arXiv identifiers mentioned in free text (`arXiv:2301.01234v2`).
#[allow(clippy::expect_used)]
static ARXIV_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)arxiv:?\s*(\d{4}\.\d{4,5}(?:v\d+)?)").expect("arXiv regex is valid")
});

/// arXiv DOIs minted by DataCite: `10.48550/arXiv.2301.01234`.
#[allow(clippy::expect_used)]
static ARXIV_DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^10\.48550/arxiv\.(\d{4}\.\d{4,5}(?:v\d+)?)$").expect("arXiv DOI regex is valid")
});

/// One bibliographic reference extracted from a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Caller-assigned identifier, unique within a run.
    pub id: String,
    /// Raw reference string as it appeared in the bibliography.
    #[serde(default)]
    pub raw_text: String,
    /// Parsed title, if the extractor found one.
    #[serde(default)]
    pub title: Option<String>,
    /// Author names in document order.
    #[serde(default)]
    pub authors: Vec<String>,
    /// Publication year.
    #[serde(default)]
    pub year: Option<i32>,
    /// DOI in any common notation (bare, URL, `doi:` prefixed).
    #[serde(default)]
    pub doi: Option<String>,
    /// Journal or conference name.
    #[serde(default)]
    pub venue: Option<String>,
    /// Extraction quality in `[0, 1]`.
    #[serde(default = "default_quality_score")]
    pub quality_score: f64,
}

fn default_quality_score() -> f64 {
    1.0
}

impl Citation {
    /// Creates a citation with only an id and raw text.
    #[must_use]
    pub fn new(id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            raw_text: raw_text.into(),
            title: None,
            authors: Vec::new(),
            year: None,
            doi: None,
            venue: None,
            quality_score: default_quality_score(),
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the DOI.
    #[must_use]
    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    /// Sets the author list.
    #[must_use]
    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the year.
    #[must_use]
    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    /// Sets the quality score.
    #[must_use]
    pub fn with_quality_score(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }

    /// Returns the cleaned DOI, or `None` when absent or malformed.
    #[must_use]
    pub fn clean_doi(&self) -> Option<String> {
        self.doi.as_deref().and_then(clean_doi)
    }

    /// Returns the arXiv identifier from the DOI, raw text, or title.
    #[must_use]
    pub fn arxiv_id(&self) -> Option<String> {
        if let Some(doi) = self.clean_doi()
            && let Some(caps) = ARXIV_DOI.captures(&doi)
        {
            return Some(caps[1].to_string());
        }
        [Some(self.raw_text.as_str()), self.title.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|text| ARXIV_IN_TEXT.captures(text).map(|caps| caps[1].to_string()))
    }

    /// Returns the trimmed title when it is at least `min_len` characters long.
    #[must_use]
    pub fn usable_title(&self, min_len: usize) -> Option<&str> {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| title.chars().count() >= min_len)
    }

    /// Returns the family name of the first author, lowercased.
    ///
    /// Handles both `Family, Given` and `Given Family` notations.
    #[must_use]
    pub fn first_author_family(&self) -> Option<String> {
        let first = self.authors.first()?.trim();
        if first.is_empty() {
            return None;
        }
        let family = match first.split_once(',') {
            Some((family, _)) => family.trim(),
            None => first.split_whitespace().last().unwrap_or(first),
        };
        let family = family.trim_matches(|c: char| !c.is_alphanumeric());
        (!family.is_empty()).then(|| family.to_lowercase())
    }

    /// Returns true when the citation carries no key any source can query.
    #[must_use]
    pub fn has_no_lookup_keys(&self) -> bool {
        self.clean_doi().is_none()
            && self.arxiv_id().is_none()
            && self.title.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.raw_text.trim().is_empty()
    }
}

/// Cleans a DOI: strips resolver/`doi:` prefixes and trailing dots.
///
/// Returns `None` when the result is not shaped like `10.<digits>/<suffix>`.
///
/// # Examples
///
/// ```
/// use bibp_core::citation::clean_doi;
///
/// assert_eq!(clean_doi("https://doi.org/10.1234/x."), Some("10.1234/x".to_string()));
/// assert_eq!(clean_doi("not a doi"), None);
/// ```
#[must_use]
pub fn clean_doi(raw: &str) -> Option<String> {
    let stripped = DOI_PREFIX.replace(raw.trim(), "");
    let cleaned = stripped.trim().trim_end_matches('.');
    DOI_SHAPE.is_match(cleaned).then(|| cleaned.to_string())
}

/// Normalizes a title for comparison: lowercase alphanumerics separated by
/// single spaces.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_space = false;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}
