//! Fuzzy title matching and confidence heuristics for title-based lookups.
//!
//! Identifier lookups (DOI, arXiv id) are exact and score 1.0. Title searches
//! return whatever the remote index considers relevant, so every hit is
//! re-scored locally: the normalized titles must be at least
//! `min_title_similarity` alike, and a matching first-author family name adds
//! a small bonus. Title-based confidence never reaches 1.0.

use crate::citation::{Citation, normalize_title};

/// Default minimum normalized similarity for a title match.
pub const DEFAULT_MIN_TITLE_SIMILARITY: f64 = 0.85;

/// Default minimum title length (characters) worth searching for.
pub const DEFAULT_MIN_TITLE_LENGTH: usize = 10;

/// Titles are truncated to this many characters in search queries.
pub const MAX_QUERY_TITLE_CHARS: usize = 200;

/// Scale applied to raw title similarity.
const TITLE_CONFIDENCE_SCALE: f64 = 0.95;

/// Bonus for a matching first-author family name.
const AUTHOR_BONUS: f64 = 0.04;

/// Ceiling for any title-derived confidence.
const MAX_TITLE_CONFIDENCE: f64 = 0.99;

/// Thresholds for accepting a title-based match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Minimum similarity in `[0, 1]`.
    pub min_title_similarity: f64,
    /// Citations with shorter titles are not searched by title.
    pub min_title_length: usize,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            min_title_similarity: DEFAULT_MIN_TITLE_SIMILARITY,
            min_title_length: DEFAULT_MIN_TITLE_LENGTH,
        }
    }
}

impl MatchPolicy {
    /// The title to search for, truncated for query strings, if usable.
    #[must_use]
    pub fn query_title(&self, citation: &Citation) -> Option<String> {
        citation
            .usable_title(self.min_title_length)
            .map(|title| title.chars().take(MAX_QUERY_TITLE_CHARS).collect())
    }

    /// Scores a remote hit against the citation.
    ///
    /// Returns `None` when the titles are not similar enough, otherwise a
    /// confidence strictly below 1.0.
    #[must_use]
    pub fn title_confidence<'a, I>(
        &self,
        citation: &Citation,
        candidate_title: &str,
        candidate_authors: I,
    ) -> Option<f64>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted = citation.title.as_deref()?;
        let similarity = title_similarity(wanted, candidate_title);
        if similarity < self.min_title_similarity {
            return None;
        }
        let mut confidence = similarity * TITLE_CONFIDENCE_SCALE;
        if let Some(family) = citation.first_author_family()
            && author_matches(&family, candidate_authors)
        {
            confidence += AUTHOR_BONUS;
        }
        Some(confidence.min(MAX_TITLE_CONFIDENCE))
    }
}

/// Normalized Levenshtein similarity of two titles after normalization.
///
/// # Examples
///
/// ```
/// use bibp_core::source::matching::title_similarity;
///
/// assert!((title_similarity("Attention is all you need", "ATTENTION IS ALL YOU NEED.") - 1.0).abs() < 1e-9);
/// assert!(title_similarity("Deep residual learning", "Graph neural networks") < 0.5);
/// ```
#[must_use]
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// True when any candidate author name contains `family` as a word.
pub fn author_matches<'a, I>(family: &str, candidate_authors: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    candidate_authors.into_iter().any(|name| {
        normalize_title(name)
            .split(' ')
            .any(|token| token == family)
    })
}
