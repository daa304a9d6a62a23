//! Unpaywall client (DOI lookups only).
//!
//! Unpaywall requires a contact e-mail on every request; the registry drops the
//! source at startup when none is configured.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::citation::Citation;

use super::http_client::{build_source_http_client, get_json};
use super::{Candidate, ClientSettings, SourceClient, SourceError, SourceKind, SourceOutcome};

/// Confidence of the least preferred OA location.
const BASE_CONFIDENCE: f64 = 0.85;
/// Confidence added per location score point (max score 6 reaches 1.0).
const CONFIDENCE_PER_POINT: f64 = 0.025;

#[derive(Debug, Deserialize)]
struct UnpaywallWork {
    doi: Option<String>,
    #[serde(default)]
    is_oa: bool,
    #[serde(default)]
    oa_locations: Vec<OaLocation>,
}

#[derive(Debug, Deserialize)]
struct OaLocation {
    url_for_pdf: Option<String>,
    host_type: Option<String>,
}

impl OaLocation {
    /// Repository copies beat publisher copies, arXiv beats both, and an
    /// explicit `.pdf` path is a mild plus.
    fn score(&self, pdf_url: &str) -> u32 {
        let mut score = 0;
        if self.host_type.as_deref() == Some("repository") {
            score += 2;
        }
        if pdf_url.contains("arxiv.org") {
            score += 3;
        }
        if pdf_url.to_ascii_lowercase().ends_with(".pdf") {
            score += 1;
        }
        score
    }
}

/// Looks up open-access locations for a DOI.
pub struct UnpaywallClient {
    client: Client,
    settings: ClientSettings,
}

impl UnpaywallClient {
    /// Creates a client from its settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if HTTP client construction fails.
    pub fn new(settings: ClientSettings) -> Result<Self, SourceError> {
        let client = build_source_http_client(SourceKind::Unpaywall, &settings)?;
        Ok(Self { client, settings })
    }

    fn candidates(&self, work: &UnpaywallWork) -> Vec<Candidate> {
        work.oa_locations
            .iter()
            .filter_map(|location| {
                let pdf_url = location.url_for_pdf.as_deref()?.trim();
                if pdf_url.is_empty() {
                    return None;
                }
                let confidence =
                    BASE_CONFIDENCE + CONFIDENCE_PER_POINT * f64::from(location.score(pdf_url));
                Some(
                    self.settings
                        .candidate(SourceKind::Unpaywall, pdf_url, confidence)
                        .with_doi(work.doi.clone()),
                )
            })
            .collect()
    }
}

impl std::fmt::Debug for UnpaywallClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpaywallClient")
            .field("base_url", &self.settings.base_url)
            .field("contact_email", &self.settings.contact_email)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for UnpaywallClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Unpaywall
    }

    #[tracing::instrument(skip(self, citation), fields(source = "unpaywall", citation_id = %citation.id))]
    async fn resolve(&self, citation: &Citation) -> Result<SourceOutcome, SourceError> {
        let Some(doi) = citation.clean_doi() else {
            return Ok(SourceOutcome::NotFound);
        };
        let Some(email) = self.settings.contact_email.as_deref() else {
            return Err(SourceError::permanent(
                SourceKind::Unpaywall,
                "a contact e-mail is required (set contact_email or BIBP_EMAIL)",
            ));
        };
        let url = format!(
            "{}/v2/{}?email={}",
            self.settings.base_url,
            urlencoding::encode(&doi),
            urlencoding::encode(email)
        );
        debug!(api_url = %url, "calling Unpaywall");

        let Some(work) = get_json::<UnpaywallWork>(SourceKind::Unpaywall, self.client.get(&url)).await?
        else {
            return Ok(SourceOutcome::NotFound);
        };
        if !work.is_oa {
            debug!("work is not open access");
            return Ok(SourceOutcome::NotFound);
        }
        Ok(SourceOutcome::from_candidates(self.candidates(&work)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::FailureType;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use crate::source::select_best;
    use wiremock::matchers::{method, path_regex, query_param};
    use wiremock::{Mock, ResponseTemplate};

    fn client_for(uri: &str, email: Option<&str>) -> UnpaywallClient {
        let mut settings = ClientSettings::for_kind(SourceKind::Unpaywall).with_base_url(uri);
        settings.contact_email = email.map(str::to_string);
        UnpaywallClient::new(settings).unwrap()
    }

    #[test]
    fn test_location_score() {
        let repo = OaLocation {
            url_for_pdf: None,
            host_type: Some("repository".to_string()),
        };
        assert_eq!(repo.score("https://arxiv.org/pdf/1.pdf"), 6);
        let publisher = OaLocation {
            url_for_pdf: None,
            host_type: Some("publisher".to_string()),
        };
        assert_eq!(publisher.score("https://pub.com/download"), 0);
    }

    #[tokio::test]
    async fn test_oa_locations_become_scored_candidates() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path_regex(r"^/v2/10\.1234"))
            .and(query_param("email", "me@example.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "doi": "10.1234/x",
                "is_oa": true,
                "oa_locations": [
                    {"url_for_pdf": "https://pub.com/download/x", "host_type": "publisher"},
                    {"url_for_pdf": "https://repo.edu/x.pdf", "host_type": "repository"},
                    {"url_for_pdf": null, "host_type": "repository"}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Some("me@example.org"));
        let citation = Citation::new("1", "").with_doi("10.1234/x");
        let SourceOutcome::Found(candidates) = client.resolve(&citation).await.unwrap() else {
            panic!("expected candidates");
        };
        assert_eq!(candidates.len(), 2);
        let best = select_best(&candidates).unwrap();
        assert_eq!(best.url, "https://repo.edu/x.pdf");
        assert!((best.confidence - 0.925).abs() < 1e-9);
        assert!((candidates[0].confidence - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_closed_access_is_not_found() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "doi": "10.1234/x",
                "is_oa": false,
                "oa_locations": []
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Some("me@example.org"));
        let citation = Citation::new("1", "").with_doi("10.1234/x");
        assert_eq!(client.resolve(&citation).await.unwrap(), SourceOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_no_doi_is_not_found_without_request() {
        let client = client_for("http://127.0.0.1:9", Some("me@example.org"));
        let citation = Citation::new("1", "").with_title("Some long enough title");
        assert_eq!(client.resolve(&citation).await.unwrap(), SourceOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_missing_email_is_permanent() {
        let client = client_for("http://127.0.0.1:9", None);
        let citation = Citation::new("1", "").with_doi("10.1234/x");
        let err = client.resolve(&citation).await.unwrap_err();
        assert_eq!(err.failure_type(), FailureType::Permanent);
    }
}
