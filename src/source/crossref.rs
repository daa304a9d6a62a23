//! Crossref client - DOI lookups and bibliographic search via the Crossref REST API.
//!
//! A known DOI is resolved with `works/{doi}`; otherwise the title and first
//! author are sent as `query.bibliographic` / `query.author` and each hit is
//! re-scored locally. Candidate URLs come from the `message.link` array.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::citation::Citation;

use super::http_client::{build_source_http_client, get_json};
use super::{Candidate, ClientSettings, SourceClient, SourceError, SourceKind, SourceOutcome};

/// Confidence for text-mining / similarity-checking links, which are often
/// publisher-gated rather than direct PDFs.
const FALLBACK_LINK_CONFIDENCE: f64 = 0.9;

/// Number of search hits to score.
const SEARCH_ROWS: usize = 3;

// ==================== Crossref API Response Types ====================

/// `works/{doi}` response.
#[derive(Debug, Deserialize)]
struct WorkResponse {
    message: CrossrefWork,
}

/// `works?query...` response.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    message: SearchMessage,
}

#[derive(Debug, Deserialize)]
struct SearchMessage {
    #[serde(default)]
    items: Vec<CrossrefWork>,
}

/// One work record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CrossrefWork {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    title: Option<Vec<String>>,
    #[serde(default)]
    author: Vec<CrossrefAuthor>,
    #[serde(default)]
    link: Vec<CrossrefLink>,
}

#[derive(Debug, Deserialize)]
struct CrossrefAuthor {
    given: Option<String>,
    family: Option<String>,
}

impl CrossrefAuthor {
    fn display_name(&self) -> String {
        match (&self.given, &self.family) {
            (Some(given), Some(family)) => format!("{given} {family}"),
            (None, Some(name)) | (Some(name), None) => name.clone(),
            (None, None) => String::new(),
        }
    }
}

/// A resource link from the Crossref response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CrossrefLink {
    /// The URL field is uppercase in the Crossref response.
    #[serde(rename = "URL")]
    url: String,
    content_type: Option<String>,
    intended_application: Option<String>,
}

// ==================== CrossrefClient ====================

/// Looks up Crossref works and proposes their full-text links.
///
/// # Polite Pool
///
/// When a contact e-mail is configured every request carries `mailto`, which
/// gives access to Crossref's higher-rate polite pool.
pub struct CrossrefClient {
    client: Client,
    settings: ClientSettings,
}

impl CrossrefClient {
    /// Creates a client from its settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if HTTP client construction fails.
    pub fn new(settings: ClientSettings) -> Result<Self, SourceError> {
        let client = build_source_http_client(SourceKind::Crossref, &settings)?;
        Ok(Self { client, settings })
    }

    fn mailto_param(&self) -> String {
        self.settings
            .contact_email
            .as_deref()
            .map(|email| format!("mailto={}", urlencoding::encode(email)))
            .unwrap_or_default()
    }

    async fn lookup_doi(&self, doi: &str) -> Result<SourceOutcome, SourceError> {
        let url = format!(
            "{}/works/{}?{}",
            self.settings.base_url,
            urlencoding::encode(doi),
            self.mailto_param()
        );
        debug!(api_url = %url, "calling Crossref works endpoint");

        let Some(body) = get_json::<WorkResponse>(SourceKind::Crossref, self.client.get(&url)).await?
        else {
            return Ok(SourceOutcome::NotFound);
        };
        let matched = body.message.doi.clone().or_else(|| Some(doi.to_string()));
        Ok(SourceOutcome::from_candidates(
            self.link_candidates(&body.message.link, 1.0, matched),
        ))
    }

    async fn search(&self, citation: &Citation, title: &str) -> Result<SourceOutcome, SourceError> {
        let mut url = format!(
            "{}/works?query.bibliographic={}&rows={SEARCH_ROWS}",
            self.settings.base_url,
            urlencoding::encode(title)
        );
        if let Some(family) = citation.first_author_family() {
            url.push_str(&format!("&query.author={}", urlencoding::encode(&family)));
        }
        let mailto = self.mailto_param();
        if !mailto.is_empty() {
            url.push('&');
            url.push_str(&mailto);
        }
        debug!(api_url = %url, "calling Crossref search");

        let Some(body) = get_json::<SearchResponse>(SourceKind::Crossref, self.client.get(&url)).await?
        else {
            return Ok(SourceOutcome::NotFound);
        };

        let policy = self.settings.match_policy;
        let mut candidates = Vec::new();
        for item in body.message.items.iter().take(SEARCH_ROWS) {
            let Some(item_title) = item.title.as_ref().and_then(|titles| titles.first()) else {
                continue;
            };
            let names: Vec<String> = item.author.iter().map(CrossrefAuthor::display_name).collect();
            let Some(confidence) =
                policy.title_confidence(citation, item_title, names.iter().map(String::as_str))
            else {
                debug!(candidate_title = %item_title, "Crossref hit below title threshold");
                continue;
            };
            candidates.extend(self.link_candidates(&item.link, confidence, item.doi.clone()));
        }
        Ok(SourceOutcome::from_candidates(candidates))
    }

    fn link_candidates(
        &self,
        links: &[CrossrefLink],
        confidence: f64,
        matched_doi: Option<String>,
    ) -> Vec<Candidate> {
        let Some((link, is_pdf)) = extract_pdf_link(links) else {
            return Vec::new();
        };
        let confidence = if is_pdf {
            confidence
        } else {
            confidence * FALLBACK_LINK_CONFIDENCE
        };
        vec![
            self.settings
                .candidate(SourceKind::Crossref, &link.url, confidence)
                .with_doi(matched_doi),
        ]
    }
}

impl std::fmt::Debug for CrossrefClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossrefClient")
            .field("base_url", &self.settings.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for CrossrefClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Crossref
    }

    #[tracing::instrument(skip(self, citation), fields(source = "crossref", citation_id = %citation.id))]
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

// ==================== Extraction Helpers ====================

/// Picks the best link: an explicit `application/pdf` first, then a
/// text-mining or similarity-checking link. The flag is true for a PDF link.
fn extract_pdf_link(links: &[CrossrefLink]) -> Option<(&CrossrefLink, bool)> {
    links
        .iter()
        .find(|link| link.content_type.as_deref().is_some_and(is_pdf_content_type))
        .map(|link| (link, true))
        .or_else(|| {
            links
                .iter()
                .find(|link| {
                    link.intended_application
                        .as_deref()
                        .is_some_and(is_fallback_application)
                })
                .map(|link| (link, false))
        })
}

fn is_pdf_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|mime| mime.eq_ignore_ascii_case("application/pdf"))
}

fn is_fallback_application(intended_application: &str) -> bool {
    intended_application.eq_ignore_ascii_case("text-mining")
        || intended_application.eq_ignore_ascii_case("similarity-checking")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::FailureType;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, ResponseTemplate};

    fn link(url: &str, content_type: Option<&str>, app: Option<&str>) -> CrossrefLink {
        CrossrefLink {
            url: url.to_string(),
            content_type: content_type.map(str::to_string),
            intended_application: app.map(str::to_string),
        }
    }

    fn client_for(uri: &str) -> CrossrefClient {
        let mut settings = ClientSettings::for_kind(SourceKind::Crossref).with_base_url(uri);
        settings.contact_email = Some("test@example.com".to_string());
        settings.https_only = false;
        CrossrefClient::new(settings).unwrap()
    }

    #[test]
    fn test_work_deserialize_with_uppercase_fields() {
        let json = serde_json::json!({
            "status": "ok",
            "message": {
                "DOI": "10.1234/x",
                "title": ["A Test Paper"],
                "author": [{"given": "John", "family": "Smith"}, {"family": "Consortium"}],
                "link": [{
                    "URL": "https://publisher.com/paper.pdf",
                    "content-type": "application/pdf",
                    "intended-application": "text-mining"
                }]
            }
        });
        let resp: WorkResponse = serde_json::from_value(json).unwrap();
        assert_eq!(resp.message.doi.as_deref(), Some("10.1234/x"));
        assert_eq!(resp.message.link[0].url, "https://publisher.com/paper.pdf");
        assert_eq!(resp.message.author[0].display_name(), "John Smith");
        assert_eq!(resp.message.author[1].display_name(), "Consortium");
    }

    #[test]
    fn test_work_deserialize_minimal() {
        let resp: WorkResponse =
            serde_json::from_value(serde_json::json!({"message": {}})).unwrap();
        assert!(resp.message.title.is_none());
        assert!(resp.message.link.is_empty());
    }

    #[test]
    fn test_extract_pdf_link_prefers_pdf_content_type() {
        let links = vec![
            link("https://a.com/tdm.xml", Some("text/xml"), Some("text-mining")),
            link("https://a.com/paper.pdf", Some("application/pdf; charset=binary"), None),
        ];
        let (best, is_pdf) = extract_pdf_link(&links).unwrap();
        assert_eq!(best.url, "https://a.com/paper.pdf");
        assert!(is_pdf);
    }

    #[test]
    fn test_extract_pdf_link_falls_back_to_text_mining() {
        let links = vec![
            link("https://a.com/landing", Some("text/html"), Some("unspecified")),
            link("https://a.com/tdm", None, Some("Similarity-Checking")),
        ];
        let (best, is_pdf) = extract_pdf_link(&links).unwrap();
        assert_eq!(best.url, "https://a.com/tdm");
        assert!(!is_pdf);
    }

    #[test]
    fn test_extract_pdf_link_none() {
        let links = vec![link("https://a.com/landing", Some("text/html"), None)];
        assert!(extract_pdf_link(&links).is_none());
        assert!(extract_pdf_link(&[]).is_none());
    }

    #[tokio::test]
    async fn test_doi_lookup_returns_pdf_link_at_full_confidence() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path_regex(r"^/works/10\.1234"))
            .and(query_param("mailto", "test@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "message": {
                    "DOI": "10.1234/x",
                    "link": [{"URL": "https://publisher.com/x.pdf", "content-type": "application/pdf"}]
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let citation = Citation::new("1", "").with_doi("10.1234/x");
        let SourceOutcome::Found(candidates) = client.resolve(&citation).await.unwrap() else {
            panic!("expected candidates");
        };
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://publisher.com/x.pdf");
        assert!((candidates[0].confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(candidates[0].matched_doi.as_deref(), Some("10.1234/x"));
    }

    #[tokio::test]
    async fn test_doi_lookup_404_is_not_found() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let citation = Citation::new("1", "").with_doi("10.1234/missing");
        assert_eq!(client.resolve(&citation).await.unwrap(), SourceOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_doi_lookup_without_links_is_not_found() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "ok", "message": {"DOI": "10.1/y"}})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let citation = Citation::new("1", "").with_doi("10.1/y");
        assert_eq!(client.resolve(&citation).await.unwrap(), SourceOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_title_search_scores_and_filters_hits() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/works"))
            .and(query_param("query.author", "vaswani"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "message": {"items": [
                    {
                        "DOI": "10.5555/unrelated",
                        "title": ["Graph Attention Networks"],
                        "link": [{"URL": "https://x.org/gat.pdf", "content-type": "application/pdf"}]
                    },
                    {
                        "DOI": "10.5555/attention",
                        "title": ["Attention is all you need"],
                        "author": [{"given": "Ashish", "family": "Vaswani"}],
                        "link": [{"URL": "https://x.org/attention.pdf", "content-type": "application/pdf"}]
                    }
                ]}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let citation = Citation::new("1", "")
            .with_title("Attention Is All You Need")
            .with_authors(["Vaswani, A."]);
        let SourceOutcome::Found(candidates) = client.resolve(&citation).await.unwrap() else {
            panic!("expected candidates");
        };
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://x.org/attention.pdf");
        assert_eq!(candidates[0].matched_doi.as_deref(), Some("10.5555/attention"));
        assert!(candidates[0].confidence < 1.0);
    }

    #[tokio::test]
    async fn test_short_title_without_doi_makes_no_request() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let citation = Citation::new("1", "Smith 2020").with_title("Notes");
        assert_eq!(client.resolve(&citation).await.unwrap(), SourceOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_rate_limited_response_is_transient() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let err = client
            .resolve(&Citation::new("1", "").with_doi("10.1/z"))
            .await
            .unwrap_err();
        assert_eq!(err.failure_type(), FailureType::RateLimited);
    }
}
