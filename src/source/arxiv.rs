//! arXiv client.
//!
//! Citations that already carry an arXiv identifier map straight to the
//! canonical PDF URL without a network call. Everything else goes through a
//! title search against the Atom query API, parsed with `quick-xml`.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use reqwest::Client;
use tracing::debug;

use crate::citation::Citation;

use super::http_client::{build_source_http_client, get_text};
use super::{Candidate, ClientSettings, SourceClient, SourceError, SourceKind, SourceOutcome};

/// Canonical PDF host; identifiers are appended as `{id}.pdf`.
const ARXIV_PDF_BASE: &str = "https://arxiv.org/pdf";

const MAX_RESULTS: usize = 3;

/// One `<entry>` of the Atom feed.
#[derive(Debug, Default, Clone, PartialEq)]
struct AtomEntry {
    id: String,
    title: String,
    authors: Vec<String>,
    pdf_url: Option<String>,
    doi: Option<String>,
}

impl AtomEntry {
    /// The arXiv identifier from `<id>http://arxiv.org/abs/{id}</id>`.
    fn arxiv_id(&self) -> Option<&str> {
        self.id
            .rsplit_once("/abs/")
            .map(|(_, id)| id.trim())
            .filter(|id| !id.is_empty())
    }

    fn pdf_url(&self) -> Option<String> {
        self.pdf_url
            .clone()
            .or_else(|| self.arxiv_id().map(canonical_pdf_url))
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Id,
    Title,
    AuthorName,
    Doi,
}

/// Resolves citations against arXiv.
pub struct ArxivClient {
    client: Client,
    settings: ClientSettings,
}

impl ArxivClient {
    /// Creates a client from its settings.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if HTTP client construction fails.
    pub fn new(settings: ClientSettings) -> Result<Self, SourceError> {
        let client = build_source_http_client(SourceKind::Arxiv, &settings)?;
        Ok(Self { client, settings })
    }

    async fn search(&self, citation: &Citation, title: &str) -> Result<SourceOutcome, SourceError> {
        // Quotes inside the phrase would end it early.
        let phrase = title.replace('"', " ");
        let query = format!("ti:\"{phrase}\"");
        let url = format!(
            "{}/api/query?search_query={}&max_results={MAX_RESULTS}",
            self.settings.base_url,
            urlencoding::encode(&query)
        );
        debug!(api_url = %url, "calling arXiv query API");

        let Some(body) = get_text(SourceKind::Arxiv, self.client.get(&url)).await? else {
            return Ok(SourceOutcome::NotFound);
        };
        let entries = parse_atom_feed(&body)
            .map_err(|error| SourceError::malformed(SourceKind::Arxiv, error))?;

        let policy = self.settings.match_policy;
        let candidates: Vec<Candidate> = entries
            .iter()
            .take(MAX_RESULTS)
            .filter_map(|entry| {
                let confidence = policy.title_confidence(
                    citation,
                    &entry.title,
                    entry.authors.iter().map(String::as_str),
                )?;
                let pdf_url = entry.pdf_url()?;
                Some(
                    self.settings
                        .candidate(SourceKind::Arxiv, &pdf_url, confidence)
                        .with_doi(entry.doi.clone()),
                )
            })
            .collect();
        Ok(SourceOutcome::from_candidates(candidates))
    }
}

impl std::fmt::Debug for ArxivClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArxivClient")
            .field("base_url", &self.settings.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for ArxivClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Arxiv
    }

    #[tracing::instrument(skip(self, citation), fields(source = "arxiv", citation_id = %citation.id))]
    async fn resolve(&self, citation: &Citation) -> Result<SourceOutcome, SourceError> {
        if let Some(id) = citation.arxiv_id() {
            debug!(arxiv_id = %id, "known arXiv identifier");
            let candidate = self
                .settings
                .candidate(SourceKind::Arxiv, &canonical_pdf_url(&id), 1.0)
                .with_doi(citation.clean_doi());
            return Ok(SourceOutcome::Found(vec![candidate]));
        }
        match self.settings.match_policy.query_title(citation) {
            Some(title) => self.search(citation, &title).await,
            None => Ok(SourceOutcome::NotFound),
        }
    }
}

fn canonical_pdf_url(id: &str) -> String {
    format!("{ARXIV_PDF_BASE}/{id}.pdf")
}

/// Parses the entries of an arXiv Atom feed.
fn parse_atom_feed(xml: &str) -> Result<Vec<AtomEntry>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<AtomEntry> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match e.name().as_ref() {
                b"entry" => current = Some(AtomEntry::default()),
                b"id" if current.is_some() => field = Some(Field::Id),
                b"title" if current.is_some() => field = Some(Field::Title),
                b"name" if current.is_some() => field = Some(Field::AuthorName),
                b"arxiv:doi" if current.is_some() => field = Some(Field::Doi),
                b"link" => {
                    if let Some(entry) = current.as_mut() {
                        apply_link(entry, e);
                    }
                }
                _ => {}
            },
            Event::Empty(ref e) => {
                if e.name().as_ref() == b"link"
                    && let Some(entry) = current.as_mut()
                {
                    apply_link(entry, e);
                }
            }
            Event::Text(e) => {
                if field.is_some() {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&e.unescape()?);
                }
            }
            Event::End(ref e) => {
                if e.name().as_ref() == b"entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                } else if let (Some(kind), Some(entry)) = (field.take(), current.as_mut()) {
                    let value = std::mem::take(&mut text);
                    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
                    match kind {
                        Field::Id => entry.id = value,
                        Field::Title => entry.title = value,
                        Field::AuthorName => entry.authors.push(value),
                        Field::Doi => entry.doi = Some(value),
                    }
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

fn apply_link(entry: &mut AtomEntry, element: &BytesStart<'_>) {
    let mut href = None;
    let mut is_pdf = false;
    for attr in element.attributes().flatten() {
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        match attr.key.as_ref() {
            b"href" => href = Some(value.into_owned()),
            b"title" => is_pdf |= value == "pdf",
            b"type" => is_pdf |= value == "application/pdf",
            _ => {}
        }
    }
    if is_pdf && let Some(href) = href {
        entry.pdf_url = Some(href);
    }
}
