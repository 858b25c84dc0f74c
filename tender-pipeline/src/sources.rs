//! Stage collaborators: where tenders and their full text come from.

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tender_common::error::ResultExt;
use tender_common::{Error, Result, SourceConfig};

use crate::model::{NewTender, TenderRecord, DATE_FORMAT};
use crate::taxonomy::SectorTaxonomy;

// ============================================================================
// Tender sources
// ============================================================================

/// A place tenders are scraped from.
#[async_trait]
pub trait TenderSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<NewTender>>;
}

/// One entry of a JSON tender feed.
#[derive(Debug, Deserialize)]
struct FeedItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    sector: Option<String>,
    #[serde(default, alias = "budget")]
    estimated_budget: Option<f64>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    deadline: Option<String>,
    #[serde(default, alias = "url")]
    source_url: String,
    #[serde(default, alias = "pdf_path")]
    document_path: Option<String>,
}

/// Fetches a JSON array of tenders over HTTP.
pub struct JsonFeedSource {
    name: String,
    url: String,
    client: Client,
    taxonomy: Arc<SectorTaxonomy>,
    default_sector: String,
}

impl JsonFeedSource {
    pub fn new(
        name: &str,
        url: &str,
        timeout: Duration,
        taxonomy: Arc<SectorTaxonomy>,
        default_sector: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            taxonomy,
            default_sector: default_sector.to_string(),
        }
    }

    pub fn from_config(
        config: &SourceConfig,
        taxonomy: Arc<SectorTaxonomy>,
        default_sector: &str,
    ) -> Self {
        Self::new(
            &config.name,
            &config.url,
            Duration::from_secs(config.timeout_secs),
            taxonomy,
            default_sector,
        )
    }

    fn to_new_tender(&self, item: FeedItem) -> Option<NewTender> {
        let title = item.title.trim().to_string();
        let source_url = item.source_url.trim().to_string();
        if title.is_empty() || source_url.is_empty() {
            return None;
        }

        let description = item.description.filter(|d| !d.trim().is_empty());
        let sector = item
            .sector
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| {
                let text = format!("{} {}", title, description.as_deref().unwrap_or(""));
                self.taxonomy
                    .guess_sector(&text)
                    .unwrap_or(&self.default_sector)
                    .to_string()
            });

        Some(NewTender {
            title,
            description,
            sector: Some(sector),
            estimated_budget: item.estimated_budget.filter(|b| *b > 0.0),
            location: item.location.filter(|l| !l.trim().is_empty()),
            deadline: item.deadline.as_deref().and_then(parse_feed_date),
            source_url,
            document_path: item.document_path.filter(|p| !p.trim().is_empty()),
        })
    }
}

#[async_trait]
impl TenderSource for JsonFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<NewTender>> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout.with_context(self.name.clone())
                } else {
                    Error::External(format!("{}: {}", self.name, e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(format!("{}: HTTP 429", self.name)));
        }
        if !status.is_success() {
            return Err(Error::External(format!(
                "{}: HTTP {}",
                self.name,
                status.as_u16()
            )));
        }

        let items: Vec<FeedItem> = response
            .json()
            .await
            .map_err(|e| Error::External(format!("{}: invalid feed: {}", self.name, e)))?;

        let received = items.len();
        let mut seen = HashSet::new();
        let tenders: Vec<NewTender> = items
            .into_iter()
            .filter_map(|item| self.to_new_tender(item))
            .filter(|t| seen.insert(t.source_url.clone()))
            .collect();

        tracing::debug!(source = %self.name, received, kept = tenders.len(), "Feed fetched");
        Ok(tenders)
    }
}

/// Deadlines in feeds come as ISO dates or French `dd/mm/yyyy`.
fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%d/%m/%Y"))
        .ok()
}

// ============================================================================
// Text extraction
// ============================================================================

/// Produces the full text of a tender document.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// `Ok(None)` when the tender has no usable document.
    async fn extract(&self, tender: &TenderRecord) -> Result<Option<String>>;
}

/// Default cap on extracted text.
pub const MAX_EXTRACTED_CHARS: usize = 50_000;

static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").unwrap());
static WIDE_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {3,}").unwrap());
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{4,}").unwrap());
static RULE_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[-_=]{5,}$").unwrap());

/// Clean text extracted from a document.
pub fn clean_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = CONTROL_CHARS.replace_all(&text, "");
    let text = WIDE_SPACES.replace_all(&text, "  ");
    let text = BLANK_RUNS.replace_all(&text, "\n\n\n");
    let text = RULE_LINES.replace_all(&text, "");
    text.trim().to_string()
}

/// Reads plain-text documents referenced by `document_path`.
#[derive(Debug, Clone)]
pub struct FileTextExtractor {
    base_dir: Option<PathBuf>,
    max_chars: usize,
}

impl FileTextExtractor {
    pub fn new() -> Self {
        Self {
            base_dir: None,
            max_chars: MAX_EXTRACTED_CHARS,
        }
    }

    /// Resolve relative document paths against `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl Default for FileTextExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextExtractor for FileTextExtractor {
    async fn extract(&self, tender: &TenderRecord) -> Result<Option<String>> {
        let Some(doc) = tender.document_path.as_deref().filter(|p| !p.trim().is_empty()) else {
            return Ok(None);
        };
        let path = self.resolve(doc);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(tender_id = tender.id, path = %path.display(), "Document not found");
                return Ok(None);
            }
            Err(e) => return Err(e).context(format!("reading {}", path.display())),
        };

        if bytes.is_empty() {
            tracing::warn!(tender_id = tender.id, path = %path.display(), "Empty document");
            return Ok(None);
        }

        let Ok(raw) = String::from_utf8(bytes) else {
            tracing::warn!(tender_id = tender.id, path = %path.display(), "Document is not UTF-8 text");
            return Ok(None);
        };

        let cleaned = clean_text(&raw);
        if cleaned.is_empty() {
            return Ok(None);
        }

        let text = tender_common::util::truncate_chars(&cleaned, self.max_chars).to_string();
        tracing::info!(tender_id = tender.id, chars = text.chars().count(), "Text extracted");
        Ok(Some(text))
    }
}
