//! Domain types shared by every pipeline stage.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tender_common::Error;

use crate::scoring::ScoreResult;

pub type TenderId = i64;
pub type EnterpriseId = i64;

/// Date format used for deadlines in extraction output and storage.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// Enterprise
// ============================================================================

/// Matching criteria of a registered company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterpriseProfile {
    #[serde(default)]
    pub id: EnterpriseId,
    pub name: String,
    pub sector: String,
    #[serde(default)]
    pub min_budget: f64,
    #[serde(default)]
    pub max_budget: f64,
    /// Geographic zones, compared case-insensitively
    #[serde(default, deserialize_with = "list_or_csv")]
    pub zones: Vec<String>,
    #[serde(default)]
    pub experience_years: u32,
    #[serde(default, deserialize_with = "list_or_csv", alias = "specific_keywords")]
    pub include_keywords: Vec<String>,
    #[serde(default, deserialize_with = "list_or_csv")]
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl EnterpriseProfile {
    pub fn new(name: impl Into<String>, sector: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            sector: sector.into(),
            min_budget: 0.0,
            max_budget: 0.0,
            zones: Vec::new(),
            experience_years: 0,
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            email: None,
        }
    }

    /// Contact address, if one is set.
    pub fn contact_email(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    /// Reject profiles that cannot be matched.
    pub fn validate(&self) -> tender_common::Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("enterprise name is empty".into()));
        }
        if self.sector.trim().is_empty() {
            return Err(Error::InvalidInput(format!("{}: sector is empty", self.name)));
        }
        for (field, value) in [("min_budget", self.min_budget), ("max_budget", self.max_budget)] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "{}: {} must be a non-negative amount, got {}",
                    self.name, field, value
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tender
// ============================================================================

/// A scraped tender that has not been stored yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTender {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub estimated_budget: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub deadline: Option<NaiveDate>,
    pub source_url: String,
    /// Local document holding the full tender text
    #[serde(default)]
    pub document_path: Option<String>,
}

/// A stored procurement announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub id: TenderId,
    pub title: String,
    pub description: Option<String>,
    pub raw_text: Option<String>,
    pub sector: Option<String>,
    pub estimated_budget: Option<f64>,
    pub location: Option<String>,
    pub deadline: Option<NaiveDate>,
    /// Stable dedup key
    pub source_url: String,
    pub document_path: Option<String>,
    pub analyzed: bool,
    pub created_at: DateTime<Utc>,
}

impl TenderRecord {
    pub fn from_new(id: TenderId, tender: NewTender, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: tender.title,
            description: tender.description,
            raw_text: None,
            sector: tender.sector,
            estimated_budget: tender.estimated_budget,
            location: tender.location,
            deadline: tender.deadline,
            source_url: tender.source_url,
            document_path: tender.document_path,
            analyzed: false,
            created_at,
        }
    }

    /// Text used to decide between AI and local analysis:
    /// raw text, else description, else title.
    pub fn analysis_text(&self) -> &str {
        non_empty(self.raw_text.as_deref())
            .or_else(|| non_empty(self.description.as_deref()))
            .unwrap_or(&self.title)
    }

    /// Lowercased title, description and raw text, used for keyword scans.
    pub fn searchable_text(&self) -> String {
        [
            Some(self.title.as_str()),
            self.description.as_deref(),
            self.raw_text.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase()
    }

    pub fn known_sector(&self) -> Option<&str> {
        non_empty(self.sector.as_deref())
    }

    pub fn known_location(&self) -> Option<&str> {
        non_empty(self.location.as_deref())
    }

    pub fn known_budget(&self) -> Option<f64> {
        self.estimated_budget.filter(|b| *b > 0.0)
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// Normalized information extracted from a tender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInfo {
    pub summary: String,
    pub sector: String,
    pub estimated_budget: f64,
    pub location: String,
    pub deadline: Option<NaiveDate>,
}

/// Persisted analysis of one tender.
///
/// `score`, `explanation` and `enterprise_id` hold the most recent scoring
/// call only; they are overwritten each time any enterprise is scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub tender_id: TenderId,
    pub enterprise_id: Option<EnterpriseId>,
    pub info: ExtractedInfo,
    pub score: f64,
    pub explanation: String,
    pub created_at: DateTime<Utc>,
}

/// Explanation stored until the tender is first scored.
pub const PENDING_SCORE_EXPLANATION: &str = "Analyse terminée, en attente de scoring";

impl AnalysisRecord {
    pub fn unscored(tender_id: TenderId, info: ExtractedInfo, created_at: DateTime<Utc>) -> Self {
        Self {
            tender_id,
            enterprise_id: None,
            info,
            score: 0.0,
            explanation: PENDING_SCORE_EXPLANATION.to_string(),
            created_at,
        }
    }
}

/// A tender together with its analysis, as listed for scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedTender {
    pub tender: TenderRecord,
    pub analysis: Option<AnalysisRecord>,
}

/// One row of a ranked match list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTender {
    pub tender_id: TenderId,
    pub title: String,
    pub source_url: String,
    pub deadline: Option<NaiveDate>,
    pub summary: Option<String>,
    #[serde(flatten)]
    pub result: ScoreResult,
}

impl ScoredTender {
    pub fn score(&self) -> f64 {
        self.result.final_score
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Join a list back into the comma-separated storage form.
pub fn join_list(items: &[String]) -> String {
    items.join(", ")
}

/// Accept either a JSON array of strings or a legacy comma-separated string.
fn list_or_csv<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrCsv {
        List(Vec<String>),
        Csv(String),
        Null,
    }

    Ok(match ListOrCsv::deserialize(deserializer)? {
        ListOrCsv::List(items) => items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        ListOrCsv::Csv(raw) => parse_list(&raw),
        ListOrCsv::Null => Vec::new(),
    })
}
