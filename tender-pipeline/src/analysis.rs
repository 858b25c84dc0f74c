//! Tender analysis: AI-assisted for substantial texts, local heuristics otherwise.
//!
//! - text shorter than `min_text_chars` is skipped as insufficient
//! - text of at least `ai_threshold_chars` goes through two provider calls,
//!   a French summary then a strict-JSON extraction
//! - anything in between is summarised locally without any external call

use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;
use tender_common::util::truncate_chars;
use tender_common::{AnalysisConfig, ProviderConfig};
use tender_gateway::{ChatRequest, Message, Provider, ProviderError, ProviderErrorKind};
use thiserror::Error;

use crate::model::{ExtractedInfo, TenderRecord, DATE_FORMAT};
use crate::taxonomy::SectorTaxonomy;

/// Sector stored when the extraction response cannot be used.
pub const UNDETERMINED_SECTOR: &str = "Non déterminé";
/// Location stored when the extraction response cannot be used.
pub const UNSPECIFIED_LOCATION: &str = "Non spécifié";

const MAX_FIELD_CHARS: usize = 255;
const LOCAL_DESCRIPTION_CHARS: usize = 300;
const LOCAL_DESCRIPTION_MIN_CHARS: usize = 30;

const SUMMARY_SYSTEM_PROMPT: &str = "Tu es un expert en analyse d'appels d'offres publics. \
Tu dois fournir des résumés clairs, concis et professionnels en français.";

const EXTRACTION_SYSTEM_PROMPT: &str = "Tu es un système d'extraction de données. \
Tu dois extraire les informations demandées et les retourner strictement au format JSON, \
sans aucun texte supplémentaire.";

/// Why a tender could not be analyzed.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("insufficient content ({chars} chars)")]
    InsufficientContent { chars: usize },

    #[error("provider rate limited: {0}")]
    ProviderRateLimited(String),

    #[error("provider unreachable: {0}")]
    ProviderTransport(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("analysis cancelled")]
    Cancelled,
}

impl From<ProviderError> for AnalysisError {
    fn from(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::RateLimited => Self::ProviderRateLimited(err.to_string()),
            ProviderErrorKind::Transport => Self::ProviderTransport(err.to_string()),
            ProviderErrorKind::Cancelled => Self::Cancelled,
            ProviderErrorKind::Api | ProviderErrorKind::InvalidResponse => {
                Self::Provider(err.to_string())
            }
        }
    }
}

/// Which path produced an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPath {
    Ai,
    Local,
}

/// Successful analysis of one tender.
#[derive(Debug, Clone, PartialEq)]
pub struct Analyzed {
    pub info: ExtractedInfo,
    pub path: AnalysisPath,
    /// The extraction response was unusable and defaults were stored
    pub extraction_recovered: bool,
}

impl Analyzed {
    pub fn used_ai(&self) -> bool {
        self.path == AnalysisPath::Ai
    }
}

/// Chooses between AI and local analysis for each tender.
pub struct AnalysisDecider {
    provider: Arc<dyn Provider>,
    taxonomy: Arc<SectorTaxonomy>,
    config: AnalysisConfig,
    model: String,
    temperature: f64,
}

impl AnalysisDecider {
    pub fn new(
        provider: Arc<dyn Provider>,
        taxonomy: Arc<SectorTaxonomy>,
        config: AnalysisConfig,
        provider_config: &ProviderConfig,
    ) -> Self {
        Self {
            provider,
            taxonomy,
            config,
            model: provider_config.model.clone(),
            temperature: provider_config.temperature,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyze one tender without mutating it.
    pub async fn analyze(&self, tender: &TenderRecord) -> Result<Analyzed, AnalysisError> {
        let text = tender.analysis_text().trim();
        let chars = text.chars().count();

        if chars < self.config.min_text_chars {
            tracing::warn!(tender_id = tender.id, chars, "Insufficient text for analysis");
            return Err(AnalysisError::InsufficientContent { chars });
        }

        if chars >= self.config.ai_threshold_chars {
            tracing::info!(tender_id = tender.id, chars, "Analyzing with provider");
            let summary = self.generate_summary(text).await?;
            let (fields, recovered) = self.extract_fields(text).await?;
            Ok(Analyzed {
                info: ExtractedInfo {
                    summary,
                    sector: fields.sector,
                    estimated_budget: fields.estimated_budget,
                    location: fields.location,
                    deadline: fields.deadline,
                },
                path: AnalysisPath::Ai,
                extraction_recovered: recovered,
            })
        } else {
            tracing::info!(tender_id = tender.id, chars, "Analyzing locally");
            Ok(Analyzed {
                info: self.analyze_locally(tender),
                path: AnalysisPath::Local,
                extraction_recovered: false,
            })
        }
    }

    async fn generate_summary(&self, text: &str) -> Result<String, AnalysisError> {
        let prompt = format!(
            "Résume cet appel d'offres en maximum 200 mots.\n\
             Le résumé doit inclure :\n\
             - L'objet du marché\n\
             - Le commanditaire\n\
             - Les conditions principales\n\
             - La date limite si mentionnée\n\n\
             Texte de l'appel d'offres :\n---\n{}\n---\n\n\
             Résumé (max 200 mots) :",
            truncate_chars(text, self.config.max_prompt_chars)
        );

        let response = self
            .provider
            .chat(self.request(SUMMARY_SYSTEM_PROMPT, prompt, self.config.summary_max_tokens))
            .await?;

        tracing::debug!(tokens = response.usage.total_tokens, "Summary received");
        Ok(response.content.trim().to_string())
    }

    async fn extract_fields(&self, text: &str) -> Result<(ExtractedFields, bool), AnalysisError> {
        let labels: Vec<&str> = self.taxonomy.labels().collect();
        let prompt = format!(
            "Analyse ce texte d'appel d'offres et extrais les informations suivantes.\n\
             Retourne UNIQUEMENT un objet JSON valide avec ces clés :\n\n\
             {{\n\
             \x20   \"sector\": \"secteur d'activité parmi: {}\",\n\
             \x20   \"estimated_budget\": 0,\n\
             \x20   \"location\": \"lieu/zone géographique\",\n\
             \x20   \"deadline\": \"date limite au format YYYY-MM-DD ou null\"\n\
             }}\n\n\
             Règles :\n\
             - sector : un seul libellé exact de la liste, séparée par des points-virgules\n\
             - estimated_budget : montant en USD (0 si non mentionné), nombre uniquement\n\
             - location : ville, province ou pays mentionné\n\
             - deadline : date au format YYYY-MM-DD, ou null si non trouvée\n\n\
             Texte :\n---\n{}\n---\n\nJSON :",
            labels.join("; "),
            truncate_chars(text, self.config.max_prompt_chars)
        );

        let response = self
            .provider
            .chat(self.request(EXTRACTION_SYSTEM_PROMPT, prompt, self.config.extraction_max_tokens))
            .await?;

        match parse_extraction(&response.content) {
            Ok(fields) => Ok((fields, false)),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    response = %tender_common::util::truncate_with_ellipsis(&response.content, 200),
                    "Malformed extraction response, using defaults"
                );
                Ok((ExtractedFields::undetermined(), true))
            }
        }
    }

    fn request(&self, system: &str, prompt: String, max_tokens: i64) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![Message::system(system), Message::user(prompt)],
            max_tokens: Some(max_tokens),
            temperature: Some(self.temperature),
        }
    }

    /// Local analysis from title and description only.
    pub fn analyze_locally(&self, tender: &TenderRecord) -> ExtractedInfo {
        let title = tender.title.trim();
        let description = tender.description.as_deref().unwrap_or("").trim();

        let summary = if description.chars().count() > LOCAL_DESCRIPTION_MIN_CHARS {
            format!(
                "Appel d'offres : {}. {}",
                title,
                truncate_chars(description, LOCAL_DESCRIPTION_CHARS)
            )
        } else {
            format!("Appel d'offres : {title}. Consultez la source pour les détails complets.")
        };

        let sector = match tender.known_sector() {
            Some(sector) => sector.to_string(),
            None => self
                .taxonomy
                .guess_sector(&format!("{title} {description}"))
                .unwrap_or(&self.config.default_sector)
                .to_string(),
        };

        ExtractedInfo {
            summary: truncate_chars(&summary, self.config.local_summary_chars).to_string(),
            sector,
            estimated_budget: tender.known_budget().unwrap_or(0.0),
            location: tender
                .known_location()
                .map_or_else(|| self.config.default_location.clone(), str::to_string),
            deadline: None,
        }
    }
}

/// Copy analysis results onto a tender: empty fields are filled, existing
/// values are kept, a parsed deadline is applied and the tender is marked analyzed.
pub fn apply_to_tender(tender: &mut TenderRecord, info: &ExtractedInfo) {
    if tender.known_sector().is_none() && !info.sector.trim().is_empty() {
        tender.sector = Some(info.sector.clone());
    }
    if tender.known_budget().is_none() && info.estimated_budget > 0.0 {
        tender.estimated_budget = Some(info.estimated_budget);
    }
    if tender.known_location().is_none() && !info.location.trim().is_empty() {
        tender.location = Some(info.location.clone());
    }
    if let Some(deadline) = info.deadline {
        tender.deadline = Some(deadline);
    }
    tender.analyzed = true;
}

// ============================================================================
// Extraction parsing
// ============================================================================

/// Sanitised fields of an extraction response.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFields {
    pub sector: String,
    pub estimated_budget: f64,
    pub location: String,
    pub deadline: Option<NaiveDate>,
}

impl ExtractedFields {
    pub fn undetermined() -> Self {
        Self {
            sector: UNDETERMINED_SECTOR.to_string(),
            estimated_budget: 0.0,
            location: UNSPECIFIED_LOCATION.to_string(),
            deadline: None,
        }
    }
}

/// Remove Markdown code fences around a JSON payload.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parse and sanitise an extraction response.
pub fn parse_extraction(raw: &str) -> Result<ExtractedFields, serde_json::Error> {
    let value: Value = serde_json::from_str(strip_code_fences(raw))?;
    if !value.is_object() {
        return Err(serde::de::Error::custom("extraction is not a JSON object"));
    }

    let text_field = |key: &str, default: &str| -> String {
        match value.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => {
                truncate_chars(s.trim(), MAX_FIELD_CHARS).to_string()
            }
            Some(Value::Number(n)) => n.to_string(),
            _ => default.to_string(),
        }
    };

    let estimated_budget = match value.get("estimated_budget") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => parse_amount(s),
        _ => 0.0,
    };

    let deadline = value
        .get("deadline")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok());

    Ok(ExtractedFields {
        sector: text_field("sector", UNDETERMINED_SECTOR),
        estimated_budget: if estimated_budget.is_finite() && estimated_budget > 0.0 {
            estimated_budget
        } else {
            0.0
        },
        location: text_field("location", UNSPECIFIED_LOCATION),
        deadline,
    })
}

const CURRENCY_SUFFIXES: &[&str] = &["FCFA", "GNF", "EUR", "USD", "FG", "€", "$"];

/// Parse an amount written as text, such as `1 250 000`, `1250000.5` or
/// `1 250 000,50`.
///
/// Spaces (regular or non-breaking) group thousands. When both '.' and ','
/// appear, the last one is the decimal separator and the other groups
/// thousands. A lone separator is decimal. Anything else, a repeated lone
/// separator such as `1.250.000` included, is ambiguous and yields 0.
fn parse_amount(raw: &str) -> f64 {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let mut number = compact.as_str();
    for suffix in CURRENCY_SUFFIXES {
        if let Some(stripped) = number.strip_suffix(suffix) {
            number = stripped;
            break;
        }
    }
    if number.is_empty()
        || !number
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == ',')
    {
        return 0.0;
    }

    let decimal = match (number.rfind('.'), number.rfind(',')) {
        (None, None) => None,
        (Some(_), None) => Some('.'),
        (None, Some(_)) => Some(','),
        (Some(dot), Some(comma)) => Some(if comma > dot { ',' } else { '.' }),
    };

    let normalized = match decimal {
        None => number.to_string(),
        Some(sep) => {
            if number.matches(sep).count() > 1 {
                return 0.0;
            }
            let grouping = if sep == ',' { '.' } else { ',' };
            number
                .chars()
                .filter(|c| *c != grouping)
                .map(|c| if c == sep { '.' } else { c })
                .collect()
        }
    };

    normalized.parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTender;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tender_gateway::{ChatResponse, TokenUsage};
    use test_case::test_case;

    /// Provider returning queued responses and recording prompts.
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, ProviderError>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let model = request.model.clone();
            self.requests.lock().unwrap().push(request);
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("{}".to_string()));
            next.map(|content| ChatResponse {
                provider: "scripted".into(),
                model,
                content,
                usage: TokenUsage::default(),
                finish_reason: Some("stop".into()),
                latency_ms: 0,
            })
        }
    }

    fn decider(provider: Arc<ScriptedProvider>) -> AnalysisDecider {
        AnalysisDecider::new(
            provider,
            Arc::new(SectorTaxonomy::default()),
            AnalysisConfig::default(),
            &ProviderConfig::default(),
        )
    }

    fn tender_with_text(text: &str) -> TenderRecord {
        let mut t = TenderRecord::from_new(
            7,
            NewTender {
                title: "AO".into(),
                source_url: "https://example.org/7".into(),
                ..Default::default()
            },
            Utc::now(),
        );
        t.raw_text = Some(text.to_string());
        t
    }

    #[tokio::test]
    async fn test_short_text_is_insufficient() {
        let provider = ScriptedProvider::new(vec![]);
        let err = decider(provider.clone())
            .analyze(&tender_with_text("trop court"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientContent { chars: 10 }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_thresholds_ignore_surrounding_whitespace() {
        let provider = ScriptedProvider::new(vec![]);
        let d = decider(provider.clone());

        let padded = format!("{}trop court{}", " ".repeat(20), "\n".repeat(20));
        let err = d.analyze(&tender_with_text(&padded)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientContent { chars: 10 }));

        let padded = format!("{}{}", "a".repeat(250), " ".repeat(100));
        let analyzed = d.analyze(&tender_with_text(&padded)).await.unwrap();
        assert_eq!(analyzed.path, AnalysisPath::Local);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_25_chars_stays_local() {
        let provider = ScriptedProvider::new(vec![]);
        let analyzed = decider(provider.clone())
            .analyze(&tender_with_text(&"a".repeat(25)))
            .await
            .unwrap();
        assert_eq!(analyzed.path, AnalysisPath::Local);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_500_chars_uses_provider() {
        let provider = ScriptedProvider::new(vec![
            Ok("Résumé du marché".into()),
            Ok(r#"```json
{"sector": "Santé & Paramédical", "estimated_budget": "1 250 000", "location": "Kankan", "deadline": "2026-11-30"}
```"#
                .into()),
        ]);
        let analyzed = decider(provider.clone())
            .analyze(&tender_with_text(&"é".repeat(500)))
            .await
            .unwrap();

        assert!(analyzed.used_ai());
        assert!(!analyzed.extraction_recovered);
        assert_eq!(provider.calls(), 2);
        assert_eq!(analyzed.info.summary, "Résumé du marché");
        assert_eq!(analyzed.info.sector, "Santé & Paramédical");
        assert_eq!(analyzed.info.estimated_budget, 1_250_000.0);
        assert_eq!(analyzed.info.deadline, NaiveDate::from_ymd_opt(2026, 11, 30));

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].max_tokens, Some(500));
        assert_eq!(requests[1].max_tokens, Some(300));
        assert_eq!(requests[0].temperature, Some(0.3));
        assert!(requests[1].messages[1].content.contains("Travaux Publics & Construction"));
    }

    #[tokio::test]
    async fn test_malformed_extraction_is_recovered() {
        let provider = ScriptedProvider::new(vec![
            Ok("Résumé".into()),
            Ok("Je ne peux pas répondre en JSON".into()),
        ]);
        let analyzed = decider(provider)
            .analyze(&tender_with_text(&"x".repeat(400)))
            .await
            .unwrap();

        assert!(analyzed.extraction_recovered);
        assert_eq!(analyzed.info.sector, UNDETERMINED_SECTOR);
        assert_eq!(analyzed.info.location, UNSPECIFIED_LOCATION);
        assert_eq!(analyzed.info.estimated_budget, 0.0);
        assert_eq!(analyzed.info.deadline, None);
    }

    #[tokio::test]
    async fn test_provider_failure_maps_to_error_kind() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::new(
            "scripted",
            "m",
            ProviderErrorKind::RateLimited,
            "429",
        ))]);
        let err = decider(provider)
            .analyze(&tender_with_text(&"x".repeat(400)))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ProviderRateLimited(_)));
    }

    #[test]
    fn test_local_summary_rules() {
        let d = decider(ScriptedProvider::new(vec![]));

        let mut t = tender_with_text("");
        t.title = "Nettoyage des locaux".into();
        t.description = Some("Courte".into());
        let info = d.analyze_locally(&t);
        assert_eq!(
            info.summary,
            "Appel d'offres : Nettoyage des locaux. Consultez la source pour les détails complets."
        );
        assert_eq!(info.sector, "Services Généraux & Prestations diverses");
        assert_eq!(info.location, "Guinée");

        t.description = Some("d".repeat(400));
        t.sector = Some("Santé & Paramédical".into());
        t.location = Some("Labé".into());
        let info = d.analyze_locally(&t);
        let expected_len = "Appel d'offres : Nettoyage des locaux. ".chars().count() + 300;
        assert_eq!(info.summary.chars().count(), expected_len);
        assert_eq!(info.sector, "Santé & Paramédical");
        assert_eq!(info.location, "Labé");
    }

    #[test]
    fn test_local_sector_falls_back_to_configured_default() {
        let d = AnalysisDecider::new(
            ScriptedProvider::new(vec![]),
            Arc::new(SectorTaxonomy::default()),
            AnalysisConfig {
                default_sector: "Divers".into(),
                ..Default::default()
            },
            &ProviderConfig::default(),
        );

        let mut t = tender_with_text("");
        t.title = "Avis général n°12".into();
        assert_eq!(d.analyze_locally(&t).sector, "Divers");

        t.title = "Réhabilitation de la route de Boké".into();
        assert_eq!(d.analyze_locally(&t).sector, "Travaux Publics & Construction");
    }

    #[test]
    fn test_apply_never_overwrites_known_fields() {
        let mut t = tender_with_text("x");
        t.sector = Some("Mines & Ressources Naturelles".into());
        let info = ExtractedInfo {
            summary: "s".into(),
            sector: "Santé & Paramédical".into(),
            estimated_budget: 5_000.0,
            location: "Boké".into(),
            deadline: NaiveDate::from_ymd_opt(2026, 12, 1),
        };

        apply_to_tender(&mut t, &info);
        assert!(t.analyzed);
        assert_eq!(t.sector.as_deref(), Some("Mines & Ressources Naturelles"));
        assert_eq!(t.estimated_budget, Some(5_000.0));
        assert_eq!(t.location.as_deref(), Some("Boké"));
        assert_eq!(t.deadline, NaiveDate::from_ymd_opt(2026, 12, 1));
    }

    #[test]
    fn test_parse_extraction_sanitises() {
        let long = "s".repeat(300);
        let raw = format!(
            r#"{{"sector": "{long}", "estimated_budget": null, "location": "", "deadline": "30/11/2026"}}"#
        );
        let fields = parse_extraction(&raw).unwrap();
        assert_eq!(fields.sector.chars().count(), 255);
        assert_eq!(fields.estimated_budget, 0.0);
        assert_eq!(fields.location, UNSPECIFIED_LOCATION);
        assert_eq!(fields.deadline, None);

        assert!(parse_extraction("[1, 2]").is_err());
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
    }

    #[test_case("1 250 000,50", 1_250_000.5 ; "french decimal comma")]
    #[test_case("1\u{202f}250\u{202f}000", 1_250_000.0 ; "narrow no break spaces")]
    #[test_case("1.250.000,50", 1_250_000.5 ; "dotted thousands with comma decimal")]
    #[test_case("1,250,000.50", 1_250_000.5 ; "comma thousands with dot decimal")]
    #[test_case("1250000.5", 1_250_000.5 ; "plain decimal")]
    #[test_case("450 000 000 GNF", 450_000_000.0 ; "currency suffix")]
    #[test_case("1.250.000", 0.0 ; "repeated dots are ambiguous")]
    #[test_case("1,250,000", 0.0 ; "repeated commas are ambiguous")]
    #[test_case("2 millions", 0.0 ; "words are rejected")]
    #[test_case("", 0.0 ; "empty")]
    fn test_parse_amount(raw: &str, expected: f64) {
        assert_eq!(parse_amount(raw), expected);
    }

    #[test]
    fn test_extraction_keeps_french_decimal_budget() {
        let fields = parse_extraction(
            r#"{"sector": "BTP", "estimated_budget": "1 250 000,50", "location": "Conakry", "deadline": null}"#,
        )
        .unwrap();
        assert_eq!(fields.estimated_budget, 1_250_000.5);

        let fields = parse_extraction(r#"{"estimated_budget": "1.250.000"}"#).unwrap();
        assert_eq!(fields.estimated_budget, 0.0);
    }
}
