//! Budget and bidding recommendations appended to enterprise digests.
//!
//! The provider gets the enterprise profile and its five best matches and
//! answers with a numbered list. Any failure other than a shutdown falls
//! back to a fixed set of generic recommendations.

use std::fmt::Write as _;
use std::sync::Arc;
use tender_common::util::truncate_chars;
use tender_common::{AnalysisConfig, Cancelled, ProviderConfig};
use tender_gateway::{ChatRequest, Message, Provider, ProviderErrorKind};

use crate::model::{EnterpriseProfile, ScoredTender};

/// Matches described in the prompt.
pub const PROMPT_MATCHES: usize = 5;
/// Upper bound on returned recommendations.
pub const MAX_RECOMMENDATIONS: usize = 5;

const ADVISOR_SYSTEM_PROMPT: &str = "Tu es un conseiller expert en marchés publics. \
Tu donnes des recommandations concrètes et actionnables en français. \
Tu ne dois jamais utiliser d'emojis.";

/// Used when the provider cannot be reached or answers nothing usable.
pub const FALLBACK_RECOMMENDATIONS: [&str; 3] = [
    "Consultez régulièrement les nouveaux appels d'offres pour ne pas manquer d'opportunités.",
    "Préparez vos dossiers de candidature à l'avance pour réagir rapidement.",
    "Adaptez votre budget prévisionnel aux fourchettes des appels d'offres de votre secteur.",
];

fn fallback() -> Vec<String> {
    FALLBACK_RECOMMENDATIONS.iter().map(|r| r.to_string()).collect()
}

/// Asks the provider for recommendations tailored to one enterprise.
pub struct RecommendationAdvisor {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f64,
    max_tokens: i64,
}

impl RecommendationAdvisor {
    pub fn new(
        provider: Arc<dyn Provider>,
        analysis: &AnalysisConfig,
        provider_config: &ProviderConfig,
    ) -> Self {
        Self {
            provider,
            model: provider_config.model.clone(),
            temperature: provider_config.temperature,
            max_tokens: analysis.recommendation_max_tokens,
        }
    }

    /// Recommendations for `enterprise` given its ranked matches.
    ///
    /// Only a shutdown is returned as an error.
    pub async fn recommend(
        &self,
        enterprise: &EnterpriseProfile,
        top: &[ScoredTender],
    ) -> Result<Vec<String>, Cancelled> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(ADVISOR_SYSTEM_PROMPT),
                Message::user(build_prompt(enterprise, top)),
            ],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
        };

        match self.provider.chat(request).await {
            Ok(response) => {
                let recommendations = parse_recommendations(&response.content);
                if recommendations.is_empty() {
                    tracing::warn!(enterprise_id = enterprise.id, "Empty recommendations, using defaults");
                    return Ok(fallback());
                }
                tracing::debug!(
                    enterprise_id = enterprise.id,
                    count = recommendations.len(),
                    "Recommendations generated"
                );
                Ok(recommendations)
            }
            Err(e) if e.kind == ProviderErrorKind::Cancelled => Err(Cancelled),
            Err(e) => {
                tracing::error!(enterprise_id = enterprise.id, error = %e, "Recommendations failed, using defaults");
                Ok(fallback())
            }
        }
    }
}

fn build_prompt(enterprise: &EnterpriseProfile, top: &[ScoredTender]) -> String {
    let mut matches = String::new();
    for (rank, item) in top.iter().take(PROMPT_MATCHES).enumerate() {
        let _ = writeln!(
            matches,
            "{}. {} (Score : {:.0}/100)",
            rank + 1,
            truncate_chars(&item.title, 80),
            item.score()
        );
    }
    if matches.is_empty() {
        matches.push_str("Aucune.\n");
    }

    let zones = if enterprise.zones.is_empty() {
        "Non précisées".to_string()
    } else {
        enterprise.zones.join(", ")
    };

    format!(
        "Profil entreprise :\n\
         - Nom : {}\n\
         - Secteur : {}\n\
         - Budget : {} - {} USD\n\
         - Zones : {}\n\
         - Expérience : {} ans\n\n\
         Meilleures opportunités :\n{}\n\
         Donne exactement 3 à 5 recommandations courtes (max 2 phrases chacune). \
         Pas d'introduction, pas de conclusion, juste une liste numérotée.",
        enterprise.name,
        enterprise.sector,
        enterprise.min_budget,
        enterprise.max_budget,
        zones,
        enterprise.experience_years,
        matches
    )
}

/// Items of a numbered list (`1.`, `2)`...), at most `MAX_RECOMMENDATIONS`.
///
/// A non-empty answer without any numbered line is kept as one item.
pub fn parse_recommendations(raw: &str) -> Vec<String> {
    let items: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .map(|line| {
            line.trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')'])
                .trim()
                .to_string()
        })
        .filter(|item| !item.is_empty())
        .take(MAX_RECOMMENDATIONS)
        .collect();

    if items.is_empty() && !raw.trim().is_empty() {
        return vec![raw.trim().to_string()];
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalyzedTender, NewTender, TenderRecord};
    use crate::scoring::ScoringEngine;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tender_gateway::{ChatResponse, ProviderError, TokenUsage};

    struct OneShotProvider {
        answer: Mutex<Option<Result<String, ProviderError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl OneShotProvider {
        fn new(answer: Result<String, ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(answer)),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for OneShotProvider {
        fn name(&self) -> &str {
            "one-shot"
        }

        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.prompts.lock().unwrap().push(prompt);
            let answer = self.answer.lock().unwrap().take().unwrap_or_else(|| Ok(String::new()));
            answer.map(|content| ChatResponse {
                provider: "one-shot".into(),
                model: request.model,
                content,
                usage: TokenUsage::default(),
                finish_reason: Some("stop".into()),
                latency_ms: 0,
            })
        }
    }

    fn advisor(provider: Arc<OneShotProvider>) -> RecommendationAdvisor {
        RecommendationAdvisor::new(provider, &AnalysisConfig::default(), &ProviderConfig::default())
    }

    fn enterprise() -> EnterpriseProfile {
        let mut e = EnterpriseProfile::new("Bâtir Guinée SARL", "Travaux Publics & Construction");
        e.min_budget = 100_000.0;
        e.max_budget = 500_000.0;
        e.zones = vec!["Conakry".into(), "Kindia".into()];
        e.experience_years = 8;
        e
    }

    fn ranked(n: usize) -> Vec<ScoredTender> {
        let tenders: Vec<AnalyzedTender> = (0..n)
            .map(|i| {
                let mut t = TenderRecord::from_new(
                    i as i64 + 1,
                    NewTender {
                        title: format!("Réhabilitation du pont {i}"),
                        sector: Some("Travaux Publics & Construction".into()),
                        source_url: format!("https://example.org/pont/{i}"),
                        ..Default::default()
                    },
                    Utc::now(),
                );
                t.analyzed = true;
                AnalyzedTender {
                    tender: t,
                    analysis: None,
                }
            })
            .collect();
        ScoringEngine::default().rank(&enterprise(), &tenders)
    }

    #[test]
    fn test_parse_numbered_list() {
        let raw = "Voici mes conseils :\n\
                   1. Ciblez les marchés de Conakry.\n\
                   2) Renforcez vos références.\n\
                   \n\
                   3 - Préparez la caution.\n\
                   4.\n";
        assert_eq!(
            parse_recommendations(raw),
            vec![
                "Ciblez les marchés de Conakry.",
                "Renforcez vos références.",
                "- Préparez la caution.",
            ]
        );
    }

    #[test]
    fn test_parse_keeps_at_most_five() {
        let raw: String = (1..=7).map(|i| format!("{i}. Conseil {i}\n")).collect();
        let items = parse_recommendations(&raw);
        assert_eq!(items.len(), MAX_RECOMMENDATIONS);
        assert_eq!(items[4], "Conseil 5");
    }

    #[test]
    fn test_parse_unnumbered_answer_is_one_item() {
        assert_eq!(parse_recommendations("  Restez attentifs.  "), vec!["Restez attentifs."]);
        assert!(parse_recommendations("   ").is_empty());
    }

    #[tokio::test]
    async fn test_prompt_describes_profile_and_top_five() {
        let provider = OneShotProvider::new(Ok("1. Un\n2. Deux\n3. Trois".into()));
        let recommendations = advisor(provider.clone())
            .recommend(&enterprise(), &ranked(7))
            .await
            .unwrap();
        assert_eq!(recommendations, vec!["Un", "Deux", "Trois"]);

        let prompt = provider.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("- Nom : Bâtir Guinée SARL"));
        assert!(prompt.contains("- Budget : 100000 - 500000 USD"));
        assert!(prompt.contains("- Zones : Conakry, Kindia"));
        assert!(prompt.contains("5. Réhabilitation du pont"));
        assert!(!prompt.contains("6. Réhabilitation du pont"));
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back() {
        let provider = OneShotProvider::new(Err(ProviderError::from_status(
            "one-shot",
            "m",
            429,
            "rate limit reached",
        )));
        let recommendations = advisor(provider).recommend(&enterprise(), &ranked(2)).await.unwrap();
        assert_eq!(recommendations, FALLBACK_RECOMMENDATIONS.to_vec());

        let provider = OneShotProvider::new(Ok("\n\n".into()));
        let recommendations = advisor(provider).recommend(&enterprise(), &[]).await.unwrap();
        assert_eq!(recommendations.len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_is_not_masked() {
        let provider = OneShotProvider::new(Err(ProviderError::cancelled("one-shot", "m")));
        assert!(advisor(provider).recommend(&enterprise(), &ranked(1)).await.is_err());
    }
}
