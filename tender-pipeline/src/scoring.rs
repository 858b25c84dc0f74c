//! Multi-criteria scoring of (enterprise, tender) pairs.
//!
//! Four sub-scores in [0, 1] are weighted into a base score in [0, 100]:
//! sector 35, budget 30, location 20, experience 15. Keywords then either
//! veto the match (score forced to 0) or add a bonus of 10% per distinct
//! include keyword found, capped at 30%. The final score is rounded to one
//! decimal and capped at 100.
//!
//! Scoring never fails: missing data degrades to neutral sub-scores.

use serde::Serialize;
use std::sync::Arc;

use crate::model::{AnalyzedTender, EnterpriseProfile, ExtractedInfo, ScoredTender, TenderRecord};
use crate::taxonomy::{MatchStrength, SectorTaxonomy};

/// Weights of the four sub-scores; they sum to 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Weights {
    pub sector: f64,
    pub budget: f64,
    pub location: f64,
    pub experience: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            sector: 35.0,
            budget: 30.0,
            location: 20.0,
            experience: 15.0,
        }
    }
}

/// Neutral sub-score used when data is missing.
const NEUTRAL: f64 = 0.5;
const BONUS_PER_KEYWORD: f64 = 0.1;
const MAX_KEYWORD_BONUS: f64 = 0.3;
/// Floor applied to out-of-range budgets.
const MIN_BUDGET_SCORE: f64 = 0.1;

/// The four sub-scores of a pair, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubScores {
    pub sector: f64,
    pub budget: f64,
    pub location: f64,
    pub experience: f64,
}

/// Sub-scores as percentages rounded to one decimal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreDetails {
    pub sector: f64,
    pub budget: f64,
    pub location: f64,
    pub experience: f64,
    pub keyword_adj: f64,
}

/// Outcome of scoring one pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub sub_scores: SubScores,
    /// 0 on veto, otherwise 1.0 plus the keyword bonus
    pub keyword_multiplier: f64,
    pub base_score: f64,
    /// Final score in [0, 100]
    #[serde(rename = "score")]
    pub final_score: f64,
    pub explanation: String,
}

impl ScoreResult {
    pub fn details(&self) -> ScoreDetails {
        ScoreDetails {
            sector: round1(self.sub_scores.sector * 100.0),
            budget: round1(self.sub_scores.budget * 100.0),
            location: round1(self.sub_scores.location * 100.0),
            experience: round1(self.sub_scores.experience * 100.0),
            keyword_adj: self.keyword_multiplier,
        }
    }

    pub fn is_vetoed(&self) -> bool {
        self.keyword_multiplier == 0.0
    }
}

/// Computes explainable compatibility scores.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    taxonomy: Arc<SectorTaxonomy>,
    weights: Weights,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(Arc::new(SectorTaxonomy::default()))
    }
}

impl ScoringEngine {
    pub fn new(taxonomy: Arc<SectorTaxonomy>) -> Self {
        Self {
            taxonomy,
            weights: Weights::default(),
        }
    }

    pub fn weights(&self) -> Weights {
        self.weights
    }

    /// Score one pair. Tender sector, budget and location fall back to the
    /// extracted values when the tender itself carries none.
    pub fn score(
        &self,
        enterprise: &EnterpriseProfile,
        tender: &TenderRecord,
        extracted: Option<&ExtractedInfo>,
    ) -> ScoreResult {
        let sector = tender
            .known_sector()
            .or_else(|| extracted.map(|e| e.sector.as_str()))
            .unwrap_or("");
        let budget = tender
            .known_budget()
            .or_else(|| extracted.map(|e| e.estimated_budget));
        let location = tender
            .known_location()
            .or_else(|| extracted.map(|e| e.location.as_str()));
        let text = tender.searchable_text();

        let sub_scores = SubScores {
            sector: self.sector_score(&enterprise.sector, sector),
            budget: budget_score(enterprise.min_budget, enterprise.max_budget, budget),
            location: location_score(&enterprise.zones, location),
            experience: experience_score(enterprise.experience_years, Some(&text)),
        };

        let base_score = sub_scores.sector * self.weights.sector
            + sub_scores.budget * self.weights.budget
            + sub_scores.location * self.weights.location
            + sub_scores.experience * self.weights.experience;

        let keyword_multiplier =
            keyword_multiplier(&enterprise.include_keywords, &enterprise.exclude_keywords, &text);

        let final_score = round1(base_score * keyword_multiplier).clamp(0.0, 100.0);

        ScoreResult {
            explanation: explain(&sub_scores, keyword_multiplier),
            sub_scores,
            keyword_multiplier,
            base_score,
            final_score,
        }
    }

    /// Sector match in [0, 1].
    pub fn sector_score(&self, enterprise_sector: &str, tender_sector: &str) -> f64 {
        if enterprise_sector.trim().is_empty() || tender_sector.trim().is_empty() {
            return 0.0;
        }

        match self.taxonomy.related(enterprise_sector, tender_sector) {
            MatchStrength::Exact => 1.0,
            MatchStrength::Contains => 0.9,
            MatchStrength::Synonym => 0.85,
            MatchStrength::None => {
                let similarity = strsim::normalized_levenshtein(
                    &enterprise_sector.trim().to_lowercase(),
                    &tender_sector.trim().to_lowercase(),
                );
                if similarity > 0.5 {
                    similarity
                } else {
                    similarity * 0.3
                }
            }
        }
    }

    /// Score every analyzed tender for one enterprise, best first.
    ///
    /// Ties keep the input order.
    pub fn rank(&self, enterprise: &EnterpriseProfile, tenders: &[AnalyzedTender]) -> Vec<ScoredTender> {
        let mut scored: Vec<ScoredTender> = tenders
            .iter()
            .map(|item| {
                let info = item.analysis.as_ref().map(|a| &a.info);
                ScoredTender {
                    tender_id: item.tender.id,
                    title: item.tender.title.clone(),
                    source_url: item.tender.source_url.clone(),
                    deadline: item.tender.deadline,
                    summary: info.map(|i| i.summary.clone()),
                    result: self.score(enterprise, &item.tender, info),
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score().total_cmp(&a.score()));
        scored
    }
}

/// Budget fit in [0, 1].
pub fn budget_score(min_budget: f64, max_budget: f64, estimate: Option<f64>) -> f64 {
    let Some(estimate) = estimate.filter(|e| *e > 0.0) else {
        return NEUTRAL;
    };

    if min_budget <= 0.0 && max_budget <= 0.0 {
        return NEUTRAL;
    }

    if min_budget <= estimate && estimate <= max_budget {
        return 1.0;
    }

    if max_budget > 0.0 && estimate > max_budget {
        return (max_budget / estimate).max(MIN_BUDGET_SCORE);
    }

    if min_budget > 0.0 && estimate < min_budget {
        return (estimate / min_budget).max(MIN_BUDGET_SCORE);
    }

    NEUTRAL
}

/// Geographic fit in [0, 1].
pub fn location_score(zones: &[String], location: Option<&str>) -> f64 {
    let zones: Vec<String> = zones
        .iter()
        .map(|z| z.trim().to_lowercase())
        .filter(|z| !z.is_empty())
        .collect();
    let location = location.map(|l| l.trim().to_lowercase()).unwrap_or_default();

    if zones.is_empty() || location.is_empty() {
        return NEUTRAL;
    }

    if zones
        .iter()
        .any(|zone| location.contains(zone.as_str()) || zone.contains(location.as_str()))
    {
        return 1.0;
    }

    let location_words: Vec<&str> = location.split_whitespace().collect();
    if zones
        .iter()
        .any(|zone| zone.split_whitespace().any(|w| location_words.contains(&w)))
    {
        return 0.7;
    }

    0.2
}

/// Experience tier in [0, 1]. The tender text is accepted but not used yet.
pub fn experience_score(years: u32, _tender_text: Option<&str>) -> f64 {
    match years {
        10.. => 1.0,
        5..=9 => 0.8,
        3..=4 => 0.6,
        1..=2 => 0.4,
        0 => 0.2,
    }
}

/// 0.0 if any exclude keyword occurs in `text`, otherwise 1.0 plus the bonus.
///
/// `text` must already be lowercased.
pub fn keyword_multiplier(include: &[String], exclude: &[String], text: &str) -> f64 {
    let normalized = |keywords: &[String]| -> Vec<String> {
        let mut out: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        out.sort();
        out.dedup();
        out
    };

    if let Some(kw) = normalized(exclude).iter().find(|kw| text.contains(kw.as_str())) {
        tracing::debug!(keyword = %kw, "Excluded keyword found");
        return 0.0;
    }

    let matches = normalized(include)
        .iter()
        .filter(|kw| text.contains(kw.as_str()))
        .count();

    1.0 + (matches as f64 * BONUS_PER_KEYWORD).min(MAX_KEYWORD_BONUS)
}

fn explain(sub: &SubScores, keyword_multiplier: f64) -> String {
    let mut parts = vec![
        format!("Secteur: {}", percent(sub.sector)),
        format!("Budget: {}", percent(sub.budget)),
        format!("Zone: {}", percent(sub.location)),
        format!("Expérience: {}", percent(sub.experience)),
    ];

    if keyword_multiplier == 0.0 {
        parts.push("Exclusion : Mot-clé interdit détecté".to_string());
    } else if keyword_multiplier > 1.0 {
        parts.push(format!(
            "Bonus Mots-clés: +{:.0}%",
            (keyword_multiplier - 1.0) * 100.0
        ));
    }

    parts.join(" | ")
}

fn percent(value: f64) -> String {
    format!("{:.0}%", value * 100.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ============================================================================
// Match report
// ============================================================================

/// Summary of a ranked match list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchReport {
    pub total: usize,
    /// Score >= 70
    pub high: usize,
    /// 40 <= score < 70
    pub medium: usize,
    /// Score < 40
    pub low: usize,
    pub average_score: f64,
}

impl MatchReport {
    pub fn from_scored(scored: &[ScoredTender]) -> Self {
        let total = scored.len();
        let high = scored.iter().filter(|s| s.score() >= 70.0).count();
        let medium = scored
            .iter()
            .filter(|s| (40.0..70.0).contains(&s.score()))
            .count();
        let average_score = if total == 0 {
            0.0
        } else {
            round1(scored.iter().map(ScoredTender::score).sum::<f64>() / total as f64)
        };

        Self {
            total,
            high,
            medium,
            low: total - high - medium,
            average_score,
        }
    }
}

/// Display level of a score.
pub fn level_label(score: f64) -> &'static str {
    if score >= 70.0 {
        "Excellent"
    } else if score >= 40.0 {
        "Moyen"
    } else {
        "A surveiller"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalysisRecord, NewTender};
    use chrono::Utc;
    use test_case::test_case;

    fn enterprise() -> EnterpriseProfile {
        EnterpriseProfile {
            min_budget: 10_000.0,
            max_budget: 50_000.0,
            experience_years: 5,
            ..EnterpriseProfile::new("InfoTech", "Informatique & Télécommunications")
        }
    }

    fn tender(sector: &str, budget: f64) -> TenderRecord {
        TenderRecord::from_new(
            1,
            NewTender {
                title: "Fourniture de serveurs".into(),
                description: Some("Acquisition et installation de serveurs".into()),
                sector: Some(sector.into()),
                estimated_budget: Some(budget),
                source_url: "https://example.org/1".into(),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_worked_example() {
        let engine = ScoringEngine::default();
        let result = engine.score(&enterprise(), &tender("informatique", 20_000.0), None);

        assert_eq!(result.sub_scores.sector, 0.9);
        assert_eq!(result.sub_scores.budget, 1.0);
        assert_eq!(result.sub_scores.location, 0.5);
        assert_eq!(result.sub_scores.experience, 0.8);
        assert_eq!(result.keyword_multiplier, 1.0);
        assert_eq!(result.final_score, 83.5);
        assert_eq!(
            result.explanation,
            "Secteur: 90% | Budget: 100% | Zone: 50% | Expérience: 80%"
        );
    }

    #[test_case(10_000.0 ; "at min")]
    #[test_case(30_000.0 ; "inside")]
    #[test_case(50_000.0 ; "at max")]
    fn test_budget_in_range(estimate: f64) {
        assert_eq!(budget_score(10_000.0, 50_000.0, Some(estimate)), 1.0);
    }

    #[test_case(None, 0.5 ; "unknown estimate")]
    #[test_case(Some(0.0), 0.5 ; "zero estimate")]
    #[test_case(Some(100_000.0), 0.5 ; "over max by double")]
    #[test_case(Some(1_000_000.0), 0.1 ; "far over max floors")]
    #[test_case(Some(5_000.0), 0.5 ; "half of min")]
    #[test_case(Some(100.0), 0.1 ; "far under min floors")]
    fn test_budget_out_of_range(estimate: Option<f64>, expected: f64) {
        assert_eq!(budget_score(10_000.0, 50_000.0, estimate), expected);
    }

    #[test]
    fn test_budget_without_range_is_neutral() {
        assert_eq!(budget_score(0.0, 0.0, Some(20_000.0)), 0.5);
        // Min only: anything above min but max unset falls through to neutral.
        assert_eq!(budget_score(10_000.0, 0.0, Some(20_000.0)), 0.5);
        assert_eq!(budget_score(10_000.0, 0.0, Some(2_000.0)), 0.2);
    }

    #[test_case(&["Conakry"], Some("Conakry, Guinée"), 1.0 ; "substring")]
    #[test_case(&["basse guinée"], Some("Guinée"), 1.0 ; "location inside zone")]
    #[test_case(&["Kindia Nord"], Some("Préfecture de Kindia"), 0.7 ; "shared word")]
    #[test_case(&["Labé"], Some("Kankan"), 0.2 ; "no match")]
    #[test_case(&[], Some("Kankan"), 0.5 ; "no zones")]
    #[test_case(&["Labé"], None, 0.5 ; "no location")]
    fn test_location(zones: &[&str], location: Option<&str>, expected: f64) {
        let zones: Vec<String> = zones.iter().map(|z| z.to_string()).collect();
        assert_eq!(location_score(&zones, location), expected);
    }

    #[test_case(0, 0.2)]
    #[test_case(1, 0.4)]
    #[test_case(3, 0.6)]
    #[test_case(5, 0.8)]
    #[test_case(9, 0.8)]
    #[test_case(10, 1.0)]
    #[test_case(25, 1.0)]
    fn test_experience(years: u32, expected: f64) {
        assert_eq!(experience_score(years, None), expected);
    }

    #[test]
    fn test_exclude_keyword_vetoes() {
        let engine = ScoringEngine::default();
        let mut e = enterprise();
        e.include_keywords = vec!["serveurs".into()];
        e.exclude_keywords = vec!["INSTALLATION".into()];

        let result = engine.score(&e, &tender("Informatique & Télécommunications", 20_000.0), None);
        assert_eq!(result.final_score, 0.0);
        assert!(result.is_vetoed());
        assert!(result.explanation.ends_with("Exclusion : Mot-clé interdit détecté"));
        assert!(result.base_score > 0.0);
    }

    #[test]
    fn test_keyword_bonus_is_capped_and_score_stays_under_100() {
        let engine = ScoringEngine::default();
        let mut e = enterprise();
        e.experience_years = 12;
        e.zones = vec!["Conakry".into()];
        e.include_keywords = ["fourniture", "serveurs", "installation", "acquisition", "serveurs"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut t = tender("Informatique & Télécommunications", 20_000.0);
        t.location = Some("Conakry".into());

        let result = engine.score(&e, &t, None);
        assert_eq!(result.keyword_multiplier, 1.3);
        assert_eq!(result.base_score, 100.0);
        assert_eq!(result.final_score, 100.0);
        assert!(result.explanation.ends_with("Bonus Mots-clés: +30%"));
    }

    #[test]
    fn test_duplicate_include_keywords_count_once() {
        let text = "travaux de construction";
        let include = vec!["travaux".to_string(), "Travaux ".to_string()];
        assert!((keyword_multiplier(&include, &[], text) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_scoring_is_idempotent() {
        let engine = ScoringEngine::default();
        let e = enterprise();
        let t = tender("Santé", 70_000.0);
        assert_eq!(engine.score(&e, &t, None), engine.score(&e, &t, None));
    }

    #[test]
    fn test_sector_score_paths() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.sector_score("", "Santé"), 0.0);
        assert_eq!(engine.sector_score("BTP", "Génie civil"), 0.85);

        // Near-identical spelling scores by similarity.
        let close = engine.sector_score("Consultnce", "Consultance");
        assert!(close > 0.5 && close < 1.0);

        // Unrelated strings are penalised below the similarity ratio.
        let far = engine.sector_score("Banque", "Assurance");
        assert!(far < 0.5 * 0.3 + f64::EPSILON);
    }

    #[test]
    fn test_extracted_values_fill_missing_tender_fields() {
        let engine = ScoringEngine::default();
        let mut t = tender("", 0.0);
        t.sector = None;
        t.estimated_budget = None;
        let info = ExtractedInfo {
            summary: "Résumé".into(),
            sector: "Informatique & Télécommunications".into(),
            estimated_budget: 20_000.0,
            location: "Conakry".into(),
            deadline: None,
        };

        let result = engine.score(&enterprise(), &t, Some(&info));
        assert_eq!(result.sub_scores.sector, 1.0);
        assert_eq!(result.sub_scores.budget, 1.0);
    }

    #[test]
    fn test_rank_sorts_descending_and_reports() {
        let engine = ScoringEngine::default();
        let items: Vec<AnalyzedTender> = [("Santé", 900_000.0, 1), ("informatique", 20_000.0, 2), ("Informatique & Télécommunications", 45_000.0, 3)]
            .into_iter()
            .map(|(sector, budget, id)| {
                let mut t = tender(sector, budget);
                t.id = id;
                t.analyzed = true;
                let info = ExtractedInfo {
                    summary: format!("Résumé {id}"),
                    sector: sector.into(),
                    estimated_budget: budget,
                    location: String::new(),
                    deadline: None,
                };
                AnalyzedTender {
                    analysis: Some(AnalysisRecord::unscored(id, info, Utc::now())),
                    tender: t,
                }
            })
            .collect();

        let ranked = engine.rank(&enterprise(), &items);
        let ids: Vec<i64> = ranked.iter().map(|s| s.tender_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert!(ranked.windows(2).all(|w| w[0].score() >= w[1].score()));
        assert_eq!(ranked[0].summary.as_deref(), Some("Résumé 3"));

        let report = MatchReport::from_scored(&ranked);
        assert_eq!(report.total, 3);
        assert_eq!(report.high, 2);
        assert_eq!(report.high + report.medium + report.low, 3);
    }

    #[test]
    fn test_level_labels() {
        assert_eq!(level_label(70.0), "Excellent");
        assert_eq!(level_label(69.9), "Moyen");
        assert_eq!(level_label(40.0), "Moyen");
        assert_eq!(level_label(12.0), "A surveiller");
    }
}
