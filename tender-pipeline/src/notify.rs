//! Daily match digests sent to enterprises through the channels service.
//!
//! Every attempt is logged as `pending` before sending, then marked `sent`
//! or `failed`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tender_common::util::{sanitize_for_log, truncate_with_ellipsis};
use tender_common::{Clock, NotificationConfig};

use crate::advice::{RecommendationAdvisor, PROMPT_MATCHES};
use crate::error::PipelineError;
use crate::model::{EnterpriseId, EnterpriseProfile, ScoredTender, DATE_FORMAT};
use crate::scoring::{level_label, MatchReport};
use crate::storage::{NewNotification, NotificationStatus, Repository};

// ============================================================================
// Digest
// ============================================================================

/// A rendered digest for one enterprise.
#[derive(Debug, Clone, PartialEq)]
pub struct Digest {
    pub enterprise_id: EnterpriseId,
    pub recipient: String,
    pub subject: String,
    /// Markdown body
    pub body: String,
    pub match_count: usize,
}

/// Render the digest of `scored` (best first), listing at most `max_items`,
/// followed by the recommendations when there are any.
pub fn build_digest(
    enterprise: &EnterpriseProfile,
    recipient: &str,
    scored: &[ScoredTender],
    max_items: usize,
    recommendations: &[String],
) -> Digest {
    let report = MatchReport::from_scored(scored);
    let subject = format!(
        "Tender Analyzer - {} appels d'offres pour {}",
        scored.len(),
        enterprise.name
    );

    let mut body = String::new();
    let _ = writeln!(body, "# {subject}\n");
    let _ = writeln!(
        body,
        "Votre sélection pour **{}** : {} opportunités, {} excellentes, {} moyennes, score moyen {:.1}.\n",
        enterprise.sector, report.total, report.high, report.medium, report.average_score
    );

    for (rank, item) in scored.iter().take(max_items).enumerate() {
        let score = item.score();
        let _ = writeln!(
            body,
            "{}. **{}** ({:.0}/100, {})",
            rank + 1,
            truncate_with_ellipsis(&item.title, 80),
            score,
            level_label(score)
        );
        if let Some(summary) = item.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            let _ = writeln!(body, "   {}", truncate_with_ellipsis(summary.trim(), 200));
        }
        if let Some(deadline) = item.deadline {
            let _ = writeln!(body, "   Date limite : {}", deadline.format(DATE_FORMAT));
        }
        let _ = writeln!(body, "   {}", item.source_url);
    }

    if !recommendations.is_empty() {
        let _ = writeln!(body, "\n## Recommandations\n");
        for (idx, recommendation) in recommendations.iter().enumerate() {
            let _ = writeln!(body, "{}. {}", idx + 1, recommendation);
        }
    }

    Digest {
        enterprise_id: enterprise.id,
        recipient: recipient.to_string(),
        subject,
        body,
        match_count: scored.len(),
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Delivers a digest to its recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name recorded in the notification log.
    fn channel(&self) -> &str;

    async fn send(&self, digest: &Digest) -> Result<()>;
}

/// Request to send a message via the channels service
#[derive(Debug, Serialize)]
struct SendRequest {
    channel_type: String,
    channel_id: String,
    content: SendContent,
}

/// Message content
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SendContent {
    Markdown { text: String },
}

/// Response from the channels service
#[derive(Debug, Deserialize)]
struct SendResponse {
    success: bool,
    #[allow(dead_code)]
    message_id: Option<String>,
    error: Option<String>,
}

/// Posts digests to `{endpoint}/api/v1/send`.
pub struct ChannelsNotifier {
    endpoint: String,
    channel_type: String,
    client: reqwest::Client,
}

impl ChannelsNotifier {
    pub fn new(endpoint: &str, channel_type: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            channel_type: channel_type.to_string(),
            client,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(
            &config.endpoint,
            &config.channel_type,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl Notifier for ChannelsNotifier {
    fn channel(&self) -> &str {
        &self.channel_type
    }

    async fn send(&self, digest: &Digest) -> Result<()> {
        let url = format!("{}/api/v1/send", self.endpoint);
        let request = SendRequest {
            channel_type: self.channel_type.clone(),
            channel_id: digest.recipient.clone(),
            content: SendContent::Markdown {
                text: digest.body.clone(),
            },
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status, error_text);
        }

        let result: SendResponse = response.json().await?;
        if !result.success {
            anyhow::bail!(
                "Send failed: {}",
                result.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        Ok(())
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// What happened to one enterprise's digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
    Skipped,
}

/// Delivery counters for a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotificationSummary {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl NotificationSummary {
    pub fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Failed => self.failed += 1,
            DeliveryOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Filters matches, sends digests and keeps the notification log.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    advisor: Option<Arc<RecommendationAdvisor>>,
    enabled: bool,
    max_items: usize,
    min_score: f64,
}

impl NotificationDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        config: &NotificationConfig,
    ) -> Self {
        Self {
            notifier,
            repo,
            clock,
            advisor: None,
            enabled: config.enabled,
            max_items: config.max_items.max(1),
            min_score: config.min_score,
        }
    }

    /// Append provider recommendations to every digest.
    pub fn with_advisor(mut self, advisor: Arc<RecommendationAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Send `scored` to the enterprise, skipping when notifications are off,
    /// the enterprise has no email, or nothing reaches `min_score`.
    ///
    /// Only storage failures are returned as errors.
    pub async fn notify(
        &self,
        enterprise: &EnterpriseProfile,
        scored: &[ScoredTender],
    ) -> Result<DeliveryOutcome, PipelineError> {
        if !self.enabled {
            return Ok(DeliveryOutcome::Skipped);
        }

        let Some(recipient) = enterprise.contact_email() else {
            tracing::debug!(enterprise_id = enterprise.id, "No email, digest skipped");
            return Ok(DeliveryOutcome::Skipped);
        };

        let matches: Vec<ScoredTender> = scored
            .iter()
            .filter(|s| s.score() >= self.min_score)
            .cloned()
            .collect();
        if matches.is_empty() {
            tracing::info!(enterprise_id = enterprise.id, "No matches, digest skipped");
            return Ok(DeliveryOutcome::Skipped);
        }

        let recommendations = match &self.advisor {
            Some(advisor) => {
                let top = &matches[..matches.len().min(PROMPT_MATCHES)];
                advisor.recommend(enterprise, top).await?
            }
            None => Vec::new(),
        };

        let digest = build_digest(
            enterprise,
            recipient,
            &matches,
            self.max_items,
            &recommendations,
        );
        let log_id = self
            .repo
            .log_notification(
                &NewNotification {
                    enterprise_id: enterprise.id,
                    channel: self.notifier.channel().to_string(),
                    recipient: recipient.to_string(),
                    match_count: digest.match_count,
                },
                self.clock.now(),
            )
            .await?;

        match self.notifier.send(&digest).await {
            Ok(()) => {
                self.repo
                    .update_notification_status(log_id, NotificationStatus::Sent, None, self.clock.now())
                    .await?;
                tracing::info!(
                    enterprise_id = enterprise.id,
                    matches = digest.match_count,
                    "Digest sent"
                );
                Ok(DeliveryOutcome::Sent)
            }
            Err(e) => {
                let message = sanitize_for_log(&format!("{e:#}"));
                self.repo
                    .update_notification_status(
                        log_id,
                        NotificationStatus::Failed,
                        Some(&message),
                        self.clock.now(),
                    )
                    .await?;
                tracing::error!(enterprise_id = enterprise.id, error = %message, "Digest delivery failed");
                Ok(DeliveryOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ScoringEngine;
    use crate::storage::SqliteRepository;
    use crate::model::{AnalyzedTender, NewTender, TenderRecord};
    use chrono::Utc;
    use std::sync::Mutex;
    use tender_common::{AnalysisConfig, ProviderConfig, SystemClock};
    use tender_gateway::{ChatRequest, ChatResponse, Provider, ProviderError, TokenUsage};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Digest>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn channel(&self) -> &str {
            "test"
        }

        async fn send(&self, digest: &Digest) -> Result<()> {
            self.sent.lock().unwrap().push(digest.clone());
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            Ok(())
        }
    }

    fn enterprise(email: Option<&str>) -> EnterpriseProfile {
        let mut e = EnterpriseProfile::new("InfoTech", "Informatique & Télécommunications");
        e.id = 9;
        e.min_budget = 10_000.0;
        e.max_budget = 50_000.0;
        e.experience_years = 5;
        e.email = email.map(String::from);
        e
    }

    fn scored(n: usize) -> Vec<ScoredTender> {
        let tenders: Vec<AnalyzedTender> = (0..n)
            .map(|i| {
                let mut t = TenderRecord::from_new(
                    i as i64 + 1,
                    NewTender {
                        title: format!("Logiciel {i}"),
                        sector: Some("informatique".into()),
                        estimated_budget: Some(20_000.0),
                        source_url: format!("https://example.org/{i}"),
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
        ScoringEngine::default().rank(&enterprise(None), &tenders)
    }

    fn dispatcher(notifier: Arc<RecordingNotifier>, repo: Arc<SqliteRepository>) -> NotificationDispatcher {
        let config = NotificationConfig {
            enabled: true,
            ..Default::default()
        };
        NotificationDispatcher::new(notifier, repo, Arc::new(SystemClock), &config)
    }

    #[test]
    fn test_digest_lists_top_items_with_levels() {
        let digest = build_digest(&enterprise(None), "a@b.gn", &scored(12), 10, &[]);
        assert_eq!(digest.subject, "Tender Analyzer - 12 appels d'offres pour InfoTech");
        assert_eq!(digest.match_count, 12);
        assert!(digest.body.contains("10. **Logiciel"));
        assert!(!digest.body.contains("11. **"));
        assert!(digest.body.contains("(84/100, Excellent)"));
        assert!(!digest.body.contains("Recommandations"));
    }

    #[test]
    fn test_digest_ends_with_recommendations() {
        let recommendations = vec!["Ciblez Conakry.".to_string(), "Soignez vos références.".to_string()];
        let digest = build_digest(&enterprise(None), "a@b.gn", &scored(2), 10, &recommendations);
        assert!(digest
            .body
            .ends_with("## Recommandations\n\n1. Ciblez Conakry.\n2. Soignez vos références.\n"));
    }

    #[tokio::test]
    async fn test_sent_digest_is_logged() {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let d = dispatcher(notifier.clone(), repo.clone());

        let outcome = d.notify(&enterprise(Some("dg@infotech.gn")), &scored(3)).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Sent);
        assert_eq!(notifier.sent.lock().unwrap()[0].recipient, "dg@infotech.gn");

        let log = repo.list_notifications(9).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, NotificationStatus::Sent);
        assert_eq!(log[0].match_count, 3);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_logged() {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let d = dispatcher(notifier, repo.clone());

        let outcome = d.notify(&enterprise(Some("dg@infotech.gn")), &scored(1)).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Failed);

        let log = repo.list_notifications(9).await.unwrap();
        assert_eq!(log[0].status, NotificationStatus::Failed);
        assert_eq!(log[0].error_message.as_deref(), Some("smtp unavailable"));
    }

    #[tokio::test]
    async fn test_skips_without_email_or_matches() {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let d = dispatcher(notifier.clone(), repo.clone());

        assert_eq!(d.notify(&enterprise(None), &scored(2)).await.unwrap(), DeliveryOutcome::Skipped);
        assert_eq!(
            d.notify(&enterprise(Some("dg@infotech.gn")), &[]).await.unwrap(),
            DeliveryOutcome::Skipped
        );
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert!(repo.list_notifications(9).await.unwrap().is_empty());

        let mut summary = NotificationSummary::default();
        summary.record(DeliveryOutcome::Skipped);
        summary.record(DeliveryOutcome::Sent);
        assert_eq!(summary, NotificationSummary { sent: 1, failed: 0, skipped: 1 });
    }

    struct ListProvider;

    #[async_trait]
    impl Provider for ListProvider {
        fn name(&self) -> &str {
            "list"
        }

        async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                provider: "list".into(),
                model: request.model,
                content: "1. Répondez aux appels de Conakry.\n2. Mettez à jour vos attestations.".into(),
                usage: TokenUsage::default(),
                finish_reason: Some("stop".into()),
                latency_ms: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_digest_carries_advisor_recommendations() {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let advisor = RecommendationAdvisor::new(
            Arc::new(ListProvider),
            &AnalysisConfig::default(),
            &ProviderConfig::default(),
        );
        let d = dispatcher(notifier.clone(), repo).with_advisor(Arc::new(advisor));

        let outcome = d.notify(&enterprise(Some("dg@infotech.gn")), &scored(3)).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Sent);

        let body = notifier.sent.lock().unwrap()[0].body.clone();
        assert!(body.contains("## Recommandations"));
        assert!(body.contains("2. Mettez à jour vos attestations."));
    }
}
