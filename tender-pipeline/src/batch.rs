//! Paced, sequential analysis of pending tenders.
//!
//! Tenders are split into fixed-size batches. Items of a batch are analyzed
//! one after another with `item_delay` between them; `batch_delay` separates
//! batches. Results are committed after every batch so a failure later in the
//! run never loses earlier work.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tender_common::{BatchConfig, Clock, Waiter};
use tracing::Instrument;

use crate::analysis::{apply_to_tender, AnalysisDecider, AnalysisError, Analyzed};
use crate::error::PipelineError;
use crate::model::{AnalysisRecord, AnalyzedTender, TenderId, TenderRecord};
use crate::storage::Repository;

/// Pacing of provider-bound work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub batch_size: usize,
    pub item_delay: Duration,
    pub batch_delay: Duration,
}

impl PacingPolicy {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            item_delay: config.item_delay(),
            batch_delay: config.batch_delay(),
        }
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

/// Result of analyzing one tender.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub tender_id: TenderId,
    pub result: Result<Analyzed, AnalysisError>,
}

/// Counters reported after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub analyzed: usize,
    pub insufficient: usize,
    pub errors: usize,
    pub ai_calls: usize,
    pub batches: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &AnalysisOutcome) {
        match &outcome.result {
            Ok(analyzed) => {
                self.analyzed += 1;
                if analyzed.used_ai() {
                    self.ai_calls += 1;
                }
            }
            Err(AnalysisError::InsufficientContent { .. }) => self.insufficient += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct BatchRun {
    pub outcomes: Vec<AnalysisOutcome>,
    pub summary: BatchSummary,
}

/// Runs the analysis decider over pending tenders under a pacing policy.
pub struct RateLimitedBatchRunner {
    decider: Arc<AnalysisDecider>,
    repo: Arc<dyn Repository>,
    waiter: Arc<dyn Waiter>,
    clock: Arc<dyn Clock>,
    pacing: PacingPolicy,
}

impl RateLimitedBatchRunner {
    pub fn new(
        decider: Arc<AnalysisDecider>,
        repo: Arc<dyn Repository>,
        waiter: Arc<dyn Waiter>,
        clock: Arc<dyn Clock>,
        pacing: PacingPolicy,
    ) -> Self {
        Self {
            decider,
            repo,
            waiter,
            clock,
            pacing,
        }
    }

    pub fn pacing(&self) -> PacingPolicy {
        self.pacing
    }

    /// Analyze every tender in order.
    ///
    /// Per-item failures are recorded in the outcomes. A storage failure or a
    /// shutdown aborts the run; work committed before that point is kept, and
    /// on shutdown the items already analyzed in the current batch are
    /// committed first.
    pub async fn run_all(&self, tenders: Vec<TenderRecord>) -> Result<BatchRun, PipelineError> {
        let mut run = BatchRun::default();
        if tenders.is_empty() {
            tracing::info!("No pending tenders to analyze");
            return Ok(run);
        }

        let total_batches = tenders.len().div_ceil(self.pacing.batch_size);
        tracing::info!(
            tenders = tenders.len(),
            batches = total_batches,
            batch_size = self.pacing.batch_size,
            "Starting paced analysis"
        );

        for (batch_idx, batch) in tenders.chunks(self.pacing.batch_size).enumerate() {
            let batch_no = batch_idx + 1;
            let span = tracing::info_span!("batch", batch = batch_no, of = total_batches);
            self.run_batch(batch, &mut run).instrument(span).await?;
            run.summary.batches += 1;

            if batch_no < total_batches {
                tracing::debug!(
                    delay_ms = self.pacing.batch_delay.as_millis() as u64,
                    "Pausing between batches"
                );
                self.waiter.wait(self.pacing.batch_delay).await?;
            }
        }

        tracing::info!(
            analyzed = run.summary.analyzed,
            insufficient = run.summary.insufficient,
            errors = run.summary.errors,
            ai_calls = run.summary.ai_calls,
            "Analysis run complete"
        );
        Ok(run)
    }

    async fn run_batch(
        &self,
        batch: &[TenderRecord],
        run: &mut BatchRun,
    ) -> Result<(), PipelineError> {
        let mut to_commit = Vec::with_capacity(batch.len());

        for (item_idx, tender) in batch.iter().enumerate() {
            if self.waiter.is_cancelled() {
                self.commit(&to_commit).await?;
                return Err(PipelineError::Cancelled);
            }

            let result = self.decider.analyze(tender).await;
            if matches!(result, Err(AnalysisError::Cancelled)) {
                self.commit(&to_commit).await?;
                return Err(PipelineError::Cancelled);
            }

            match &result {
                Ok(analyzed) => {
                    let mut updated = tender.clone();
                    apply_to_tender(&mut updated, &analyzed.info);
                    to_commit.push(AnalyzedTender {
                        analysis: Some(AnalysisRecord::unscored(
                            tender.id,
                            analyzed.info.clone(),
                            self.clock.now(),
                        )),
                        tender: updated,
                    });
                    tracing::info!(
                        tender_id = tender.id,
                        ai = analyzed.used_ai(),
                        sector = %analyzed.info.sector,
                        "Tender analyzed"
                    );
                }
                Err(AnalysisError::InsufficientContent { chars }) => {
                    tracing::info!(tender_id = tender.id, chars, "Tender skipped");
                }
                Err(e) => {
                    tracing::error!(tender_id = tender.id, error = %e, "Tender analysis failed");
                }
            }

            let outcome = AnalysisOutcome {
                tender_id: tender.id,
                result,
            };
            run.summary.record(&outcome);
            run.outcomes.push(outcome);

            let is_last = item_idx + 1 == batch.len();
            if !is_last && self.waiter.wait(self.pacing.item_delay).await.is_err() {
                self.commit(&to_commit).await?;
                return Err(PipelineError::Cancelled);
            }
        }

        self.commit(&to_commit).await?;
        tracing::info!(committed = to_commit.len(), "Batch committed");
        Ok(())
    }

    async fn commit(&self, items: &[AnalyzedTender]) -> Result<(), PipelineError> {
        if items.is_empty() {
            return Ok(());
        }
        self.repo
            .commit_analysis_batch(items)
            .await
            .map_err(PipelineError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTender;
    use crate::storage::SqliteRepository;
    use crate::taxonomy::SectorTaxonomy;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tender_common::{AnalysisConfig, Cancelled, ProviderConfig, SystemClock};
    use tender_gateway::{
        ChatRequest, ChatResponse, Provider, ProviderError, ProviderErrorKind, TokenUsage,
    };

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                provider: "echo".into(),
                model: request.model,
                content: r#"{"sector": "Mines & Ressources Naturelles", "estimated_budget": 0, "location": "Boké", "deadline": null}"#.into(),
                usage: TokenUsage::default(),
                finish_reason: None,
                latency_ms: 0,
            })
        }
    }

    /// Records waits; cancels on the first wait of `cancel_on`.
    #[derive(Default)]
    struct RecordingWaiter {
        waits: Mutex<Vec<Duration>>,
        cancel_on: Option<Duration>,
    }

    #[async_trait]
    impl Waiter for RecordingWaiter {
        async fn wait(&self, duration: Duration) -> Result<(), Cancelled> {
            self.waits.lock().unwrap().push(duration);
            if self.cancel_on == Some(duration) {
                Err(Cancelled)
            } else {
                Ok(())
            }
        }
    }

    async fn setup(
        count: usize,
        waiter: Arc<RecordingWaiter>,
    ) -> (RateLimitedBatchRunner, Arc<SqliteRepository>, Vec<TenderRecord>) {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let tenders = (0..count)
            .map(|i| NewTender {
                title: format!("Appel d'offres {i}"),
                description: Some(if i == 3 {
                    "court".into()
                } else {
                    format!("Fourniture de matériel informatique, lot {i}")
                }),
                source_url: format!("https://example.org/ao/{i}"),
                ..Default::default()
            })
            .collect();
        let stored = repo.save_tender_batch(tenders, Utc::now()).await.unwrap();

        let decider = AnalysisDecider::new(
            Arc::new(EchoProvider),
            Arc::new(SectorTaxonomy::default()),
            AnalysisConfig::default(),
            &ProviderConfig::default(),
        );
        let runner = RateLimitedBatchRunner::new(
            Arc::new(decider),
            repo.clone(),
            waiter,
            Arc::new(SystemClock),
            PacingPolicy::default(),
        );
        (runner, repo, stored)
    }

    #[tokio::test]
    async fn test_twelve_tenders_pause_twice_between_batches() {
        let waiter = Arc::new(RecordingWaiter::default());
        let (runner, repo, tenders) = setup(12, waiter.clone()).await;

        let run = runner.run_all(tenders).await.unwrap();

        let waits = waiter.waits.lock().unwrap().clone();
        let batch_pauses = waits.iter().filter(|d| **d == Duration::from_secs(20)).count();
        let item_pauses = waits.iter().filter(|d| **d == Duration::from_secs(4)).count();
        assert_eq!(batch_pauses, 2);
        assert_eq!(item_pauses, 4 + 4 + 1);
        assert_eq!(*waits.last().unwrap(), Duration::from_secs(4));

        assert_eq!(run.summary.batches, 3);
        assert_eq!(run.summary.analyzed, 11);
        assert_eq!(run.summary.insufficient, 1);
        assert_eq!(run.summary.ai_calls, 0);
        assert_eq!(run.outcomes.len(), 12);

        // Outcomes keep input order.
        let ids: Vec<_> = run.outcomes.iter().map(|o| o.tender_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        // Only the insufficient tender stays pending.
        let pending = repo.get_pending_tenders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].description.as_deref(), Some("court"));
    }

    #[tokio::test]
    async fn test_cancel_keeps_committed_batches() {
        let waiter = Arc::new(RecordingWaiter {
            cancel_on: Some(Duration::from_secs(20)),
            ..Default::default()
        });
        let (runner, repo, tenders) = setup(12, waiter).await;

        let err = runner.run_all(tenders).await.unwrap_err();
        assert!(err.is_cancelled());

        // Batch 1 (4 analyzed + 1 insufficient) was committed before the pause.
        assert_eq!(repo.list_analyzed_tenders().await.unwrap().len(), 4);
        assert_eq!(repo.get_pending_tenders().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_commits_partial_batch() {
        let waiter = Arc::new(RecordingWaiter {
            cancel_on: Some(Duration::from_secs(4)),
            ..Default::default()
        });
        let (runner, repo, tenders) = setup(5, waiter).await;

        assert!(runner.run_all(tenders).await.unwrap_err().is_cancelled());
        assert_eq!(repo.list_analyzed_tenders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_long_text_goes_through_provider() {
        let waiter = Arc::new(RecordingWaiter::default());
        let (runner, repo, mut tenders) = setup(1, waiter).await;
        tenders[0].raw_text = Some("Exploitation de bauxite. ".repeat(20));

        let run = runner.run_all(tenders).await.unwrap();
        assert_eq!(run.summary.ai_calls, 1);

        let analyzed = repo.list_analyzed_tenders().await.unwrap();
        assert_eq!(analyzed[0].tender.sector.as_deref(), Some("Mines & Ressources Naturelles"));
        assert_eq!(analyzed[0].tender.location.as_deref(), Some("Boké"));
    }

    #[tokio::test]
    async fn test_empty_input_is_a_noop() {
        let waiter = Arc::new(RecordingWaiter::default());
        let (runner, _repo, _) = setup(0, waiter.clone()).await;
        let run = runner.run_all(Vec::new()).await.unwrap();
        assert_eq!(run.summary, BatchSummary::default());
        assert!(waiter.waits.lock().unwrap().is_empty());
    }

    /// Summarises every tender except the one whose prompt contains `fail_on`.
    struct FlakyProvider {
        fail_on: &'static str,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let prompt = request.messages.last().map(|m| m.content.as_str()).unwrap_or("");
            if prompt.contains(self.fail_on) {
                return Err(ProviderError::new(
                    "flaky",
                    request.model,
                    ProviderErrorKind::Api,
                    "upstream returned 502",
                ));
            }
            EchoProvider.chat(request).await
        }
    }

    #[tokio::test]
    async fn test_provider_error_on_one_tender_spares_the_rest() {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let tenders = (0..3)
            .map(|i| NewTender {
                title: format!("Étude géologique {i}"),
                description: Some(format!("Lot {i} : {}", "relevés de terrain ".repeat(25))),
                source_url: format!("https://example.org/geo/{i}"),
                ..Default::default()
            })
            .collect();
        let stored = repo.save_tender_batch(tenders, Utc::now()).await.unwrap();

        let decider = AnalysisDecider::new(
            Arc::new(FlakyProvider { fail_on: "Lot 1 :" }),
            Arc::new(SectorTaxonomy::default()),
            AnalysisConfig::default(),
            &ProviderConfig::default(),
        );
        let runner = RateLimitedBatchRunner::new(
            Arc::new(decider),
            repo.clone(),
            Arc::new(RecordingWaiter::default()),
            Arc::new(SystemClock),
            PacingPolicy::default(),
        );

        let run = runner.run_all(stored.clone()).await.unwrap();

        assert_eq!(run.summary.errors, 1);
        assert_eq!(run.summary.analyzed, 2);
        assert_eq!(run.summary.ai_calls, 2);
        assert!(matches!(run.outcomes[1].result, Err(AnalysisError::Provider(_))));
        assert!(run.outcomes[2].result.is_ok());

        // The failed tender stays pending for the next cycle; the one after it is committed.
        let pending = repo.get_pending_tenders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, stored[1].id);
        let analyzed = repo.list_analyzed_tenders().await.unwrap();
        assert!(analyzed.iter().any(|a| a.tender.id == stored[2].id));
    }
}
