//! The daily cycle: Scrape → ExtractText → Analyze → ScoreAndNotify.
//!
//! Failures of a single source, document, tender or digest are logged and
//! counted inside their stage. An error raised out of a stage aborts the
//! remaining stages of that run; the next scheduled run starts fresh and
//! picks up every tender still pending.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tender_common::logging::{generate_run_id, short_id};
use tender_common::Clock;
use tracing::Instrument;

use crate::batch::{BatchSummary, RateLimitedBatchRunner};
use crate::error::PipelineError;
use crate::model::{AnalyzedTender, EnterpriseId, EnterpriseProfile, NewTender, ScoredTender};
use crate::notify::{NotificationDispatcher, NotificationSummary};
use crate::scoring::{MatchReport, ScoringEngine};
use crate::sources::{TenderSource, TextExtractor};
use crate::storage::Repository;

// ============================================================================
// Cycle types
// ============================================================================

/// Ordered stages of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    ExtractText,
    Analyze,
    ScoreAndNotify,
}

impl Stage {
    /// 1-based position in the cycle.
    pub fn number(&self) -> u8 {
        match self {
            Self::Scrape => 1,
            Self::ExtractText => 2,
            Self::Analyze => 3,
            Self::ScoreAndNotify => 4,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Scrape => "scrape",
            Self::ExtractText => "extract_text",
            Self::Analyze => "analyze",
            Self::ScoreAndNotify => "score_and_notify",
        };
        f.write_str(name)
    }
}

/// Terminal state of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "stage", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    AbortedAtStage(Stage),
}

/// What one cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    /// Error that aborted the cycle, if any
    pub error: Option<String>,
    pub sources_failed: usize,
    pub new_tenders: usize,
    pub texts_extracted: usize,
    pub analysis: BatchSummary,
    pub enterprises_scored: usize,
    pub notifications: NotificationSummary,
}

impl CycleReport {
    fn new(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            outcome: CycleOutcome::Completed,
            error: None,
            sources_failed: 0,
            new_tenders: 0,
            texts_extracted: 0,
            analysis: BatchSummary::default(),
            enterprises_scored: 0,
            notifications: NotificationSummary::default(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == CycleOutcome::Completed
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Runs cycles over injected collaborators.
pub struct PipelineCoordinator {
    repo: Arc<dyn Repository>,
    sources: Vec<Arc<dyn TenderSource>>,
    extractor: Arc<dyn TextExtractor>,
    runner: RateLimitedBatchRunner,
    engine: ScoringEngine,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
}

impl PipelineCoordinator {
    pub fn new(
        repo: Arc<dyn Repository>,
        sources: Vec<Arc<dyn TenderSource>>,
        extractor: Arc<dyn TextExtractor>,
        runner: RateLimitedBatchRunner,
        engine: ScoringEngine,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            sources,
            extractor,
            runner,
            engine,
            dispatcher,
            clock,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Run one full cycle. Never fails: an aborted stage is logged and
    /// reported as [`CycleOutcome::AbortedAtStage`], and the stages after it
    /// do not run for this cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let run_id = generate_run_id();
        let span = tracing::info_span!("cycle", run_id = %short_id(&run_id));
        self.run_cycle_inner(run_id).instrument(span).await
    }

    async fn run_cycle_inner(&self, run_id: String) -> CycleReport {
        let mut report = CycleReport::new(run_id, self.clock.now());
        tracing::info!(started_at = %report.started_at, "Daily cycle started");

        if let Err((stage, err)) = self.run_stages(&mut report).await {
            tracing::error!(stage = %stage, error = %err, "Daily cycle aborted");
            report.outcome = CycleOutcome::AbortedAtStage(stage);
            report.error = Some(err.to_string());
        }

        report.finished_at = self.clock.now();
        tracing::info!(
            outcome = ?report.outcome,
            new_tenders = report.new_tenders,
            analyzed = report.analysis.analyzed,
            sent = report.notifications.sent,
            failed = report.notifications.failed,
            skipped = report.notifications.skipped,
            "Daily cycle finished"
        );
        report
    }

    async fn run_stages(&self, report: &mut CycleReport) -> Result<(), (Stage, PipelineError)> {
        let at = |stage: Stage| move |err: PipelineError| (stage, err);

        tracing::info!(stage = %Stage::Scrape, "Stage 1/4: scraping tenders");
        let (new_tenders, sources_failed) = self.scrape().await.map_err(at(Stage::Scrape))?;
        report.new_tenders = new_tenders;
        report.sources_failed = sources_failed;

        tracing::info!(stage = %Stage::ExtractText, "Stage 2/4: extracting document text");
        report.texts_extracted = self.extract_texts().await.map_err(at(Stage::ExtractText))?;

        tracing::info!(stage = %Stage::Analyze, "Stage 3/4: analyzing pending tenders");
        report.analysis = self.analyze().await.map_err(at(Stage::Analyze))?;

        tracing::info!(stage = %Stage::ScoreAndNotify, "Stage 4/4: scoring and notifying");
        let (scored, notifications) = self
            .score_and_notify()
            .await
            .map_err(at(Stage::ScoreAndNotify))?;
        report.enterprises_scored = scored;
        report.notifications = notifications;

        Ok(())
    }

    /// Fetch every source in turn and store tenders with unseen URLs.
    /// Returns the number of new tenders and of failed sources.
    async fn scrape(&self) -> Result<(usize, usize), PipelineError> {
        let mut failed = 0;
        let mut seen = HashSet::new();
        let mut collected: Vec<NewTender> = Vec::new();

        for source in &self.sources {
            match self.fetch_source(source.as_ref()).await {
                Ok(tenders) => {
                    let before = collected.len();
                    collected.extend(
                        tenders
                            .into_iter()
                            .filter(|t| seen.insert(t.source_url.clone())),
                    );
                    tracing::info!(
                        source = source.name(),
                        tenders = collected.len() - before,
                        "Source scraped"
                    );
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(error = %e, "Source skipped");
                }
            }
        }

        let created = self.repo.save_tender_batch(collected, self.clock.now()).await?;
        tracing::info!(new_tenders = created.len(), failed_sources = failed, "Scraping done");
        Ok((created.len(), failed))
    }

    async fn fetch_source(&self, source: &dyn TenderSource) -> Result<Vec<NewTender>, PipelineError> {
        source.fetch().await.map_err(|e| {
            if e.is_rate_limited() {
                tracing::warn!(source = source.name(), "Source is throttling requests");
            }
            PipelineError::Source {
                name: source.name().to_string(),
                message: e.to_string(),
            }
        })
    }

    async fn extract_texts(&self) -> Result<usize, PipelineError> {
        let mut extracted = 0;
        for tender in self.repo.get_tenders_missing_text().await? {
            match self.extractor.extract(&tender).await {
                Ok(Some(text)) => {
                    self.repo.update_raw_text(tender.id, &text).await?;
                    extracted += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tender_id = tender.id, error = %e, "Text extraction failed");
                }
            }
        }
        tracing::info!(extracted, "Text extraction done");
        Ok(extracted)
    }

    async fn analyze(&self) -> Result<BatchSummary, PipelineError> {
        let pending = self.repo.get_pending_tenders().await?;
        let run = self.runner.run_all(pending).await?;
        Ok(run.summary)
    }

    async fn score_and_notify(&self) -> Result<(usize, NotificationSummary), PipelineError> {
        let analyzed = self.repo.list_analyzed_tenders().await?;
        let enterprises = self.repo.list_enterprises().await?;
        let mut summary = NotificationSummary::default();
        if !self.dispatcher.is_enabled() {
            tracing::info!("Notifications disabled, scoring only");
        }

        for enterprise in &enterprises {
            let scored = self.score_enterprise(enterprise, &analyzed).await?;
            summary.record(self.dispatcher.notify(enterprise, &scored).await?);
        }

        tracing::info!(
            enterprises = enterprises.len(),
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "Notifications done"
        );
        Ok((enterprises.len(), summary))
    }

    /// Rank analyzed tenders for one enterprise and store each score on its
    /// tender's analysis, overwriting the previous enterprise's score.
    async fn score_enterprise(
        &self,
        enterprise: &EnterpriseProfile,
        analyzed: &[AnalyzedTender],
    ) -> Result<Vec<ScoredTender>, PipelineError> {
        let scored = self.engine.rank(enterprise, analyzed);
        self.repo.record_scores(enterprise.id, &scored).await?;
        tracing::debug!(enterprise_id = enterprise.id, scored = scored.len(), "Enterprise scored");
        Ok(scored)
    }

    /// Ranked matches of one enterprise against every analyzed tender.
    pub async fn matches_for(
        &self,
        enterprise_id: EnterpriseId,
        limit: Option<usize>,
    ) -> Result<Option<(Vec<ScoredTender>, MatchReport)>, PipelineError> {
        let Some(enterprise) = self.repo.get_enterprise(enterprise_id).await? else {
            return Ok(None);
        };
        let analyzed = self.repo.list_analyzed_tenders().await?;
        let mut scored = self.score_enterprise(&enterprise, &analyzed).await?;
        let report = MatchReport::from_scored(&scored);
        if let Some(limit) = limit {
            scored.truncate(limit);
        }
        Ok(Some((scored, report)))
    }
}
