//! Tender Pipeline Library
//!
//! Matches procurement announcements against registered enterprise profiles.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    tender-pipeline (daily cycle)                    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Scrape ──▶ ExtractText ──▶ Analyze ──▶ ScoreAndNotify              │
//! │  (sources)   (extractor)    (batch runner   (scoring engine         │
//! │                              + decider)      + dispatcher)          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  SQLite repository          DailyScheduler (cron, misfire grace)    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Scoring
//! - Weighted sector, budget, location and experience sub-scores
//! - Include keywords boost the total, exclude keywords veto it
//! - Every score carries a human-readable explanation
//!
//! ## Analysis
//! - Long documents go to the chat-completion provider, short ones to a
//!   local heuristic
//! - Provider calls are paced in batches to stay under the rate limit

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod advice;
pub mod analysis;
pub mod batch;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod scoring;
pub mod sources;
pub mod storage;
pub mod taxonomy;

pub use advice::RecommendationAdvisor;
pub use analysis::{AnalysisDecider, AnalysisError, AnalysisPath, Analyzed};
pub use batch::{BatchRun, BatchSummary, PacingPolicy, RateLimitedBatchRunner};
pub use coordinator::{CycleOutcome, CycleReport, PipelineCoordinator, Stage};
pub use error::PipelineError;
pub use model::{
    AnalysisRecord, AnalyzedTender, EnterpriseProfile, ExtractedInfo, NewTender, ScoredTender,
    TenderRecord,
};
pub use notify::{ChannelsNotifier, NotificationDispatcher, NotificationSummary, Notifier};
pub use scheduler::{CycleRunner, DailyScheduler, FireDecision, TriggerOutcome};
pub use scoring::{MatchReport, ScoreResult, ScoringEngine};
pub use sources::{FileTextExtractor, JsonFeedSource, TenderSource, TextExtractor};
pub use storage::{Repository, SqliteRepository};
pub use taxonomy::{MatchStrength, SectorTaxonomy};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tender_common::config::{config_dir, Config};
use tender_common::{Clock, ShutdownHandle, SystemClock, Waiter};
use tender_gateway::{CompatibleProvider, Provider, RetryPolicy, RetryingProvider};

/// Pipeline service: the coordinator wired from configuration.
pub struct PipelineService {
    config: Config,
    shutdown: ShutdownHandle,
    repo: Arc<dyn Repository>,
    coordinator: Arc<PipelineCoordinator>,
}

impl PipelineService {
    /// Open the database and build every collaborator.
    pub fn new(config: Config) -> Result<Self> {
        let shutdown = ShutdownHandle::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let waiter: Arc<dyn Waiter> = Arc::new(shutdown.waiter());

        let repo: Arc<dyn Repository> = Arc::new(
            SqliteRepository::open(&config.database.path).with_context(|| {
                format!("Failed to open database {}", config.database.path.display())
            })?,
        );

        if !config.provider.has_api_key() {
            tracing::warn!("No provider API key configured, long documents will fail AI analysis");
        }
        let provider: Arc<dyn Provider> = Arc::new(RetryingProvider::new(
            CompatibleProvider::from_config(&config.provider),
            RetryPolicy::from_config(&config.retry),
            Arc::clone(&waiter),
        ));

        let taxonomy = Arc::new(SectorTaxonomy::default());
        let decider = Arc::new(AnalysisDecider::new(
            Arc::clone(&provider),
            Arc::clone(&taxonomy),
            config.analysis.clone(),
            &config.provider,
        ));
        let runner = RateLimitedBatchRunner::new(
            decider,
            Arc::clone(&repo),
            waiter,
            Arc::clone(&clock),
            PacingPolicy::from_config(&config.batch),
        );

        let sources: Vec<Arc<dyn TenderSource>> = config
            .sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                Arc::new(JsonFeedSource::from_config(
                    s,
                    Arc::clone(&taxonomy),
                    &config.analysis.default_sector,
                )) as Arc<dyn TenderSource>
            })
            .collect();
        if sources.is_empty() {
            tracing::warn!("No tender source enabled, the scrape stage will find nothing");
        }

        let extractor = Arc::new(FileTextExtractor::new().with_base_dir(config_dir()));
        let mut dispatcher = NotificationDispatcher::new(
            Arc::new(ChannelsNotifier::from_config(&config.notification)),
            Arc::clone(&repo),
            Arc::clone(&clock),
            &config.notification,
        );
        if config.notification.recommendations {
            dispatcher = dispatcher.with_advisor(Arc::new(RecommendationAdvisor::new(
                provider,
                &config.analysis,
                &config.provider,
            )));
        }

        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::clone(&repo),
            sources,
            extractor,
            runner,
            ScoringEngine::new(taxonomy),
            dispatcher,
            clock,
        ));

        Ok(Self {
            config,
            shutdown,
            repo,
            coordinator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<PipelineCoordinator> {
        &self.coordinator
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Handle that interrupts pacing waits and stops the scheduler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Scheduler driving this service's coordinator.
    pub fn scheduler(&self) -> Result<DailyScheduler> {
        DailyScheduler::new(
            self.config.schedule.clone(),
            Arc::clone(&self.coordinator) as Arc<dyn CycleRunner>,
            Arc::new(SystemClock),
            self.shutdown.clone(),
        )
    }

    /// Run the daily scheduler until shutdown.
    pub async fn serve(&self) -> Result<()> {
        let enterprises = self.repo.list_enterprises().await?.len();
        let tenders = self.repo.count_tenders().await?;
        tracing::info!(enterprises, tenders, "Pipeline service ready");

        self.scheduler()?.run().await
    }

    /// Run one cycle now.
    pub async fn run_once(&self) -> CycleReport {
        self.coordinator.run_cycle().await
    }

    /// Load enterprise profiles from a JSON array file, keyed by name.
    pub async fn import_enterprises(&self, path: &Path) -> Result<usize> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let profiles: Vec<EnterpriseProfile> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse enterprises from {}", path.display()))?;

        let mut imported = 0;
        for profile in &profiles {
            if let Err(e) = profile.validate() {
                tracing::warn!(name = %profile.name, error = %e, "Skipping invalid enterprise");
                continue;
            }
            let id = self.repo.upsert_enterprise(profile).await?;
            tracing::debug!(enterprise_id = id, name = %profile.name, "Enterprise imported");
            imported += 1;
        }

        tracing::info!(imported, total = profiles.len(), "Enterprises imported");
        Ok(imported)
    }
}
