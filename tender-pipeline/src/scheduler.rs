//! Daily cycle scheduler.
//!
//! Evaluates a cron schedule (`0 {minute} {hour} * * *` in the configured UTC
//! offset) every `check_interval_secs`:
//! - several fire times missed since the last check are coalesced into one run
//! - a fire time older than `misfire_grace_secs` is dropped
//! - at most one cycle runs at a time; further triggers are skipped, not queued

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tender_common::{Clock, ScheduleConfig, ShutdownHandle};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::coordinator::{CycleReport, PipelineCoordinator};

/// Something that runs one daily cycle.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self) -> CycleReport;
}

#[async_trait]
impl CycleRunner for PipelineCoordinator {
    async fn run_cycle(&self) -> CycleReport {
        PipelineCoordinator::run_cycle(self).await
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Result of a trigger request.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// A cycle was started; the handle resolves to its report
    Started(JoinHandle<CycleReport>),
    /// A cycle was already in progress
    Skipped,
}

/// What a schedule check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    /// No fire time since the last check
    Idle,
    /// Run for this (latest) fire time
    Fire(DateTime<Utc>),
    /// The latest fire time is past the misfire grace
    Missed(DateTime<Utc>),
}

/// Cron-driven runner of the daily cycle.
pub struct DailyScheduler {
    config: ScheduleConfig,
    schedule: Schedule,
    offset: FixedOffset,
    runner: Arc<dyn CycleRunner>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownHandle,
    /// One permit: held by the running cycle
    in_flight: Arc<Semaphore>,
    state: RwLock<SchedulerState>,
}

impl DailyScheduler {
    pub fn new(
        config: ScheduleConfig,
        runner: Arc<dyn CycleRunner>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownHandle,
    ) -> Result<Self> {
        let expression = config.cron_expression();
        let schedule = Schedule::from_str(&expression)
            .with_context(|| format!("Invalid daily cycle cron: {}", expression))?;
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
            .with_context(|| format!("Invalid UTC offset: {} minutes", config.utc_offset_minutes))?;

        Ok(Self {
            config,
            schedule,
            offset,
            runner,
            clock,
            shutdown,
            in_flight: Arc::new(Semaphore::new(1)),
            state: RwLock::new(SchedulerState::Stopped),
        })
    }

    pub async fn get_state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Next fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.offset))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Decide whether fire times in `(since, now]` call for a run.
    pub fn check(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> FireDecision {
        let latest = self
            .schedule
            .after(&since.with_timezone(&self.offset))
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= now)
            .last();

        match latest {
            None => FireDecision::Idle,
            Some(fire) => {
                let grace = chrono::Duration::seconds(self.config.misfire_grace_secs as i64);
                if now.signed_duration_since(fire) <= grace {
                    FireDecision::Fire(fire)
                } else {
                    FireDecision::Missed(fire)
                }
            }
        }
    }

    /// Start a cycle unless one is already running.
    pub fn trigger_now(&self) -> TriggerOutcome {
        let Ok(permit) = Arc::clone(&self.in_flight).try_acquire_owned() else {
            info!("Daily cycle already in progress, trigger skipped");
            return TriggerOutcome::Skipped;
        };

        let runner = Arc::clone(&self.runner);
        TriggerOutcome::Started(tokio::spawn(async move {
            let report = runner.run_cycle().await;
            drop(permit);
            report
        }))
    }

    /// Whether a cycle is currently running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.available_permits() == 0
    }

    /// Run the scheduler loop until shutdown, then wait for a running cycle.
    pub async fn run(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Scheduler disabled, not starting");
            return Ok(());
        }

        *self.state.write().await = SchedulerState::Running;

        let mut since = self.clock.now();
        info!(
            cron = %self.config.cron_expression(),
            utc_offset_minutes = self.config.utc_offset_minutes,
            next_run = ?self.next_fire_after(since),
            "Scheduler started"
        );

        let mut ticker = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if self.shutdown.is_shutdown() {
                break;
            }

            let now = self.clock.now();
            match self.check(since, now) {
                FireDecision::Idle => {}
                FireDecision::Fire(fire) => {
                    info!(scheduled_for = %fire, "Daily cycle due");
                    if let TriggerOutcome::Started(_) = self.trigger_now() {
                        debug!(next_run = ?self.next_fire_after(now), "Daily cycle started");
                    }
                }
                FireDecision::Missed(fire) => {
                    warn!(
                        scheduled_for = %fire,
                        grace_secs = self.config.misfire_grace_secs,
                        "Daily cycle missed its grace period, skipping"
                    );
                }
            }
            since = now;
        }

        *self.state.write().await = SchedulerState::Stopped;
        info!("Scheduler stopping, waiting for running cycle");
        match self.in_flight.acquire().await {
            Ok(_permit) => info!("Scheduler stopped"),
            Err(e) => error!(error = %e, "Scheduler stopped with a closed run lock"),
        }
        Ok(())
    }
}
