//! Periodic jobs.
//!
//! Each job ticks on its own interval and runs through
//! `execute_with_coordination`, so at most one process runs a given job at a
//! time and every run lands in the execution log.

use crate::config::ScheduleConfig;
use crate::coordinator::{JobContext, JobOptions};
use crate::error::{ErrorKind, Result};
use crate::services::Services;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    OpenCycle,
    UnifiedResults,
    UnifiedEvaluation,
    IndexerFallback,
    SettlementFallback,
    LockCleanup,
    ExecutionLogRetention,
}

impl Job {
    pub const ALL: [Job; 7] = [
        Job::OpenCycle,
        Job::UnifiedResults,
        Job::UnifiedEvaluation,
        Job::IndexerFallback,
        Job::SettlementFallback,
        Job::LockCleanup,
        Job::ExecutionLogRetention,
    ];

    /// Lock and execution-log name.
    pub fn name(&self) -> &'static str {
        match self {
            Job::OpenCycle => "oddyssey_open_cycle",
            Job::UnifiedResults => "unified_results",
            Job::UnifiedEvaluation => "unified_evaluation",
            Job::IndexerFallback => "indexer_fallback",
            Job::SettlementFallback => "pool_settlement_fallback",
            Job::LockCleanup => "cron_lock_cleanup",
            Job::ExecutionLogRetention => "execution_log_retention",
        }
    }

    pub fn from_name(name: &str) -> Option<Job> {
        Job::ALL.into_iter().find(|j| j.name() == name)
    }

    pub fn interval(&self, schedule: &ScheduleConfig) -> Duration {
        let secs = match self {
            Job::OpenCycle => schedule.open_cycle_secs,
            Job::UnifiedResults => schedule.results_secs,
            Job::UnifiedEvaluation => schedule.evaluation_secs,
            Job::IndexerFallback => schedule.indexer_fallback_secs,
            Job::SettlementFallback => schedule.settlement_fallback_secs,
            Job::LockCleanup => schedule.lock_cleanup_secs,
            Job::ExecutionLogRetention => schedule.retention_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn options(&self) -> JobOptions {
        match self {
            Job::UnifiedEvaluation => JobOptions::default().depends_on(Job::UnifiedResults.name()),
            _ => JobOptions::default(),
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub struct Scheduler {
    services: Arc<Services>,
}

impl Scheduler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// One coordinated run of `job`. The returned JSON summarizes what it did.
    pub async fn run_job(&self, job: Job) -> Result<serde_json::Value> {
        let svc = self.services.clone();
        svc.coordinator
            .execute_with_coordination(job.name(), job.options(), |ctx| {
                let svc = svc.clone();
                async move { Self::job_body(&svc, job, ctx).await }
            })
            .await
    }

    async fn job_body(svc: &Services, job: Job, ctx: JobContext) -> Result<serde_json::Value> {
        let now = Utc::now();
        let value = match job {
            Job::OpenCycle => serde_json::to_value(svc.oddyssey.open_cycle(&ctx, now).await?)?,
            Job::UnifiedResults => serde_json::to_value(svc.oddyssey.run_unified_results(&ctx, now).await?)?,
            Job::UnifiedEvaluation => serde_json::to_value(svc.oddyssey.run_unified_evaluation(&ctx).await?)?,
            Job::IndexerFallback => serde_json::to_value(
                svc.indexer
                    .reconcile(svc.config.indexer.fallback_lookback_blocks)
                    .await?,
            )?,
            Job::SettlementFallback => serde_json::to_value(svc.settlement.settle_due_pools(&ctx, now).await?)?,
            Job::LockCleanup => serde_json::json!({ "expired": svc.coordinator.cleanup_expired_locks().await? }),
            Job::ExecutionLogRetention => {
                let schedule = &svc.config.schedule;
                let log_rows = svc
                    .coordinator
                    .prune_execution_log(schedule.execution_log_retention_days)
                    .await?;
                let fixtures = svc
                    .results
                    .prune_fixtures(now - chrono::Duration::days(schedule.fixture_retention_days))
                    .await?;
                serde_json::json!({ "execution_log_rows": log_rows, "fixtures": fixtures })
            }
        };
        Ok(value)
    }

    /// Spawn one ticking task per job plus the live indexer. Tasks stop when
    /// `shutdown` flips to `true`.
    pub fn spawn_all(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let indexer = self.services.indexer.clone();
        let poll = Duration::from_millis(self.services.config.chain.poll_interval_ms);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { indexer.run(poll, rx).await }));

        for job in Job::ALL {
            let scheduler = self.clone();
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.job_loop(job, rx).await }));
        }
        handles
    }

    async fn job_loop(&self, job: Job, mut shutdown: watch::Receiver<bool>) {
        let every = job.interval(&self.services.config.schedule);
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job = %job, interval_secs = every.as_secs(), "job scheduled");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_job(job).await {
                        Ok(summary) => debug!(job = %job, summary = %summary, "scheduled run finished"),
                        Err(e) => match e.kind() {
                            ErrorKind::LockContention | ErrorKind::DependencyUnmet => {
                                debug!(job = %job, reason = %e, "scheduled run skipped")
                            }
                            _ => warn!(job = %job, error = %e, "scheduled run failed"),
                        },
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(job = %job, "job loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_names_round_trip() {
        for job in Job::ALL {
            assert_eq!(Job::from_name(job.name()), Some(job));
        }
        assert_eq!(Job::from_name("nope"), None);
    }

    #[test]
    fn test_evaluation_depends_on_results() {
        assert_eq!(Job::UnifiedEvaluation.options().dependencies, vec!["unified_results".to_string()]);
        assert!(Job::OpenCycle.options().dependencies.is_empty());
    }

    #[test]
    fn test_default_intervals() {
        let schedule = ScheduleConfig::default();
        assert_eq!(Job::UnifiedResults.interval(&schedule), Duration::from_secs(900));
        assert_eq!(Job::UnifiedEvaluation.interval(&schedule), Duration::from_secs(1200));
    }
}
