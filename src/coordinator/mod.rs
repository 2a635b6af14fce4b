//! Distributed job coordination.
//!
//! Mutual exclusion across processes comes from the `system.cron_locks`
//! primary key: acquiring is a single insert that either wins or loses, and
//! never blocks. Every acquired lock has a `started` row in the execution log
//! that is moved to a terminal status on release, on TTL expiry, or by an
//! operator force-release.
//!
//! A job run is bounded by its lock TTL: the job future is wrapped in
//! `tokio::time::timeout`, so when the TTL elapses every nested RPC call,
//! query and sleep is dropped with it.

use crate::config::CoordinatorConfig;
use crate::error::{ErrorKind, KeeperError, Result};
use crate::store::{AlertStore, CronLock, ExecutionLogEntry, ExecutionStatus, LockStore, SystemAlert};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-run options for [`JobCoordinator::execute_with_coordination`].
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Jobs whose most recent execution must be absent or `completed`.
    pub dependencies: Vec<String>,
    /// Overrides the configured lock TTL.
    pub lock_ttl: Option<Duration>,
    /// Overrides the configured retry count.
    pub retries: Option<u32>,
    pub metadata: serde_json::Value,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            dependencies: Vec::new(),
            lock_ttl: None,
            retries: None,
            metadata: serde_json::json!({}),
        }
    }
}

impl JobOptions {
    pub fn depends_on(mut self, job_name: &str) -> Self {
        self.dependencies.push(job_name.to_string());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Handed to the job body. Long loops call [`JobContext::ensure_active`]
/// between units of work so they stop cleanly before the TTL cuts them off.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    pub execution_id: Uuid,
    pub attempt: u32,
    deadline: Instant,
}

impl JobContext {
    pub fn new(job_name: &str, execution_id: Uuid, attempt: u32, ttl: Duration) -> Self {
        Self {
            job_name: job_name.to_string(),
            execution_id,
            attempt,
            deadline: Instant::now() + ttl,
        }
    }

    /// A context with no practical deadline, for one-off runs outside the
    /// coordinator (tests, dry runs).
    pub fn detached(job_name: &str) -> Self {
        Self::new(job_name, Uuid::new_v4(), 1, Duration::from_secs(24 * 3_600))
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn ensure_active(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(KeeperError::Timeout {
                job: self.job_name.clone(),
            });
        }
        Ok(())
    }
}

/// Locks and recent executions, for the operational status command.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub locks: Vec<CronLock>,
    pub recent: Vec<ExecutionLogEntry>,
}

/// `hostname:pid`, the identity written to `locked_by`.
pub fn runner_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let pid = std::env::var("PID").unwrap_or_else(|_| std::process::id().to_string());
    format!("{}:{}", host, pid)
}

pub struct JobCoordinator {
    locks: Arc<dyn LockStore>,
    alerts: Arc<dyn AlertStore>,
    runner_id: String,
    config: CoordinatorConfig,
}

impl JobCoordinator {
    pub fn new(locks: Arc<dyn LockStore>, alerts: Arc<dyn AlertStore>, config: CoordinatorConfig) -> Self {
        Self::with_runner_id(locks, alerts, config, runner_identity())
    }

    pub fn with_runner_id(
        locks: Arc<dyn LockStore>,
        alerts: Arc<dyn AlertStore>,
        config: CoordinatorConfig,
        runner_id: String,
    ) -> Self {
        Self {
            locks,
            alerts,
            runner_id,
            config,
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Try to take the job's lock. Returns the new execution id, or `None`
    /// when another runner holds an unexpired lock.
    pub async fn acquire_lock(
        &self,
        job_name: &str,
        ttl: Duration,
        metadata: serde_json::Value,
    ) -> Result<Option<Uuid>> {
        self.cleanup_expired_locks().await?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| KeeperError::Validation(format!("lock ttl out of range: {}", e)))?;
        let lock = CronLock {
            job_name: job_name.to_string(),
            locked_by: self.runner_id.clone(),
            locked_at: now,
            expires_at: now + ttl,
            execution_id: Uuid::new_v4(),
            metadata,
        };

        if self.locks.insert_lock(&lock).await? {
            debug!(job = job_name, execution_id = %lock.execution_id, "lock acquired");
            Ok(Some(lock.execution_id))
        } else {
            debug!(job = job_name, "lock held by another runner");
            Ok(None)
        }
    }

    /// Drop the lock if it is still ours and finalize the execution row.
    pub async fn release_lock(
        &self,
        job_name: &str,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let deleted = self.locks.delete_lock(job_name, execution_id).await?;
        if !deleted {
            warn!(job = job_name, execution_id = %execution_id, "lock already gone at release");
        }
        self.locks
            .finish_execution(execution_id, status, Utc::now(), error)
            .await?;
        debug!(job = job_name, execution_id = %execution_id, status = %status, "lock released");
        Ok(())
    }

    pub async fn is_locked(&self, job_name: &str) -> Result<bool> {
        self.cleanup_expired_locks().await?;
        Ok(self.locks.find_lock(job_name).await?.is_some())
    }

    /// Remove expired locks and mark their runs `timeout`.
    pub async fn cleanup_expired_locks(&self) -> Result<usize> {
        let expired = self.locks.purge_expired_locks(Utc::now()).await?;
        for lock in &expired {
            warn!(
                job = %lock.job_name,
                execution_id = %lock.execution_id,
                locked_by = %lock.locked_by,
                "expired lock reclaimed"
            );
        }
        Ok(expired.len())
    }

    /// Operator override: delete the lock whoever holds it.
    pub async fn force_release_lock(&self, job_name: &str) -> Result<bool> {
        let removed = self.locks.remove_lock(job_name).await?;
        let finalized = self
            .locks
            .finish_started_executions(job_name, ExecutionStatus::ForceReleased, Utc::now())
            .await?;
        match &removed {
            Some(lock) => warn!(
                job = job_name,
                locked_by = %lock.locked_by,
                execution_id = %lock.execution_id,
                finalized,
                "lock force-released"
            ),
            None => info!(job = job_name, finalized, "no lock to force-release"),
        }
        Ok(removed.is_some())
    }

    /// A dependency is satisfied when it is not running and its most recent
    /// execution inside the window completed (or there is none).
    pub async fn dependency_satisfied(&self, dependency: &str) -> Result<bool> {
        if self.is_locked(dependency).await? {
            return Ok(false);
        }
        let window = chrono::Duration::from_std(self.config.dependency_window())
            .map_err(|e| KeeperError::Validation(format!("dependency window out of range: {}", e)))?;
        let latest = self.locks.latest_execution(dependency, Utc::now() - window).await?;
        Ok(match latest {
            None => true,
            Some(entry) => entry.status == ExecutionStatus::Completed,
        })
    }

    /// Poll until the dependency is satisfied or `max_wait` elapses.
    pub async fn wait_for_dependency(&self, dependency: &str, max_wait: Duration, poll: Duration) -> Result<bool> {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.dependency_satisfied(dependency).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            debug!(dependency, "waiting for dependency");
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// `base × 2^(attempt-1) + jitter`, capped at the configured maximum.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay();
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_range = (base.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis((Uuid::new_v4().as_u128() as u64) % jitter_range);
        exp.saturating_add(jitter).min(self.config.max_delay())
    }

    /// Run `job` under the job's lock: wait for dependencies, acquire, run
    /// bounded by the TTL, release with the outcome. Lost acquire races and
    /// retriable failures are retried with backoff.
    pub async fn execute_with_coordination<T, F, Fut>(&self, job_name: &str, options: JobOptions, job: F) -> Result<T>
    where
        F: Fn(JobContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for dependency in &options.dependencies {
            let ready = self
                .wait_for_dependency(
                    dependency,
                    self.config.dependency_max_wait(),
                    self.config.dependency_poll(),
                )
                .await?;
            if !ready {
                warn!(job = job_name, dependency = %dependency, "dependency not satisfied, skipping run");
                return Err(KeeperError::DependencyUnmet {
                    job: job_name.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }

        let ttl = options.lock_ttl.unwrap_or_else(|| self.config.lock_ttl());
        let max_attempts = options.retries.unwrap_or(self.config.retries) + 1;
        let mut last_error = KeeperError::LockContention(job_name.to_string());

        for attempt in 1..=max_attempts {
            let execution_id = match self.acquire_lock(job_name, ttl, options.metadata.clone()).await? {
                Some(id) => id,
                None => {
                    last_error = KeeperError::LockContention(job_name.to_string());
                    if attempt < max_attempts {
                        let delay = self.backoff_delay(attempt);
                        debug!(job = job_name, attempt, delay_ms = delay.as_millis() as u64, "lock contended, backing off");
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            };

            info!(job = job_name, execution_id = %execution_id, attempt, "job started");
            let started = Instant::now();
            let ctx = JobContext::new(job_name, execution_id, attempt, ttl);

            match tokio::time::timeout(ttl, job(ctx)).await {
                Ok(Ok(value)) => {
                    self.release_lock(job_name, execution_id, ExecutionStatus::Completed, None)
                        .await?;
                    info!(
                        job = job_name,
                        execution_id = %execution_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job completed"
                    );
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    self.release_lock(job_name, execution_id, ExecutionStatus::Failed, Some(&message))
                        .await?;
                    if e.needs_alert() {
                        error!(job = job_name, execution_id = %execution_id, kind = %e.kind(), error = %e, "job failed");
                        self.raise_alert(job_name, execution_id, &e).await;
                    } else {
                        warn!(job = job_name, execution_id = %execution_id, kind = %e.kind(), error = %e, "job failed");
                    }
                    // A job body that timed itself out is not retried this round.
                    if !e.is_retriable() || e.kind() == ErrorKind::Timeout || attempt == max_attempts {
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt);
                    info!(job = job_name, attempt, delay_ms = delay.as_millis() as u64, "retrying job");
                    last_error = e;
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    self.release_lock(job_name, execution_id, ExecutionStatus::Timeout, Some("exceeded lock ttl"))
                        .await?;
                    error!(
                        job = job_name,
                        execution_id = %execution_id,
                        ttl_secs = ttl.as_secs(),
                        "job exceeded its lock ttl and was cancelled"
                    );
                    return Err(KeeperError::Timeout {
                        job: job_name.to_string(),
                    });
                }
            }
        }

        Err(last_error)
    }

    pub async fn status(&self, recent: i64) -> Result<CoordinatorStatus> {
        Ok(CoordinatorStatus {
            locks: self.locks.list_locks().await?,
            recent: self.locks.recent_executions(recent).await?,
        })
    }

    /// Delete finished execution-log rows older than `days`.
    pub async fn prune_execution_log(&self, days: i64) -> Result<u64> {
        let removed = self
            .locks
            .prune_execution_log(Utc::now() - chrono::Duration::days(days))
            .await?;
        info!(removed, days, "execution log pruned");
        Ok(removed)
    }

    async fn raise_alert(&self, job_name: &str, execution_id: Uuid, err: &KeeperError) {
        let alert = SystemAlert {
            alert_type: err.kind().to_string(),
            message: err.to_string(),
            details: serde_json::json!({
                "job": job_name,
                "execution_id": execution_id,
                "runner": self.runner_id,
            }),
            created_at: Utc::now(),
        };
        if let Err(e) = self.alerts.record_alert(&alert).await {
            error!(job = job_name, error = %e, "failed to record system alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            lock_ttl_secs: 1_800,
            base_delay_ms: 10,
            max_delay_secs: 1,
            retries: 2,
            dependency_window_secs: 3_600,
            dependency_max_wait_secs: 0,
            dependency_poll_ms: 10,
        }
    }

    fn coordinator(store: &Arc<MemoryStore>, runner: &str) -> JobCoordinator {
        JobCoordinator::with_runner_id(store.clone(), store.clone(), test_config(), runner.to_string())
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(coordinator(&store, "host-a:1"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move {
                c.acquire_lock("unified_evaluation", Duration::from_secs(1_800), serde_json::json!({}))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.executions_for("unified_evaluation").await.len(), 1);
    }

    #[tokio::test]
    async fn test_contention_then_release() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator(&store, "host-a:1");
        let b = coordinator(&store, "host-b:2");
        let ttl = Duration::from_secs(30 * 60);

        let winner = a.acquire_lock("unified_evaluation", ttl, serde_json::json!({})).await.unwrap();
        let loser = b.acquire_lock("unified_evaluation", ttl, serde_json::json!({})).await.unwrap();
        assert!(winner.is_some());
        assert!(loser.is_none());

        a.release_lock("unified_evaluation", winner.unwrap(), ExecutionStatus::Completed, None)
            .await
            .unwrap();
        assert!(b.acquire_lock("unified_evaluation", ttl, serde_json::json!({})).await.unwrap().is_some());

        let log = store.executions_for("unified_evaluation").await;
        assert_eq!(log[0].status, ExecutionStatus::Completed);
        assert!(log[0].duration_ms.is_some());
        assert_eq!(log[1].status, ExecutionStatus::Started);
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator(&store, "host-a:1");
        let b = coordinator(&store, "host-b:2");

        let first = a
            .acquire_lock("unified_results", Duration::from_millis(20), serde_json::json!({}))
            .await
            .unwrap();
        assert!(first.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = b
            .acquire_lock("unified_results", Duration::from_secs(60), serde_json::json!({}))
            .await
            .unwrap();
        assert!(second.is_some());

        let log = store.executions_for("unified_results").await;
        assert_eq!(log[0].execution_id, first.unwrap());
        assert_eq!(log[0].status, ExecutionStatus::Timeout);
        assert_eq!(log[1].status, ExecutionStatus::Started);
    }

    #[tokio::test]
    async fn test_dependency_gating() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(&store, "host-a:1");
        let ran = Arc::new(AtomicU32::new(0));

        // No recent execution of the dependency: B runs.
        let counter = ran.clone();
        c.execute_with_coordination("job_b", JobOptions::default().depends_on("job_a"), |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // A fails: B must not run.
        let failed: Result<()> = c
            .execute_with_coordination("job_a", JobOptions::default().with_retries(0), |_ctx| async {
                Err(KeeperError::Validation("bad input".to_string()))
            })
            .await;
        assert!(failed.is_err());

        let counter = ran.clone();
        let gated = c
            .execute_with_coordination("job_b", JobOptions::default().depends_on("job_a"), |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(gated, Err(KeeperError::DependencyUnmet { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // A completes: B runs again.
        c.execute_with_coordination("job_a", JobOptions::default(), |_ctx| async { Ok(()) })
            .await
            .unwrap();
        let counter = ran.clone();
        c.execute_with_coordination("job_b", JobOptions::default().depends_on("job_a"), |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retriable_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(&store, "host-a:1");
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let value = c
            .execute_with_coordination("flaky", JobOptions::default(), |ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt < 3 {
                        Err(KeeperError::TransientRpc("503".to_string()))
                    } else {
                        Ok(ctx.attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let statuses: Vec<ExecutionStatus> =
            store.executions_for("flaky").await.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![ExecutionStatus::Failed, ExecutionStatus::Failed, ExecutionStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_invariant_violation_alerts_without_retry() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(&store, "host-a:1");
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let res: Result<()> = c
            .execute_with_coordination("resolver", JobOptions::default(), |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(KeeperError::IncompleteResults { cycle_id: 4, missing: 1 })
                }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "invariant_violation");
        assert!(!c.is_locked("resolver").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_cancels_job() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(&store, "host-a:1");

        let res: Result<()> = c
            .execute_with_coordination(
                "slow",
                JobOptions::default().with_ttl(Duration::from_millis(30)),
                |_ctx| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
            )
            .await;
        assert!(matches!(res, Err(KeeperError::Timeout { .. })));
        let log = store.executions_for("slow").await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, ExecutionStatus::Timeout);
        assert!(!c.is_locked("slow").await.unwrap());
    }

    #[tokio::test]
    async fn test_force_release() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(&store, "host-a:1");
        c.acquire_lock("stuck", Duration::from_secs(60), serde_json::json!({})).await.unwrap();

        assert!(c.force_release_lock("stuck").await.unwrap());
        assert!(!c.is_locked("stuck").await.unwrap());
        assert_eq!(
            store.executions_for("stuck").await[0].status,
            ExecutionStatus::ForceReleased
        );
        assert!(!c.force_release_lock("stuck").await.unwrap());
    }

    #[test]
    fn test_backoff_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(&store, "host-a:1");
        let first = c.backoff_delay(1);
        assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(20));
        let third = c.backoff_delay(3);
        assert!(third >= Duration::from_millis(40));
        assert_eq!(c.backoff_delay(30), Duration::from_secs(1));
    }

    #[test]
    fn test_runner_identity_format() {
        let id = runner_identity();
        assert_eq!(id.split(':').count(), 2);
    }
}
