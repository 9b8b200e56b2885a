//! Claim scheduler: periodic discovery of orders awaiting a verdict.
//!
//! One tick = one claim transaction + one spawned worker per claimed order.
//! Ticks run inline in the scheduler loop, so they never overlap. The first
//! tick after start is a recovery tick (NEW, REGISTERED, PROCESSING); later
//! ticks claim NEW only, since non-NEW rows are owned by live workers. A
//! worker that dies outside shutdown puts the scheduler back into recovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use loyalty_config::AccrualSettings;
use loyalty_db::{ClaimRequest, LedgerStore};
use loyalty_schemas::OrderId;

use crate::oracle::AccrualOracle;
use crate::worker::{OrderWorker, RetryPolicy, WorkerExit, WorkerReport};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub claim_interval: Duration,
    /// Cap on concurrently live workers. `None` = unbounded.
    pub max_workers: Option<usize>,
    /// How long shutdown waits for workers before cancelling them.
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl SchedulerConfig {
    pub fn from_settings(s: &AccrualSettings) -> Self {
        Self {
            claim_interval: s.claim_interval(),
            max_workers: s.max_workers,
            shutdown_grace: s.shutdown_grace(),
            retry: RetryPolicy::from_settings(s),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_settings(&AccrualSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub claim_failures: u64,
    /// Rows returned by claims.
    pub claimed: u64,
    pub spawned: u64,
    pub completed: u64,
    /// Workers that ended by cancellation or panic, leaving the order for
    /// a recovery claim.
    pub abandoned: u64,
    pub active_workers: usize,
    /// True until a recovery tick has claimed every recoverable order, and
    /// again after a worker is lost outside shutdown.
    pub recovery_pending: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Shared read handle onto the scheduler's stats.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Arc<RwLock<SchedulerStats>>);

impl StatsHandle {
    pub async fn snapshot(&self) -> SchedulerStats {
        self.0.read().await.clone()
    }

    async fn update(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut g = self.0.write().await;
        f(&mut g);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct ClaimScheduler {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn AccrualOracle>,
    cfg: SchedulerConfig,
    stats: StatsHandle,
    workers: JoinSet<WorkerReport>,
    /// Orders with a live worker.
    in_progress: HashSet<OrderId>,
    /// tokio task id -> order it is reconciling.
    task_orders: HashMap<tokio::task::Id, OrderId>,
    recovery_pending: bool,
    completed: u64,
    abandoned: u64,
    /// Cancelled only after the shutdown grace period.
    worker_cancel: CancellationToken,
}

impl ClaimScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn AccrualOracle>,
        cfg: SchedulerConfig,
    ) -> Self {
        let stats = StatsHandle(Arc::new(RwLock::new(SchedulerStats {
            recovery_pending: true,
            ..SchedulerStats::default()
        })));
        Self {
            store,
            oracle,
            cfg,
            stats,
            workers: JoinSet::new(),
            in_progress: HashSet::new(),
            task_orders: HashMap::new(),
            recovery_pending: true,
            completed: 0,
            abandoned: 0,
            worker_cancel: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Number of orders with a live worker.
    pub fn active_workers(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_recovery_pending(&self) -> bool {
        self.recovery_pending
    }

    /// Run one claim cycle. Returns the number of workers spawned.
    ///
    /// On claim failure nothing is spawned and the error is returned; a
    /// failed recovery tick leaves the next tick in recovery mode.
    pub async fn tick(&mut self) -> Result<usize> {
        self.reap_finished();

        let recovery = self.recovery_pending;
        let limit = self
            .cfg
            .max_workers
            .map(|max| max.saturating_sub(self.in_progress.len()));

        let now = Utc::now();
        self.stats
            .update(|s| {
                s.ticks += 1;
                s.last_tick_at = Some(now);
            })
            .await;

        if limit == Some(0) {
            tracing::debug!(
                active = self.in_progress.len(),
                "worker limit reached; skipping claim"
            );
            self.publish_gauges().await;
            return Ok(0);
        }

        let base = if recovery {
            ClaimRequest::recovery()
        } else {
            ClaimRequest::new_orders()
        };
        let req = base
            .with_limit(limit)
            .excluding(self.in_progress.iter().copied());

        let tasks = match self.store.claim_tasks(&req).await {
            Ok(t) => t,
            Err(err) => {
                tracing::warn!(recovery, error = ?err, "claim failed; retrying next tick");
                self.stats.update(|s| s.claim_failures += 1).await;
                return Err(err);
            }
        };

        let claimed = tasks.len();
        if recovery && limit.map_or(true, |l| claimed < l) {
            self.recovery_pending = false;
            tracing::info!(claimed, "recovery claim complete");
        }

        let mut spawned = 0usize;
        for task in tasks {
            if !self.in_progress.insert(task.order_id) {
                tracing::debug!(order_id = task.order_id, "worker already live; not respawning");
                continue;
            }
            let order_id = task.order_id;
            let worker = OrderWorker::new(
                self.store.clone(),
                self.oracle.clone(),
                self.cfg.retry.clone(),
                self.worker_cancel.clone(),
            );
            let handle = self.workers.spawn(async move { worker.run(task).await });
            self.task_orders.insert(handle.id(), order_id);
            spawned += 1;
        }

        if claimed > 0 {
            tracing::info!(claimed, spawned, recovery, "claim tick");
        }
        self.stats
            .update(|s| {
                s.claimed += claimed as u64;
                s.spawned += spawned as u64;
            })
            .await;
        self.publish_gauges().await;
        Ok(spawned)
    }

    /// Tick every `claim_interval` until `shutdown` fires, then drain workers.
    pub async fn run(mut self, shutdown: CancellationToken) -> SchedulerStats {
        let mut ticker = tokio::time::interval(self.cfg.claim_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.cfg.claim_interval.as_millis() as u64,
            max_workers = ?self.cfg.max_workers,
            "claim scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // Failures are logged and counted inside tick().
                    let _ = self.tick().await;
                }
            }
        }

        self.shutdown().await;
        self.stats.snapshot().await
    }

    /// Wait up to `shutdown_grace` for live workers, then cancel the rest
    /// and wait for them to observe it.
    pub async fn shutdown(&mut self) {
        tracing::info!(
            active = self.in_progress.len(),
            grace_ms = self.cfg.shutdown_grace.as_millis() as u64,
            "claim scheduler stopping"
        );

        let deadline = tokio::time::sleep(self.cfg.shutdown_grace);
        tokio::pin!(deadline);

        while !self.workers.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(
                        remaining = self.workers.len(),
                        "shutdown grace elapsed; cancelling workers"
                    );
                    self.worker_cancel.cancel();
                    break;
                }
                joined = self.workers.join_next_with_id() => {
                    if let Some(res) = joined {
                        self.on_joined(res);
                    }
                }
            }
        }

        while let Some(res) = self.workers.join_next_with_id().await {
            self.on_joined(res);
        }
        self.publish_gauges().await;
        tracing::info!("claim scheduler stopped");
    }

    fn reap_finished(&mut self) {
        while let Some(res) = self.workers.try_join_next_with_id() {
            self.on_joined(res);
        }
    }

    fn on_joined(&mut self, res: Result<(tokio::task::Id, WorkerReport), JoinError>) {
        let (task_id, outcome) = match res {
            Ok((id, report)) => (id, Ok(report)),
            Err(err) => (err.id(), Err(err)),
        };
        let Some(order_id) = self.task_orders.remove(&task_id) else {
            return;
        };
        self.in_progress.remove(&order_id);

        let finished = match outcome {
            Ok(report) => {
                tracing::debug!(
                    order_id,
                    polls = report.polls,
                    writes = report.writes,
                    exit = ?report.exit,
                    "worker finished"
                );
                !matches!(report.exit, WorkerExit::Cancelled)
            }
            Err(err) => {
                tracing::warn!(order_id, error = %err, "worker task failed");
                false
            }
        };

        if finished {
            self.completed += 1;
            return;
        }
        self.abandoned += 1;

        // Outside shutdown the order is still non-terminal with no worker;
        // only a recovery claim (which excludes live ids) picks it up again.
        if !self.worker_cancel.is_cancelled() {
            tracing::warn!(order_id, "worker lost; next tick runs a recovery claim");
            self.recovery_pending = true;
        }
    }

    async fn publish_gauges(&self) {
        let active = self.in_progress.len();
        let recovery_pending = self.recovery_pending;
        let (completed, abandoned) = (self.completed, self.abandoned);
        self.stats
            .update(|s| {
                s.active_workers = active;
                s.recovery_pending = recovery_pending;
                s.completed = completed;
                s.abandoned = abandoned;
            })
            .await;
    }
}
