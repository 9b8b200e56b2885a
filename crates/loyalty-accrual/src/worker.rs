//! Per-order reconciliation loop.
//!
//! A worker owns exactly one order from claim until a terminal verdict is
//! persisted. It never gives up on its own: oracle failures and store write
//! failures are retried forever; only a terminal verdict, an already-final
//! row, or cancellation ends the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use loyalty_config::AccrualSettings;
use loyalty_db::{LedgerStore, TaskUpdate};
use loyalty_schemas::{OrderId, Task, Verdict};

use crate::oracle::{AccrualOracle, OracleError};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after transport errors, non-success statuses, write failures,
    /// and between polls of a non-terminal verdict.
    pub retry_backoff: Duration,
    /// Wait after a 200 whose body could not be decoded.
    pub decode_backoff: Duration,
    /// Ceiling applied to an oracle `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(2),
            decode_backoff: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(s: &AccrualSettings) -> Self {
        Self {
            retry_backoff: s.retry_backoff(),
            decode_backoff: s.decode_backoff(),
            max_retry_after: s.max_retry_after(),
        }
    }

    /// How long to wait before re-polling after `err`.
    pub fn delay_for(&self, err: &OracleError) -> Duration {
        match err {
            OracleError::Status {
                retry_after: Some(d),
                ..
            } => (*d).min(self.max_retry_after),
            OracleError::Decode(_) => self.decode_backoff,
            _ => self.retry_backoff,
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A terminal verdict is persisted.
    Terminal(Verdict),
    /// The store reported the order already final; this worker wrote nothing
    /// terminal itself.
    AlreadyFinal,
    /// Shutdown cancelled the worker before a terminal verdict. The order
    /// stays non-terminal and is picked up by the next recovery claim.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub order_id: OrderId,
    pub exit: WorkerExit,
    /// Oracle requests issued.
    pub polls: u64,
    /// Verdict writes the store applied.
    pub writes: u64,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct OrderWorker {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn AccrualOracle>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl OrderWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn AccrualOracle>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            oracle,
            policy,
            cancel,
        }
    }

    /// Poll the oracle for `task` until it is terminal or cancelled.
    pub async fn run(&self, task: Task) -> WorkerReport {
        let mut report = WorkerReport {
            order_id: task.order_id,
            exit: WorkerExit::Cancelled,
            polls: 0,
            writes: 0,
        };
        // Last value known to be persisted.
        let mut last = task.verdict();

        tracing::debug!(
            order_id = task.order_id,
            order_number = %task.order_number,
            status = %task.status,
            "worker started"
        );

        loop {
            report.polls += 1;
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(report),
                r = self.oracle.fetch_verdict(&task.order_number) => r,
            };

            let delay = match polled {
                Err(err) => {
                    tracing::warn!(
                        order_id = task.order_id,
                        order_number = %task.order_number,
                        error = %err,
                        "accrual poll failed"
                    );
                    self.policy.delay_for(&err)
                }
                Ok(verdict) if verdict == last => {
                    if verdict.is_terminal() {
                        report.exit = WorkerExit::Terminal(verdict);
                        return report;
                    }
                    tracing::debug!(
                        order_id = task.order_id,
                        status = %verdict.status,
                        "verdict unchanged"
                    );
                    self.policy.retry_backoff
                }
                Ok(verdict) => {
                    match self
                        .store
                        .update_task(task.order_id, verdict.status, verdict.accrual)
                        .await
                    {
                        Ok(TaskUpdate::Applied) => {
                            report.writes += 1;
                            last = verdict;
                            tracing::info!(
                                order_id = task.order_id,
                                order_number = %task.order_number,
                                status = %verdict.status,
                                accrual = ?verdict.accrual.map(|a| a.to_string()),
                                "verdict persisted"
                            );
                            if verdict.is_terminal() {
                                report.exit = WorkerExit::Terminal(verdict);
                                return report;
                            }
                            self.policy.retry_backoff
                        }
                        Ok(TaskUpdate::AlreadyFinal) => {
                            tracing::info!(
                                order_id = task.order_id,
                                "order already final; worker exiting"
                            );
                            report.exit = WorkerExit::AlreadyFinal;
                            return report;
                        }
                        Err(err) => {
                            tracing::warn!(
                                order_id = task.order_id,
                                status = %verdict.status,
                                error = ?err,
                                "verdict write failed"
                            );
                            self.policy.retry_backoff
                        }
                    }
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(report),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self, mut report: WorkerReport) -> WorkerReport {
        tracing::info!(
            order_id = report.order_id,
            polls = report.polls,
            "worker cancelled"
        );
        report.exit = WorkerExit::Cancelled;
        report
    }
}
