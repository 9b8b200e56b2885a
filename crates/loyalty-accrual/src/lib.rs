//! loyalty-accrual
//!
//! The reconciliation engine: the oracle client, the per-order worker, and
//! the claim scheduler that feeds workers from the ledger store.

pub mod oracle;
pub mod scheduler;
pub mod worker;

pub use oracle::{decode_verdict, AccrualOracle, HttpAccrualClient, OracleError};
pub use scheduler::{ClaimScheduler, SchedulerConfig, SchedulerStats, StatsHandle};
pub use worker::{OrderWorker, RetryPolicy, WorkerExit, WorkerReport};
