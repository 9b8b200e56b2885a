//! Shared runtime state for loyalty-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The ledger store is the
//! only mutable resource and is shared with the reconciliation engine.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use loyalty_accrual::{ClaimScheduler, SchedulerStats, StatsHandle};
use loyalty_db::LedgerStore;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    pub ledger: Arc<dyn LedgerStore>,
    /// Present when this process runs the claim scheduler.
    pub scheduler_stats: Option<StatsHandle>,
    pub config_hash: Option<String>,
}

impl AppState {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            build: BuildInfo {
                service: "loyalty-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            ledger,
            scheduler_stats: None,
            config_hash: None,
        }
    }

    pub fn with_scheduler_stats(mut self, stats: StatsHandle) -> Self {
        self.scheduler_stats = Some(stats);
        self
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Run the claim scheduler on its own task until `shutdown` fires.
///
/// The handle resolves once every worker has finished or been cancelled.
pub fn spawn_claim_scheduler(
    scheduler: ClaimScheduler,
    shutdown: CancellationToken,
) -> JoinHandle<SchedulerStats> {
    tokio::spawn(scheduler.run(shutdown))
}
