//! The ledger store seam shared by the reconciliation engine and the API.
//!
//! [`PgLedger`](crate::PgLedger) is the production implementation; tests use
//! the in-memory store in `loyalty-testkit`. Both must honour the same
//! contract, so the argument checks that do not need the database live here.

use anyhow::{bail, Result};
use async_trait::async_trait;

use loyalty_schemas::{
    Balance, ClientId, Order, OrderId, OrderNumber, OrderStatus, Points, Task, Withdrawal,
};

// ---------------------------------------------------------------------------
// Request / outcome types
// ---------------------------------------------------------------------------

/// Which orders a claim should pick up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Orders whose status is in this set are candidates.
    pub statuses: Vec<OrderStatus>,
    /// Upper bound on the number of claimed rows. `None` = unbounded.
    pub limit: Option<usize>,
    /// Order ids the caller already has workers for.
    pub exclude: Vec<OrderId>,
}

impl ClaimRequest {
    /// Steady-state claim: freshly submitted orders only.
    pub fn new_orders() -> Self {
        Self {
            statuses: vec![OrderStatus::New],
            limit: None,
            exclude: Vec::new(),
        }
    }

    /// Startup claim: everything that has not reached a terminal verdict.
    pub fn recovery() -> Self {
        Self {
            statuses: OrderStatus::RECOVERABLE.to_vec(),
            limit: None,
            exclude: Vec::new(),
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = OrderId>) -> Self {
        self.exclude = ids.into_iter().collect();
        self
    }
}

/// Result of writing a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskUpdate {
    /// The row now carries the written status/accrual.
    Applied,
    /// The order was already PROCESSED or INVALID; nothing was written.
    AlreadyFinal,
}

/// Result of a withdrawal attempt. Insufficient funds is a business outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalOutcome {
    Committed(Withdrawal),
    InsufficientFunds { available: Points, requested: Points },
    /// No client with this id; nothing was written.
    UnknownClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(ClientId),
    LoginTaken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new order row was created with status NEW.
    Accepted(Order),
    /// The same client already submitted this number. No-op.
    AlreadyUploadedBySelf,
    /// Another client owns this number.
    AlreadyUploadedByOther,
    /// No client with this id; nothing was written.
    UnknownClient,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Transactional persistence for orders, withdrawals, and reconciliation
/// tasks.
///
/// Guarantees every implementation must provide:
/// - `claim_tasks` never hands the same row to two concurrent callers, and
///   only flips the rows it returned from NEW to PROCESSING.
/// - `update_task` never modifies a PROCESSED/INVALID row and never writes NEW.
/// - `begin_withdrawal` serializes per client and commits only when the
///   recomputed balance covers the sum.
/// - `submit_order` and `begin_withdrawal` answer `UnknownClient` for a
///   client id that was never registered.
/// - Balance aggregates that overflow the points range are errors, never a
///   wrapped value.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn claim_tasks(&self, req: &ClaimRequest) -> Result<Vec<Task>>;

    async fn update_task(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Result<TaskUpdate>;

    async fn begin_withdrawal(
        &self,
        client_id: ClientId,
        order_number: &OrderNumber,
        sum: Points,
    ) -> Result<WithdrawalOutcome>;

    async fn get_balance(&self, client_id: ClientId) -> Result<Balance>;

    async fn register_client(&self, login: &str) -> Result<RegisterOutcome>;

    async fn submit_order(
        &self,
        client_id: ClientId,
        order_number: &OrderNumber,
    ) -> Result<SubmitOutcome>;

    async fn list_orders(&self, client_id: ClientId) -> Result<Vec<Order>>;

    async fn list_withdrawals(&self, client_id: ClientId) -> Result<Vec<Withdrawal>>;

    /// Connectivity check.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Argument checks shared by implementations
// ---------------------------------------------------------------------------

/// Reject verdict writes that can never be legal regardless of row state.
pub fn check_update_target(status: OrderStatus, accrual: Option<Points>) -> Result<()> {
    if status == OrderStatus::New {
        bail!("update_task: status NEW cannot be written");
    }
    if let Some(a) = accrual {
        if a.is_negative() {
            bail!("update_task: negative accrual {a}");
        }
    }
    Ok(())
}

pub fn check_withdrawal_sum(sum: Points) -> Result<()> {
    if !sum.is_positive() {
        bail!("begin_withdrawal: sum must be > 0 (got {sum})");
    }
    Ok(())
}

pub fn check_login(login: &str) -> Result<()> {
    if login.trim().is_empty() {
        bail!("register_client: login must be non-empty");
    }
    Ok(())
}
