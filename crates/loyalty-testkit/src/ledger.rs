use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};

use loyalty_db::{
    check_login, check_update_target, check_withdrawal_sum, ClaimRequest, LedgerStore,
    RegisterOutcome, SubmitOutcome, TaskUpdate, WithdrawalOutcome,
};
use loyalty_schemas::{
    Balance, ClientId, Order, OrderId, OrderNumber, OrderStatus, Points, PointsError, Task,
    Withdrawal,
};

/// One verdict write the store applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedWrite {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub accrual: Option<Points>,
}

#[derive(Default)]
struct Inner {
    logins: HashMap<String, ClientId>,
    orders: BTreeMap<OrderId, Order>,
    withdrawals: Vec<Withdrawal>,
    next_client: i64,
    next_order: i64,
    next_withdrawal: i64,
    writes: Vec<AppliedWrite>,
    claims: Vec<ClaimRequest>,
    fail_claims: u32,
    fail_updates: u32,
    fail_withdrawals: u32,
}

impl Inner {
    fn knows_client(&self, client_id: ClientId) -> bool {
        self.logins.values().any(|id| *id == client_id)
    }

    fn insert_order(
        &mut self,
        client_id: ClientId,
        order_number: &str,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Order {
        self.next_order += 1;
        let order_id = self.next_order;
        let order = Order {
            order_id,
            client_id,
            order_number: order_number.to_string(),
            status,
            accrual,
            uploaded_at: Utc::now() + ChronoDuration::microseconds(order_id),
        };
        self.orders.insert(order_id, order.clone());
        order
    }
}

/// In-memory [`LedgerStore`] with the same guarantees as the Postgres one.
///
/// Claims and verdict writes are atomic under one mutex. Withdrawals take a
/// per-client async lock (the stand-in for `SELECT ... FOR UPDATE` on the
/// client row) and yield between reading the balance and inserting, so an
/// implementation without that lock would be caught double-spending.
///
/// Failure injection (`fail_next_claims`, `fail_next_updates`,
/// `fail_next_withdrawals`) lets tests drive the error paths.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<Inner>,
    client_locks: Mutex<HashMap<ClientId, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client_lock(&self, client_id: ClientId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.client_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(client_id).or_default().clone()
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Create a client and return its id. Panics on a duplicate login.
    pub fn seed_client(&self, login: &str) -> ClientId {
        let mut g = self.lock();
        assert!(!g.logins.contains_key(login), "duplicate login {login}");
        g.next_client += 1;
        let id = g.next_client;
        g.logins.insert(login.to_string(), id);
        id
    }

    /// Insert an order directly in `status` (bypasses submission rules).
    pub fn seed_order(
        &self,
        client_id: ClientId,
        order_number: &str,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> OrderId {
        self.lock()
            .insert_order(client_id, order_number, status, accrual)
            .order_id
    }

    /// Credit `points` to a client through a PROCESSED order.
    pub fn seed_accrual(&self, client_id: ClientId, order_number: &str, points: Points) -> OrderId {
        self.seed_order(client_id, order_number, OrderStatus::Processed, Some(points))
    }

    // -----------------------------------------------------------------------
    // Failure injection
    // -----------------------------------------------------------------------

    pub fn fail_next_claims(&self, n: u32) {
        self.lock().fail_claims = n;
    }

    pub fn fail_next_updates(&self, n: u32) {
        self.lock().fail_updates = n;
    }

    pub fn fail_next_withdrawals(&self, n: u32) {
        self.lock().fail_withdrawals = n;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.lock().orders.get(&order_id).cloned()
    }

    /// Every applied verdict write, in order.
    pub fn writes(&self) -> Vec<AppliedWrite> {
        self.lock().writes.clone()
    }

    pub fn writes_for(&self, order_id: OrderId) -> Vec<AppliedWrite> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.order_id == order_id)
            .copied()
            .collect()
    }

    /// Every claim request received, including failed ones.
    pub fn claims(&self) -> Vec<ClaimRequest> {
        self.lock().claims.clone()
    }

    fn balance_of(g: &Inner, client_id: ClientId) -> Result<Balance> {
        let accrued = Points::checked_sum(
            g.orders
                .values()
                .filter(|o| o.client_id == client_id && o.status == OrderStatus::Processed)
                .filter_map(|o| o.accrual),
        )
        .with_context(|| format!("accrued total for client_id {client_id}"))?;
        let withdrawn = Points::checked_sum(
            g.withdrawals
                .iter()
                .filter(|w| w.client_id == client_id)
                .map(|w| w.sum),
        )
        .with_context(|| format!("withdrawn total for client_id {client_id}"))?;
        Balance::from_totals(accrued, withdrawn)
            .with_context(|| format!("balance for client_id {client_id}"))
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedger {
    async fn claim_tasks(&self, req: &ClaimRequest) -> Result<Vec<Task>> {
        let mut g = self.lock();
        g.claims.push(req.clone());
        if g.fail_claims > 0 {
            g.fail_claims -= 1;
            bail!("injected claim failure");
        }

        let mut picked: Vec<&Order> = g
            .orders
            .values()
            .filter(|o| req.statuses.contains(&o.status) && !req.exclude.contains(&o.order_id))
            .collect();
        picked.sort_by_key(|o| (o.uploaded_at, o.order_id));
        let ids: Vec<OrderId> = picked
            .iter()
            .take(req.limit.unwrap_or(usize::MAX))
            .map(|o| o.order_id)
            .collect();

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(o) = g.orders.get_mut(&id) else {
                continue;
            };
            if o.status == OrderStatus::New {
                o.status = OrderStatus::Processing;
            }
            tasks.push(Task {
                order_id: o.order_id,
                order_number: o.order_number.clone(),
                status: o.status,
                accrual: o.accrual,
            });
        }
        Ok(tasks)
    }

    async fn update_task(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Result<TaskUpdate> {
        check_update_target(status, accrual)?;
        let mut g = self.lock();
        if g.fail_updates > 0 {
            g.fail_updates -= 1;
            bail!("injected update failure");
        }
        let o = g
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| anyhow!("update_task: order_id {order_id} not found"))?;
        if !o.status.can_advance_to(status) {
            return Ok(TaskUpdate::AlreadyFinal);
        }
        o.status = status;
        o.accrual = accrual;
        g.writes.push(AppliedWrite {
            order_id,
            status,
            accrual,
        });
        Ok(TaskUpdate::Applied)
    }

    async fn begin_withdrawal(
        &self,
        client_id: ClientId,
        order_number: &OrderNumber,
        sum: Points,
    ) -> Result<WithdrawalOutcome> {
        check_withdrawal_sum(sum)?;
        {
            let mut g = self.lock();
            if g.fail_withdrawals > 0 {
                g.fail_withdrawals -= 1;
                bail!("injected withdrawal failure");
            }
            if !g.knows_client(client_id) {
                return Ok(WithdrawalOutcome::UnknownClient);
            }
        }

        let client_lock = self.client_lock(client_id);
        let _held = client_lock.lock().await;

        let available = Self::balance_of(&self.lock(), client_id)?.current;
        // Widen the read/insert window so racing withdrawals interleave here.
        tokio::task::yield_now().await;

        let remaining = available
            .checked_sub(sum)
            .ok_or(PointsError::OutOfRange)
            .context("begin_withdrawal remaining balance")?;
        if remaining.is_negative() {
            return Ok(WithdrawalOutcome::InsufficientFunds {
                available,
                requested: sum,
            });
        }

        let mut g = self.lock();
        g.next_withdrawal += 1;
        let w = Withdrawal {
            withdrawal_id: g.next_withdrawal,
            client_id,
            order_number: order_number.as_str().to_string(),
            sum,
            processed_at: Utc::now(),
        };
        g.withdrawals.push(w.clone());
        Ok(WithdrawalOutcome::Committed(w))
    }

    async fn get_balance(&self, client_id: ClientId) -> Result<Balance> {
        Self::balance_of(&self.lock(), client_id)
    }

    async fn register_client(&self, login: &str) -> Result<RegisterOutcome> {
        check_login(login)?;
        let mut g = self.lock();
        if g.logins.contains_key(login) {
            return Ok(RegisterOutcome::LoginTaken);
        }
        g.next_client += 1;
        let id = g.next_client;
        g.logins.insert(login.to_string(), id);
        Ok(RegisterOutcome::Registered(id))
    }

    async fn submit_order(
        &self,
        client_id: ClientId,
        order_number: &OrderNumber,
    ) -> Result<SubmitOutcome> {
        let mut g = self.lock();
        if !g.knows_client(client_id) {
            return Ok(SubmitOutcome::UnknownClient);
        }
        if let Some(o) = g
            .orders
            .values()
            .find(|o| o.order_number == order_number.as_str())
        {
            return Ok(if o.client_id == client_id {
                SubmitOutcome::AlreadyUploadedBySelf
            } else {
                SubmitOutcome::AlreadyUploadedByOther
            });
        }
        let order = g.insert_order(client_id, order_number.as_str(), OrderStatus::New, None);
        Ok(SubmitOutcome::Accepted(order))
    }

    async fn list_orders(&self, client_id: ClientId) -> Result<Vec<Order>> {
        let g = self.lock();
        let mut out: Vec<Order> = g
            .orders
            .values()
            .filter(|o| o.client_id == client_id)
            .cloned()
            .collect();
        out.sort_by_key(|o| (o.uploaded_at, o.order_id));
        Ok(out)
    }

    async fn list_withdrawals(&self, client_id: ClientId) -> Result<Vec<Withdrawal>> {
        let g = self.lock();
        Ok(g.withdrawals
            .iter()
            .filter(|w| w.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
