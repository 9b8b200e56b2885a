//! Postgres implementation of [`LedgerStore`].
//!
//! Every operation is also exposed as a free function over `&PgPool` so
//! tooling and tests can call it without going through the trait object.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use loyalty_schemas::{
    Balance, ClientId, Order, OrderId, OrderNumber, OrderStatus, Points, PointsError, Task,
    Withdrawal,
};

use crate::store::{
    check_login, check_update_target, check_withdrawal_sum, ClaimRequest, LedgerStore,
    RegisterOutcome, SubmitOutcome, TaskUpdate, WithdrawalOutcome,
};

/// [`LedgerStore`] backed by a Postgres pool.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn claim_tasks(&self, req: &ClaimRequest) -> Result<Vec<Task>> {
        claim_tasks(&self.pool, req).await
    }

    async fn update_task(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Result<TaskUpdate> {
        update_task(&self.pool, order_id, status, accrual).await
    }

    async fn begin_withdrawal(
        &self,
        client_id: ClientId,
        order_number: &OrderNumber,
        sum: Points,
    ) -> Result<WithdrawalOutcome> {
        begin_withdrawal(&self.pool, client_id, order_number, sum).await
    }

    async fn get_balance(&self, client_id: ClientId) -> Result<Balance> {
        get_balance(&self.pool, client_id).await
    }

    async fn register_client(&self, login: &str) -> Result<RegisterOutcome> {
        register_client(&self.pool, login).await
    }

    async fn submit_order(
        &self,
        client_id: ClientId,
        order_number: &OrderNumber,
    ) -> Result<SubmitOutcome> {
        submit_order(&self.pool, client_id, order_number).await
    }

    async fn list_orders(&self, client_id: ClientId) -> Result<Vec<Order>> {
        list_orders(&self.pool, client_id).await
    }

    async fn list_withdrawals(&self, client_id: ClientId) -> Result<Vec<Withdrawal>> {
        list_withdrawals(&self.pool, client_id).await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .context("ping failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconciliation tasks
// ---------------------------------------------------------------------------

/// Claim orders for reconciliation in one transaction.
///
/// Candidate rows are locked with `FOR UPDATE SKIP LOCKED`, so a concurrent
/// claimer never sees them. Only the returned NEW rows are flipped to
/// PROCESSING; REGISTERED/PROCESSING rows keep their status and are handed
/// out as-is (startup recovery).
pub async fn claim_tasks(pool: &PgPool, req: &ClaimRequest) -> Result<Vec<Task>> {
    if req.statuses.is_empty() || req.limit == Some(0) {
        return Ok(Vec::new());
    }

    let statuses: Vec<String> = req
        .statuses
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    let limit: Option<i64> = req.limit.map(|n| n as i64);

    let mut tx = pool.begin().await.context("claim_tasks begin failed")?;

    let rows = sqlx::query(
        r#"
        select order_id, order_number, status, accrual
        from orders
        where status = any($1)
          and not (order_id = any($2))
        order by uploaded_at asc, order_id asc
        limit $3
        for update skip locked
        "#,
    )
    .bind(&statuses)
    .bind(&req.exclude)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await
    .context("claim_tasks select failed")?;

    let mut tasks = Vec::with_capacity(rows.len());
    for row in &rows {
        tasks.push(task_from_row(row)?);
    }

    let fresh: Vec<OrderId> = tasks
        .iter()
        .filter(|t| t.status == OrderStatus::New)
        .map(|t| t.order_id)
        .collect();

    if !fresh.is_empty() {
        sqlx::query(
            r#"
            update orders
               set status = 'PROCESSING'
             where order_id = any($1)
               and status = 'NEW'
            "#,
        )
        .bind(&fresh)
        .execute(&mut *tx)
        .await
        .context("claim_tasks flip failed")?;

        for t in tasks.iter_mut().filter(|t| t.status == OrderStatus::New) {
            t.status = OrderStatus::Processing;
        }
    }

    tx.commit().await.context("claim_tasks commit failed")?;

    tracing::debug!(
        claimed = tasks.len(),
        flipped = fresh.len(),
        "claim_tasks committed"
    );
    Ok(tasks)
}

/// Persist a verdict. A terminal row is never modified.
pub async fn update_task(
    pool: &PgPool,
    order_id: OrderId,
    status: OrderStatus,
    accrual: Option<Points>,
) -> Result<TaskUpdate> {
    check_update_target(status, accrual)?;

    let res = sqlx::query(
        r#"
        update orders
           set status = $2,
               accrual = $3
         where order_id = $1
           and status not in ('PROCESSED','INVALID')
        "#,
    )
    .bind(order_id)
    .bind(status.as_str())
    .bind(accrual.map(Points::raw))
    .execute(pool)
    .await
    .context("update_task failed")?;

    if res.rows_affected() == 1 {
        return Ok(TaskUpdate::Applied);
    }

    // Zero rows: either the order is final or it does not exist.
    let current: Option<(String,)> =
        sqlx::query_as::<_, (String,)>("select status from orders where order_id = $1")
            .bind(order_id)
            .fetch_optional(pool)
            .await
            .context("update_task status lookup failed")?;

    match current {
        Some(_) => Ok(TaskUpdate::AlreadyFinal),
        None => Err(anyhow!("update_task: order_id {order_id} not found")),
    }
}

// ---------------------------------------------------------------------------
// Balance ledger
// ---------------------------------------------------------------------------

/// Record a withdrawal iff the client's recomputed balance covers `sum`.
///
/// The client row lock serializes concurrent withdrawals for one client; the
/// balance is read after the lock, inside the same transaction as the insert.
pub async fn begin_withdrawal(
    pool: &PgPool,
    client_id: ClientId,
    order_number: &OrderNumber,
    sum: Points,
) -> Result<WithdrawalOutcome> {
    check_withdrawal_sum(sum)?;

    let mut tx = pool.begin().await.context("begin_withdrawal begin failed")?;

    let locked: Option<(i64,)> =
        sqlx::query_as::<_, (i64,)>("select client_id from clients where client_id = $1 for update")
            .bind(client_id)
            .fetch_optional(&mut *tx)
            .await
            .context("begin_withdrawal lock failed")?;
    if locked.is_none() {
        tx.rollback()
            .await
            .context("begin_withdrawal rollback failed")?;
        return Ok(WithdrawalOutcome::UnknownClient);
    }

    let balance = balance_in_tx(&mut tx, client_id).await?;

    let remaining = balance
        .current
        .checked_sub(sum)
        .ok_or(PointsError::OutOfRange)
        .context("begin_withdrawal remaining balance")?;
    if remaining.is_negative() {
        tx.rollback()
            .await
            .context("begin_withdrawal rollback failed")?;
        return Ok(WithdrawalOutcome::InsufficientFunds {
            available: balance.current,
            requested: sum,
        });
    }

    let row = sqlx::query(
        r#"
        insert into withdrawals (client_id, order_number, amount)
        values ($1, $2, $3)
        returning withdrawal_id, processed_at
        "#,
    )
    .bind(client_id)
    .bind(order_number.as_str())
    .bind(sum.raw())
    .fetch_one(&mut *tx)
    .await
    .context("begin_withdrawal insert failed")?;

    let withdrawal = Withdrawal {
        withdrawal_id: row.try_get("withdrawal_id")?,
        client_id,
        order_number: order_number.as_str().to_string(),
        sum,
        processed_at: row.try_get("processed_at")?,
    };

    tx.commit().await.context("begin_withdrawal commit failed")?;
    Ok(WithdrawalOutcome::Committed(withdrawal))
}

/// `{current, withdrawn}` for a client. Unknown clients read as zero.
pub async fn get_balance(pool: &PgPool, client_id: ClientId) -> Result<Balance> {
    let mut tx = pool.begin().await.context("get_balance begin failed")?;
    let balance = balance_in_tx(&mut tx, client_id).await?;
    tx.commit().await.context("get_balance commit failed")?;
    Ok(balance)
}

async fn balance_in_tx(tx: &mut Transaction<'_, Postgres>, client_id: ClientId) -> Result<Balance> {
    // Totals are read as numeric text; a sum beyond i64 surfaces as
    // PointsError::OutOfRange instead of a bigint cast error.
    let (accrued, withdrawn): (String, String) = sqlx::query_as::<_, (String, String)>(
        r#"
        select
          coalesce((select sum(accrual) from orders
                     where client_id = $1 and status = 'PROCESSED'), 0)::text,
          coalesce((select sum(amount) from withdrawals
                     where client_id = $1), 0)::text
        "#,
    )
    .bind(client_id)
    .fetch_one(&mut **tx)
    .await
    .context("balance aggregate failed")?;

    let accrued = parse_total(&accrued)
        .with_context(|| format!("accrued total for client_id {client_id}"))?;
    let withdrawn = parse_total(&withdrawn)
        .with_context(|| format!("withdrawn total for client_id {client_id}"))?;
    Balance::from_totals(accrued, withdrawn)
        .with_context(|| format!("balance for client_id {client_id}"))
}

fn parse_total(raw: &str) -> Result<Points, PointsError> {
    raw.trim()
        .parse::<i64>()
        .map(Points::new)
        .map_err(|_| PointsError::OutOfRange)
}

// ---------------------------------------------------------------------------
// Clients and orders
// ---------------------------------------------------------------------------

pub async fn register_client(pool: &PgPool, login: &str) -> Result<RegisterOutcome> {
    check_login(login)?;

    let inserted: Option<(i64,)> = sqlx::query_as::<_, (i64,)>(
        r#"
        insert into clients (login)
        values ($1)
        on conflict (login) do nothing
        returning client_id
        "#,
    )
    .bind(login)
    .fetch_optional(pool)
    .await
    .context("register_client failed")?;

    Ok(match inserted {
        Some((id,)) => RegisterOutcome::Registered(id),
        None => RegisterOutcome::LoginTaken,
    })
}

/// Submit an order number for a client. The first submitter owns the number.
pub async fn submit_order(
    pool: &PgPool,
    client_id: ClientId,
    order_number: &OrderNumber,
) -> Result<SubmitOutcome> {
    let (known,): (bool,) =
        sqlx::query_as::<_, (bool,)>("select exists (select 1 from clients where client_id = $1)")
            .bind(client_id)
            .fetch_one(pool)
            .await
            .context("submit_order client lookup failed")?;
    if !known {
        return Ok(SubmitOutcome::UnknownClient);
    }

    let inserted = sqlx::query(
        r#"
        insert into orders (client_id, order_number, status)
        values ($1, $2, 'NEW')
        on conflict (order_number) do nothing
        returning order_id, client_id, order_number, status, accrual, uploaded_at
        "#,
    )
    .bind(client_id)
    .bind(order_number.as_str())
    .fetch_optional(pool)
    .await
    .context("submit_order insert failed")?;

    if let Some(row) = inserted {
        return Ok(SubmitOutcome::Accepted(order_from_row(&row)?));
    }

    let (owner,): (i64,) =
        sqlx::query_as::<_, (i64,)>("select client_id from orders where order_number = $1")
            .bind(order_number.as_str())
            .fetch_one(pool)
            .await
            .context("submit_order owner lookup failed")?;

    Ok(if owner == client_id {
        SubmitOutcome::AlreadyUploadedBySelf
    } else {
        SubmitOutcome::AlreadyUploadedByOther
    })
}

pub async fn list_orders(pool: &PgPool, client_id: ClientId) -> Result<Vec<Order>> {
    let rows = sqlx::query(
        r#"
        select order_id, client_id, order_number, status, accrual, uploaded_at
        from orders
        where client_id = $1
        order by uploaded_at asc, order_id asc
        "#,
    )
    .bind(client_id)
    .fetch_all(pool)
    .await
    .context("list_orders failed")?;

    rows.iter().map(order_from_row).collect()
}

pub async fn list_withdrawals(pool: &PgPool, client_id: ClientId) -> Result<Vec<Withdrawal>> {
    let rows = sqlx::query(
        r#"
        select withdrawal_id, client_id, order_number, amount, processed_at
        from withdrawals
        where client_id = $1
        order by processed_at asc, withdrawal_id asc
        "#,
    )
    .bind(client_id)
    .fetch_all(pool)
    .await
    .context("list_withdrawals failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let processed_at: DateTime<Utc> = row.try_get("processed_at")?;
        out.push(Withdrawal {
            withdrawal_id: row.try_get("withdrawal_id")?,
            client_id: row.try_get("client_id")?,
            order_number: row.try_get("order_number")?,
            sum: Points::new(row.try_get("amount")?),
            processed_at,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn status_from_row(row: &PgRow) -> Result<OrderStatus> {
    let raw: String = row.try_get("status")?;
    Ok(OrderStatus::parse(&raw)?)
}

fn accrual_from_row(row: &PgRow) -> Result<Option<Points>> {
    let raw: Option<i64> = row.try_get("accrual")?;
    Ok(raw.map(Points::new))
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    Ok(Task {
        order_id: row.try_get("order_id")?,
        order_number: row.try_get("order_number")?,
        status: status_from_row(row)?,
        accrual: accrual_from_row(row)?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    Ok(Order {
        order_id: row.try_get("order_id")?,
        client_id: row.try_get("client_id")?,
        order_number: row.try_get("order_number")?,
        status: status_from_row(row)?,
        accrual: accrual_from_row(row)?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_outside_points_range_are_errors() {
        assert_eq!(parse_total("0"), Ok(Points::ZERO));
        assert_eq!(parse_total("729980000"), Ok(Points::new(729_980_000)));
        assert_eq!(
            parse_total("18446744073709551614"),
            Err(PointsError::OutOfRange)
        );
    }
}
