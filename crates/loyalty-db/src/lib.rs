//! loyalty-db
//!
//! Postgres persistence for the loyalty ledger: connection helpers, embedded
//! migrations, the [`LedgerStore`] trait, and its Postgres implementation.

mod ledger;
mod store;

pub use ledger::{
    begin_withdrawal, claim_tasks, get_balance, list_orders, list_withdrawals, register_client,
    submit_order, update_task, PgLedger,
};
pub use store::{
    check_login, check_update_target, check_withdrawal_sum, ClaimRequest, LedgerStore,
    RegisterOutcome, SubmitOutcome, TaskUpdate, WithdrawalOutcome,
};

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Env var used by tooling and DB-backed tests.
pub const ENV_DB_URL: &str = "LOYALTY_DATABASE_URL";

/// Connect to Postgres with an explicit pool size.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using LOYALTY_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'orders'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_orders_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
}
