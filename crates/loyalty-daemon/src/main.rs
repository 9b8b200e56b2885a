//! loyalty-daemon entry point.
//!
//! Loads config, connects and migrates the ledger, starts the claim
//! scheduler and serves HTTP until a shutdown signal. Route handlers live
//! in `routes.rs`; shared state lives in `state.rs`.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use loyalty_accrual::{ClaimScheduler, HttpAccrualClient, SchedulerConfig};
use loyalty_config::{redact_dsn, ConfigOverrides};
use loyalty_daemon::{routes, state};
use loyalty_db::PgLedger;

#[derive(Parser, Debug)]
#[command(name = "loyalty-daemon", version, about = "Purchase-loyalty ledger service")]
struct Cli {
    /// HTTP bind address (host:port). RUN_ADDRESS takes precedence.
    #[arg(short = 'a', long = "address")]
    address: Option<String>,

    /// Postgres connection string. DATABASE_URI takes precedence.
    #[arg(short = 'd', long = "database-uri")]
    database_uri: Option<String>,

    /// Accrual system base URL. ACCRUAL_SYSTEM_ADDRESS takes precedence.
    #[arg(short = 'r', long = "accrual-address")]
    accrual_address: Option<String>,

    /// YAML config layer; repeat to merge several (later wins).
    #[arg(long = "config")]
    config: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    let overrides = ConfigOverrides {
        run_address: cli.address,
        database_uri: cli.database_uri,
        accrual_system_address: cli.accrual_address,
    };
    let paths: Vec<&str> = cli.config.iter().map(String::as_str).collect();
    let loaded = loyalty_config::load(&paths, &overrides).context("load config failed")?;
    let cfg = loaded.config;
    info!(
        config_hash = %loaded.config_hash,
        database = %redact_dsn(&cfg.database_uri),
        accrual = %cfg.accrual_system_address,
        "config loaded"
    );

    let pool = loyalty_db::connect(&cfg.database_uri, cfg.database.max_connections)
        .await
        .with_context(|| format!("connect {} failed", redact_dsn(&cfg.database_uri)))?;
    loyalty_db::migrate(&pool).await?;
    let ledger = Arc::new(PgLedger::new(pool));

    let oracle = Arc::new(
        HttpAccrualClient::new(&cfg.accrual_system_address, cfg.accrual.request_timeout())
            .context("build accrual client failed")?,
    );
    let scheduler = ClaimScheduler::new(
        ledger.clone(),
        oracle,
        SchedulerConfig::from_settings(&cfg.accrual),
    );

    let shared = Arc::new(
        state::AppState::new(ledger)
            .with_scheduler_stats(scheduler.stats())
            .with_config_hash(loaded.config_hash),
    );

    let shutdown = CancellationToken::new();
    let engine = state::spawn_claim_scheduler(scheduler, shutdown.clone());

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let listener = tokio::net::TcpListener::bind(&cfg.run_address)
        .await
        .with_context(|| format!("bind {} failed", cfg.run_address))?;
    info!("loyalty-daemon listening on http://{}", cfg.run_address);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server crashed");

    // The server may have exited without a signal; stop the engine either way.
    shutdown.cancel();
    match engine.await {
        Ok(stats) => info!(
            ticks = stats.ticks,
            spawned = stats.spawned,
            completed = stats.completed,
            abandoned = stats.abandoned,
            "claim scheduler stopped"
        ),
        Err(err) => warn!(error = ?err, "claim scheduler task failed"),
    }

    served
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Resolves on Ctrl-C or SIGTERM and cancels `token`.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "ctrl_c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    token.cancel();
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:8080",
        "http://127.0.0.1:8080",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
