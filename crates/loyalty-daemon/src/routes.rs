//! Axum router and all HTTP handlers for loyalty-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Client identity comes from the path; there is no auth
//! scheme in front of these routes.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use loyalty_db::{RegisterOutcome, SubmitOutcome, WithdrawalOutcome};
use loyalty_schemas::{ClientId, OrderNumber, Points};

use crate::{
    api_types::{
        BalanceResponse, ErrorResponse, HealthResponse, OrderResponse, RegisterClientRequest,
        RegisterClientResponse, StatusResponse, WithdrawRequest, WithdrawalResponse,
    },
    state::{uptime_secs, AppState},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/clients", post(register_client))
        .route(
            "/v1/clients/:client_id/orders",
            post(submit_order).get(list_orders),
        )
        .route(
            "/v1/clients/:client_id/withdrawals",
            post(withdraw).get(list_withdrawals),
        )
        .route("/v1/clients/:client_id/balance", get(balance))
        .with_state(state)
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

fn internal(op: &str, err: anyhow::Error) -> Response {
    tracing::error!(op, error = ?err, "ledger operation failed");
    error(StatusCode::INTERNAL_SERVER_ERROR, format!("{op} failed"))
}

// ---------------------------------------------------------------------------
// GET /v1/health  GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let database_ok = match st.ledger.ping().await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = ?err, "status: ledger ping failed");
            false
        }
    };
    let scheduler = match &st.scheduler_stats {
        Some(h) => Some(h.snapshot().await),
        None => None,
    };

    (
        StatusCode::OK,
        Json(StatusResponse {
            daemon_uptime_secs: uptime_secs(),
            config_hash: st.config_hash.clone(),
            database_ok,
            scheduler,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/clients
// ---------------------------------------------------------------------------

pub(crate) async fn register_client(State(st): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: RegisterClientRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid body: {e}")),
    };
    let login = req.login.trim();
    if login.is_empty() {
        return error(StatusCode::BAD_REQUEST, "login must be non-empty");
    }

    match st.ledger.register_client(login).await {
        Ok(RegisterOutcome::Registered(client_id)) => {
            tracing::info!(client_id, "client registered");
            (StatusCode::OK, Json(RegisterClientResponse { client_id })).into_response()
        }
        Ok(RegisterOutcome::LoginTaken) => error(StatusCode::CONFLICT, "login already taken"),
        Err(err) => internal("register_client", err),
    }
}

// ---------------------------------------------------------------------------
// /v1/clients/:client_id/orders
// ---------------------------------------------------------------------------

/// Body is the bare order number as text.
pub(crate) async fn submit_order(
    State(st): State<Arc<AppState>>,
    Path(client_id): Path<ClientId>,
    body: Bytes,
) -> Response {
    let Ok(raw) = std::str::from_utf8(&body) else {
        return error(StatusCode::BAD_REQUEST, "body must be UTF-8 text");
    };
    let number = match OrderNumber::parse(raw.trim()) {
        Ok(n) => n,
        Err(e) => return error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    };

    match st.ledger.submit_order(client_id, &number).await {
        Ok(SubmitOutcome::Accepted(order)) => {
            tracing::info!(
                client_id,
                order_id = order.order_id,
                order_number = %number,
                "order accepted"
            );
            (StatusCode::ACCEPTED, Json(OrderResponse::from(order))).into_response()
        }
        Ok(SubmitOutcome::AlreadyUploadedBySelf) => StatusCode::OK.into_response(),
        Ok(SubmitOutcome::AlreadyUploadedByOther) => error(
            StatusCode::CONFLICT,
            "order number already uploaded by another client",
        ),
        Ok(SubmitOutcome::UnknownClient) => error(StatusCode::NOT_FOUND, "unknown client"),
        Err(err) => internal("submit_order", err),
    }
}

pub(crate) async fn list_orders(
    State(st): State<Arc<AppState>>,
    Path(client_id): Path<ClientId>,
) -> Response {
    match st.ledger.list_orders(client_id).await {
        Ok(orders) if orders.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(orders) => {
            let body: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => internal("list_orders", err),
    }
}

// ---------------------------------------------------------------------------
// /v1/clients/:client_id/withdrawals
// ---------------------------------------------------------------------------

pub(crate) async fn withdraw(
    State(st): State<Arc<AppState>>,
    Path(client_id): Path<ClientId>,
    body: Bytes,
) -> Response {
    let req: WithdrawRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid body: {e}")),
    };
    let number = match OrderNumber::parse(req.order.trim()) {
        Ok(n) => n,
        Err(e) => return error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    };
    let sum = match Points::from_f64(req.sum) {
        Ok(s) if s.is_positive() => s,
        Ok(_) => return error(StatusCode::UNPROCESSABLE_ENTITY, "sum must be > 0"),
        Err(e) => return error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    };

    match st.ledger.begin_withdrawal(client_id, &number, sum).await {
        Ok(WithdrawalOutcome::Committed(w)) => {
            tracing::info!(
                client_id,
                withdrawal_id = w.withdrawal_id,
                sum = %w.sum,
                "withdrawal committed"
            );
            (StatusCode::OK, Json(WithdrawalResponse::from(w))).into_response()
        }
        Ok(WithdrawalOutcome::InsufficientFunds {
            available,
            requested,
        }) => {
            tracing::info!(
                client_id,
                available = %available,
                requested = %requested,
                "withdrawal declined"
            );
            error(
                StatusCode::PAYMENT_REQUIRED,
                format!("insufficient funds: available {available}, requested {requested}"),
            )
        }
        Ok(WithdrawalOutcome::UnknownClient) => error(StatusCode::NOT_FOUND, "unknown client"),
        Err(err) => internal("begin_withdrawal", err),
    }
}

pub(crate) async fn list_withdrawals(
    State(st): State<Arc<AppState>>,
    Path(client_id): Path<ClientId>,
) -> Response {
    match st.ledger.list_withdrawals(client_id).await {
        Ok(ws) if ws.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(ws) => {
            let body: Vec<WithdrawalResponse> =
                ws.into_iter().map(WithdrawalResponse::from).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => internal("list_withdrawals", err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/clients/:client_id/balance
// ---------------------------------------------------------------------------

pub(crate) async fn balance(
    State(st): State<Arc<AppState>>,
    Path(client_id): Path<ClientId>,
) -> Response {
    match st.ledger.get_balance(client_id).await {
        Ok(b) => (
            StatusCode::OK,
            Json(BalanceResponse {
                current: b.current,
                withdrawn: b.withdrawn,
            }),
        )
            .into_response(),
        Err(err) => internal("get_balance", err),
    }
}
