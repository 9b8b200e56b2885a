//! In-process scenario tests for loyalty-daemon HTTP endpoints.
//!
//! The router is built over an [`InMemoryLedger`] and driven through
//! `tower::ServiceExt::oneshot`; no socket is bound.
//!
//! # Invariants under test
//! - Registration: 200 with a client id, 409 on a taken login, 400 on a
//!   malformed body or empty login.
//! - Order upload: 202 new, 200 with an empty body when already uploaded by
//!   the same client, 409 uploaded by another client, 422 on a Luhn failure,
//!   404 for an unregistered client.
//! - Listings answer 204 when empty.
//! - Withdrawal: 200 committed, 402 short of funds, 422 on a bad number or
//!   non-positive sum, 400 on a malformed body, 404 for an unregistered
//!   client, 500 on a store error.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt; // oneshot

use loyalty_accrual::{ClaimScheduler, SchedulerConfig};
use loyalty_daemon::{routes, state};
use loyalty_db::LedgerStore;
use loyalty_schemas::{OrderStatus, Points};
use loyalty_testkit::{InMemoryLedger, ScriptedOracle, ORDER_NUMBERS};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_router(ledger: &Arc<InMemoryLedger>) -> axum::Router {
    let st = Arc::new(state::AppState::new(ledger.clone()));
    routes::build_router(st)
}

async fn call(router: axum::Router, req: Request<Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_text(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ---------------------------------------------------------------------------
// GET /v1/health  GET /v1/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let ledger = Arc::new(InMemoryLedger::new());
    let (status, body) = call(make_router(&ledger), get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "loyalty-daemon");
}

#[tokio::test]
async fn status_without_engine_reports_database_only() {
    let ledger = Arc::new(InMemoryLedger::new());
    let (status, body) = call(make_router(&ledger), get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["database_ok"], true);
    assert!(json["scheduler"].is_null());
    assert!(json["config_hash"].is_null());
}

#[tokio::test]
async fn status_includes_scheduler_stats_and_config_hash() {
    let ledger = Arc::new(InMemoryLedger::new());
    let oracle = Arc::new(ScriptedOracle::new());
    let sched = ClaimScheduler::new(ledger.clone(), oracle, SchedulerConfig::default());

    let st = state::AppState::new(ledger.clone())
        .with_scheduler_stats(sched.stats())
        .with_config_hash("abc123");
    let router = routes::build_router(Arc::new(st));

    let (status, body) = call(router, get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["config_hash"], "abc123");
    assert_eq!(json["scheduler"]["ticks"], 0);
    assert_eq!(json["scheduler"]["recovery_pending"], true);
}

// ---------------------------------------------------------------------------
// POST /v1/clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_then_duplicate_login_conflicts() {
    let ledger = Arc::new(InMemoryLedger::new());

    let (status, body) = call(
        make_router(&ledger),
        post_json("/v1/clients", serde_json::json!({ "login": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse_json(body)["client_id"].as_i64().unwrap() > 0);

    let (status, body) = call(
        make_router(&ledger),
        post_json("/v1/clients", serde_json::json!({ "login": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(parse_json(body)["error"], "login already taken");
}

#[tokio::test]
async fn register_rejects_malformed_body_and_empty_login() {
    let ledger = Arc::new(InMemoryLedger::new());

    let req = Request::builder()
        .method("POST")
        .uri("/v1/clients")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = call(make_router(&ledger), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        make_router(&ledger),
        post_json("/v1/clients", serde_json::json!({ "login": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// /v1/clients/:client_id/orders
// ---------------------------------------------------------------------------

#[tokio::test]
async fn order_upload_status_codes() {
    let ledger = Arc::new(InMemoryLedger::new());
    let alice = ledger.seed_client("alice");
    let bob = ledger.seed_client("bob");
    let n = ORDER_NUMBERS[0];

    let (status, body) = call(
        make_router(&ledger),
        post_text(&format!("/v1/clients/{alice}/orders"), &format!(" {n}\n")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let json = parse_json(body);
    assert_eq!(json["number"], n);
    assert_eq!(json["status"], "NEW");
    assert!(json.get("accrual").is_none());

    let (status, body) = call(
        make_router(&ledger),
        post_text(&format!("/v1/clients/{alice}/orders"), n),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (status, _) = call(
        make_router(&ledger),
        post_text(&format!("/v1/clients/{bob}/orders"), n),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(
        make_router(&ledger),
        post_text(&format!("/v1/clients/{bob}/orders"), "12345678901"),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(parse_json(body)["error"]
        .as_str()
        .unwrap()
        .contains("checksum"));

    let (status, _) = call(
        make_router(&ledger),
        post_text(&format!("/v1/clients/{bob}/orders"), "12a45"),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    assert!(ledger.list_orders(bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn order_listing_is_204_when_empty_and_shows_accruals() {
    let ledger = Arc::new(InMemoryLedger::new());
    let alice = ledger.seed_client("alice");
    let uri = format!("/v1/clients/{alice}/orders");

    let (status, body) = call(make_router(&ledger), get(&uri)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    ledger.seed_accrual(alice, ORDER_NUMBERS[0], Points::new(729_980_000));
    ledger.seed_order(alice, ORDER_NUMBERS[1], OrderStatus::Processing, None);

    let (status, body) = call(make_router(&ledger), get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    let rows = json.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["status"], "PROCESSED");
    assert_eq!(rows[0]["accrual"], 729.98);
    assert_eq!(rows[1]["status"], "PROCESSING");
    assert!(rows[1].get("accrual").is_none());
}

// ---------------------------------------------------------------------------
// /v1/clients/:client_id/withdrawals  /balance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn withdraw_commits_then_declines_with_402() {
    let ledger = Arc::new(InMemoryLedger::new());
    let alice = ledger.seed_client("alice");
    ledger.seed_accrual(alice, ORDER_NUMBERS[0], Points::whole(300));
    let uri = format!("/v1/clients/{alice}/withdrawals");

    let (status, body) = call(
        make_router(&ledger),
        post_json(
            &uri,
            serde_json::json!({ "order": ORDER_NUMBERS[1], "sum": 250.5 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["order"], ORDER_NUMBERS[1]);
    assert_eq!(json["sum"], 250.5);

    let (status, body) = call(
        make_router(&ledger),
        post_json(
            &uri,
            serde_json::json!({ "order": ORDER_NUMBERS[2], "sum": 50 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert!(parse_json(body)["error"]
        .as_str()
        .unwrap()
        .starts_with("insufficient funds"));

    let (status, body) = call(
        make_router(&ledger),
        get(&format!("/v1/clients/{alice}/balance")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["current"], 49.5);
    assert_eq!(json["withdrawn"], 250.5);

    let (status, body) = call(make_router(&ledger), get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body).as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn withdraw_validation_status_codes() {
    let ledger = Arc::new(InMemoryLedger::new());
    let alice = ledger.seed_client("alice");
    ledger.seed_accrual(alice, ORDER_NUMBERS[0], Points::whole(300));
    let uri = format!("/v1/clients/{alice}/withdrawals");

    for (body, want) in [
        (
            serde_json::json!({ "order": "12345678901", "sum": 10 }),
            StatusCode::UNPROCESSABLE_ENTITY,
        ),
        (
            serde_json::json!({ "order": ORDER_NUMBERS[1], "sum": 0 }),
            StatusCode::UNPROCESSABLE_ENTITY,
        ),
        (
            serde_json::json!({ "order": ORDER_NUMBERS[1], "sum": -3 }),
            StatusCode::UNPROCESSABLE_ENTITY,
        ),
        (
            serde_json::json!({ "order": ORDER_NUMBERS[1] }),
            StatusCode::BAD_REQUEST,
        ),
    ] {
        let (status, _) = call(make_router(&ledger), post_json(&uri, body.clone())).await;
        assert_eq!(status, want, "body {body}");
    }

    let (status, _) = call(make_router(&ledger), get(&uri)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unknown_client_is_404_for_upload_and_withdrawal() {
    let ledger = Arc::new(InMemoryLedger::new());
    let alice = ledger.seed_client("alice");
    ledger.seed_accrual(alice, ORDER_NUMBERS[1], Points::whole(10));

    let (status, body) = call(
        make_router(&ledger),
        post_text("/v1/clients/999/orders", ORDER_NUMBERS[0]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(body)["error"], "unknown client");

    let (status, body) = call(
        make_router(&ledger),
        post_json(
            "/v1/clients/999/withdrawals",
            serde_json::json!({ "order": ORDER_NUMBERS[0], "sum": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(body)["error"], "unknown client");

    // Nothing was written; the number is still free for a real client.
    let (status, _) = call(
        make_router(&ledger),
        post_text(&format!("/v1/clients/{alice}/orders"), ORDER_NUMBERS[0]),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn withdraw_store_error_is_500() {
    let ledger = Arc::new(InMemoryLedger::new());
    let alice = ledger.seed_client("alice");
    ledger.seed_accrual(alice, ORDER_NUMBERS[1], Points::whole(10));
    ledger.fail_next_withdrawals(1);

    let (status, body) = call(
        make_router(&ledger),
        post_json(
            &format!("/v1/clients/{alice}/withdrawals"),
            serde_json::json!({ "order": ORDER_NUMBERS[0], "sum": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(parse_json(body)["error"], "begin_withdrawal failed");
    assert!(ledger.list_withdrawals(alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn balance_of_fresh_client_is_zero() {
    let ledger = Arc::new(InMemoryLedger::new());
    let alice = ledger.seed_client("alice");
    let (status, body) = call(
        make_router(&ledger),
        get(&format!("/v1/clients/{alice}/balance")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["current"], 0.0);
    assert_eq!(json["withdrawn"], 0.0);
}
