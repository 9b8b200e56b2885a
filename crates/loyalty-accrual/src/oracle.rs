//! Accrual oracle boundary.
//!
//! The oracle is the external authority on how many points an order earns.
//! One request per poll: `GET <base>/api/orders/{number}`.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;

use loyalty_schemas::{OrderStatus, Points, Verdict};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a poll did not produce a verdict. Every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// Connection, timeout, or body-read failure.
    Transport(String),
    /// Any non-success HTTP status. `retry_after` is set from a 429's header.
    Status {
        code: u16,
        retry_after: Option<Duration>,
    },
    /// 204: the oracle does not know the order yet.
    NotRegistered,
    /// 200 with a body that is not a usable verdict.
    Decode(String),
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Transport(msg) => write!(f, "oracle transport error: {msg}"),
            OracleError::Status {
                code,
                retry_after: Some(d),
            } => write!(f, "oracle status {code} (retry after {}s)", d.as_secs()),
            OracleError::Status {
                code,
                retry_after: None,
            } => write!(f, "oracle status {code}"),
            OracleError::NotRegistered => write!(f, "order not registered with oracle yet"),
            OracleError::Decode(msg) => write!(f, "oracle decode error: {msg}"),
        }
    }
}

impl std::error::Error for OracleError {}

// ---------------------------------------------------------------------------
// Oracle trait
// ---------------------------------------------------------------------------

/// Source of accrual verdicts.
#[async_trait::async_trait]
pub trait AccrualOracle: Send + Sync {
    async fn fetch_verdict(&self, order_number: &str) -> Result<Verdict, OracleError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// reqwest-backed oracle client.
#[derive(Debug, Clone)]
pub struct HttpAccrualClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("accrual http client build failed")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn order_url(&self, order_number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_number)
    }
}

#[async_trait::async_trait]
impl AccrualOracle for HttpAccrualClient {
    async fn fetch_verdict(&self, order_number: &str) -> Result<Verdict, OracleError> {
        let resp = self
            .http
            .get(self.order_url(order_number))
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Err(OracleError::NotRegistered);
        }
        if status != StatusCode::OK {
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                resp.headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs)
            } else {
                None
            };
            return Err(OracleError::Status {
                code: status.as_u16(),
                retry_after,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        decode_verdict(order_number, &body)
    }
}

// ---------------------------------------------------------------------------
// Wire decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireVerdict {
    order: String,
    status: String,
    #[serde(default)]
    accrual: Option<f64>,
}

/// Decode a 200 body into a [`Verdict`].
///
/// The oracle never reports NEW. PROCESSED without an `accrual` field earns
/// zero; non-PROCESSED verdicts carry no accrual even if one is sent.
pub fn decode_verdict(order_number: &str, body: &[u8]) -> Result<Verdict, OracleError> {
    let wire: WireVerdict =
        serde_json::from_slice(body).map_err(|e| OracleError::Decode(e.to_string()))?;

    if wire.order != order_number {
        return Err(OracleError::Decode(format!(
            "verdict is for order {} (asked for {order_number})",
            wire.order
        )));
    }

    let status = OrderStatus::parse(&wire.status)
        .map_err(|e| OracleError::Decode(e.to_string()))?;
    if status == OrderStatus::New {
        return Err(OracleError::Decode("oracle reported status NEW".to_string()));
    }

    let accrual = if status == OrderStatus::Processed {
        let raw = wire.accrual.unwrap_or(0.0);
        let pts = Points::from_f64(raw).map_err(|e| OracleError::Decode(e.to_string()))?;
        if pts.is_negative() {
            return Err(OracleError::Decode(format!("negative accrual {raw}")));
        }
        Some(pts)
    } else {
        None
    };

    Ok(Verdict { status, accrual })
}
