//! Order status state machine.
//!
//! ```text
//!            claim                 oracle verdict
//!   NEW ───────────► PROCESSING ◄──────────────► REGISTERED
//!                        │                           │
//!                        └─────────┬─────────────────┘
//!                                  ▼
//!                     PROCESSED (term.) | INVALID (term.)
//! ```
//!
//! NEW is only ever written at order submission. REGISTERED and PROCESSING
//! may alternate while the oracle is still deciding. Terminal states are final.

use serde::{Deserialize, Serialize};

/// Lifecycle of an order, as persisted in `orders.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Submitted; not yet claimed by the reconciliation engine.
    New,
    /// The oracle knows the order but has not started computing.
    Registered,
    /// Claimed and/or being computed by the oracle.
    Processing,
    /// Accrual decided. **Terminal.**
    Processed,
    /// The oracle refused the order. **Terminal.**
    Invalid,
}

/// Returned by [`OrderStatus::parse`] for an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusParseError(pub String);

impl std::fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid order status: {}", self.0)
    }
}

impl std::error::Error for StatusParseError {}

impl OrderStatus {
    /// Statuses the first scheduler tick claims to recover orphaned work.
    pub const RECOVERABLE: [OrderStatus; 3] = [
        OrderStatus::New,
        OrderStatus::Registered,
        OrderStatus::Processing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Registered => "REGISTERED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StatusParseError> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "REGISTERED" => Ok(OrderStatus::Registered),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => Err(StatusParseError(other.to_string())),
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }

    /// Whether a verdict write moving `self` to `next` is legal.
    ///
    /// Rewriting the same non-terminal status is legal (idempotent write).
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, next) {
            (Processed | Invalid, _) => false,
            (_, New) => false,
            (New | Registered | Processing, Registered | Processing | Processed | Invalid) => true,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 5] = [
        OrderStatus::New,
        OrderStatus::Registered,
        OrderStatus::Processing,
        OrderStatus::Processed,
        OrderStatus::Invalid,
    ];

    #[test]
    fn parse_accepts_every_as_str() {
        for s in ALL {
            assert_eq!(OrderStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(OrderStatus::parse("processed").is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        for s in [OrderStatus::Processed, OrderStatus::Invalid] {
            assert!(s.is_terminal());
            for next in ALL {
                assert!(!s.can_advance_to(next), "{s} -> {next} must be refused");
            }
        }
    }

    #[test]
    fn nothing_returns_to_new() {
        for s in ALL {
            assert!(!s.can_advance_to(OrderStatus::New));
        }
    }

    #[test]
    fn intermediate_states_may_alternate() {
        assert!(OrderStatus::Processing.can_advance_to(OrderStatus::Registered));
        assert!(OrderStatus::Registered.can_advance_to(OrderStatus::Processing));
        assert!(OrderStatus::Processing.can_advance_to(OrderStatus::Processing));
        assert!(OrderStatus::New.can_advance_to(OrderStatus::Processed));
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&OrderStatus::Processed).unwrap();
        assert_eq!(json, "\"PROCESSED\"");
        let back: OrderStatus = serde_json::from_str("\"REGISTERED\"").unwrap();
        assert_eq!(back, OrderStatus::Registered);
    }
}
