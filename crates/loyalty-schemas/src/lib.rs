//! loyalty-schemas
//!
//! Shared record types for the loyalty ledger. Pure data plus the order-status
//! state machine, Luhn validation, and fixed-point points. No IO.

mod order_number;
mod points;
mod status;

pub use order_number::{is_valid_luhn, OrderNumber, OrderNumberError};
pub use points::{Points, PointsError, MICROS_PER_POINT};
pub use status::{OrderStatus, StatusParseError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ClientId = i64;
pub type OrderId = i64;

/// A submitted order as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_id: ClientId,
    pub order_number: String,
    pub status: OrderStatus,
    /// Present once the oracle has decided (PROCESSED).
    pub accrual: Option<Points>,
    pub uploaded_at: DateTime<Utc>,
}

/// Unit of reconciliation work handed from the claim step to a worker.
///
/// `status` / `accrual` are the values persisted at claim time; the worker
/// only writes when the oracle's verdict differs from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub order_id: OrderId,
    pub order_number: String,
    pub status: OrderStatus,
    pub accrual: Option<Points>,
}

impl Task {
    pub fn verdict(&self) -> Verdict {
        Verdict {
            status: self.status,
            accrual: self.accrual,
        }
    }
}

/// The oracle's decision for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub status: OrderStatus,
    pub accrual: Option<Points>,
}

impl Verdict {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A committed spend of points. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub withdrawal_id: i64,
    pub client_id: ClientId,
    pub order_number: String,
    pub sum: Points,
    pub processed_at: DateTime<Utc>,
}

/// Derived balance: `current = Σ PROCESSED accruals − withdrawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub current: Points,
    pub withdrawn: Points,
}

impl Balance {
    /// Build from the two aggregates the ledger stores can compute.
    pub fn from_totals(accrued: Points, withdrawn: Points) -> Result<Self, PointsError> {
        let current = accrued
            .checked_sub(withdrawn)
            .ok_or(PointsError::OutOfRange)?;
        Ok(Balance { current, withdrawn })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_from_totals() {
        let b = Balance::from_totals(Points::whole(300), Points::whole(120)).unwrap();
        assert_eq!(b.current, Points::whole(180));
        assert_eq!(b.withdrawn, Points::whole(120));
    }

    #[test]
    fn balance_from_totals_reports_overflow() {
        assert_eq!(
            Balance::from_totals(Points::new(i64::MIN), Points::new(1)),
            Err(PointsError::OutOfRange)
        );
    }

    #[test]
    fn task_verdict_mirrors_fields() {
        let t = Task {
            order_id: 7,
            order_number: "12345678903".to_string(),
            status: OrderStatus::Processing,
            accrual: None,
        };
        let v = t.verdict();
        assert_eq!(v.status, OrderStatus::Processing);
        assert!(!v.is_terminal());
    }
}
