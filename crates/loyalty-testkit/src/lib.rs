//! loyalty-testkit
//!
//! Test doubles for the reconciliation engine: an in-memory [`LedgerStore`]
//! and a scripted accrual oracle. Used ONLY by tests.
//!
//! [`LedgerStore`]: loyalty_db::LedgerStore

mod ledger;
mod oracle;

pub use ledger::{AppliedWrite, InMemoryLedger};
pub use oracle::{invalid, processed, processing, registered, ScriptedOracle};

use loyalty_schemas::OrderNumber;

/// Luhn-valid order numbers for fixtures, in a stable order.
pub const ORDER_NUMBERS: [&str; 10] = [
    "12345678903",
    "79927398713",
    "2377225624",
    "2377225632",
    "2377225640",
    "2377225657",
    "2377225665",
    "9278923470",
    "346436439",
    "346436447",
];

/// Parse a fixture order number. Panics if it is not Luhn-valid.
pub fn order_number(raw: &str) -> OrderNumber {
    match OrderNumber::parse(raw) {
        Ok(n) => n,
        Err(e) => panic!("fixture order number {raw} invalid: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_numbers_are_luhn_valid() {
        for n in ORDER_NUMBERS {
            assert!(loyalty_schemas::is_valid_luhn(n), "{n}");
        }
    }
}
