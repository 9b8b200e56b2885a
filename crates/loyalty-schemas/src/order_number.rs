//! Luhn-checked order numbers.
//!
//! Both order submissions and withdrawal targets carry an order number that
//! must be a non-empty decimal string passing the Luhn checksum. Validation is
//! done over the digit string, so numbers longer than `u64` are fine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderNumberError {
    Empty,
    NonDigit,
    Checksum,
}

impl std::fmt::Display for OrderNumberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderNumberError::Empty => write!(f, "invalid order number format: empty"),
            OrderNumberError::NonDigit => {
                write!(f, "invalid order number format: non-digit character")
            }
            OrderNumberError::Checksum => write!(f, "invalid order number format: checksum"),
        }
    }
}

impl std::error::Error for OrderNumberError {}

/// Returns `true` if `digits` is a non-empty ASCII digit string with a valid
/// Luhn check digit.
pub fn is_valid_luhn(digits: &str) -> bool {
    luhn_check(digits).is_ok()
}

fn luhn_check(digits: &str) -> Result<(), OrderNumberError> {
    if digits.is_empty() {
        return Err(OrderNumberError::Empty);
    }

    let mut sum = 0u32;
    // Walk right to left; every second digit (starting with the one left of
    // the check digit) is doubled.
    for (i, b) in digits.bytes().rev().enumerate() {
        if !b.is_ascii_digit() {
            return Err(OrderNumberError::NonDigit);
        }
        let mut d = u32::from(b - b'0');
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }

    if sum % 10 == 0 {
        Ok(())
    } else {
        Err(OrderNumberError::Checksum)
    }
}

/// An order number that has passed Luhn validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn parse(raw: &str) -> Result<Self, OrderNumberError> {
        luhn_check(raw)?;
        Ok(OrderNumber(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = OrderNumberError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        luhn_check(&value)?;
        Ok(OrderNumber(value))
    }
}

impl From<OrderNumber> for String {
    fn from(value: OrderNumber) -> Self {
        value.0
    }
}

impl std::fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_valid_numbers() {
        for n in ["12345678903", "79927398713", "4561261212345467", "0"] {
            assert!(is_valid_luhn(n), "{n} should pass");
        }
    }

    #[test]
    fn wrong_check_digit_is_rejected() {
        assert_eq!(
            OrderNumber::parse("12345678904"),
            Err(OrderNumberError::Checksum)
        );
    }

    #[test]
    fn empty_and_non_digit_are_rejected() {
        assert_eq!(OrderNumber::parse(""), Err(OrderNumberError::Empty));
        assert_eq!(OrderNumber::parse("1234a"), Err(OrderNumberError::NonDigit));
        assert_eq!(OrderNumber::parse("-18"), Err(OrderNumberError::NonDigit));
        assert_eq!(OrderNumber::parse(" 18"), Err(OrderNumberError::NonDigit));
    }

    #[test]
    fn numbers_wider_than_u64_are_checked() {
        // 25 digits.
        assert!(is_valid_luhn("1234567890123456789012340"));
        assert!(!is_valid_luhn("1234567890123456789012346"));
    }

    #[test]
    fn deserialize_validates() {
        let ok: OrderNumber = serde_json::from_str("\"12345678903\"").unwrap();
        assert_eq!(ok.as_str(), "12345678903");
        assert!(serde_json::from_str::<OrderNumber>("\"12345678904\"").is_err());
    }
}
