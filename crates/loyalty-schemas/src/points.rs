//! Fixed-point loyalty points.
//!
//! # Scale
//!
//! All point amounts (accruals, withdrawal sums, balances) are `i64` at 1e-6
//! scale: 1 point = `Points::new(1_000_000)`. The database stores the raw
//! `i64` in `BIGINT` columns.
//!
//! `f64` conversions happen **only** at the wire boundary:
//!
//! | Direction                   | Function              |
//! |-----------------------------|-----------------------|
//! | internal → JSON response    | [`Points::to_f64`]    |
//! | oracle / JSON request → int | [`Points::from_f64`]  |
//!
//! Sums of accruals are computed in integer arithmetic so a balance can be
//! compared against zero exactly.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Scale factor: 1 point = 1_000_000 micro-points.
pub const MICROS_PER_POINT: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// PointsError
// ---------------------------------------------------------------------------

/// Returned when a wire value or an aggregate is not representable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointsError {
    /// Input was `NaN` or infinite.
    NotFinite,
    /// Input or total would overflow `i64` micro-points.
    OutOfRange,
}

impl std::fmt::Display for PointsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointsError::NotFinite => write!(f, "points: non-finite input (NaN or Inf)"),
            PointsError::OutOfRange => write!(f, "points: value out of i64 range"),
        }
    }
}

impl std::error::Error for PointsError {}

// ---------------------------------------------------------------------------
// Points newtype
// ---------------------------------------------------------------------------

/// A fixed-point amount of loyalty points at 1e-6 scale.
///
/// There is intentionally no `From<i64>`: use [`Points::new`] for raw
/// micro-points or [`Points::whole`] for integral point amounts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Points(i64);

impl Points {
    pub const ZERO: Points = Points(0);

    /// Construct from raw micro-points.
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Points(raw)
    }

    /// Construct from a whole number of points.
    #[inline]
    pub const fn whole(points: i64) -> Self {
        Points(points * MICROS_PER_POINT)
    }

    /// Raw micro-points, for binding into SQL.
    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn checked_add(self, rhs: Points) -> Option<Points> {
        self.0.checked_add(rhs.0).map(Points)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Points) -> Option<Points> {
        self.0.checked_sub(rhs.0).map(Points)
    }

    /// Total of `items`, or `OutOfRange` if it does not fit.
    ///
    /// Ledger aggregates go through this rather than `+`.
    pub fn checked_sum(items: impl IntoIterator<Item = Points>) -> Result<Points, PointsError> {
        items.into_iter().try_fold(Points::ZERO, |acc, p| {
            acc.checked_add(p).ok_or(PointsError::OutOfRange)
        })
    }

    /// Parse a wire value. Rounds to the nearest micro-point.
    pub fn from_f64(value: f64) -> Result<Self, PointsError> {
        if !value.is_finite() {
            return Err(PointsError::NotFinite);
        }
        let scaled = value * MICROS_PER_POINT as f64;
        if scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
            return Err(PointsError::OutOfRange);
        }
        Ok(Points(scaled.round() as i64))
    }

    /// Render for a wire payload.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_POINT as f64
    }
}

impl Add for Points {
    type Output = Points;
    #[inline]
    fn add(self, rhs: Points) -> Points {
        Points(self.0 + rhs.0)
    }
}

impl Sub for Points {
    type Output = Points;
    #[inline]
    fn sub(self, rhs: Points) -> Points {
        Points(self.0 - rhs.0)
    }
}

impl Neg for Points {
    type Output = Points;
    #[inline]
    fn neg(self) -> Points {
        Points(-self.0)
    }
}

impl AddAssign for Points {
    #[inline]
    fn add_assign(&mut self, rhs: Points) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Points {
    #[inline]
    fn sub_assign(&mut self, rhs: Points) {
        self.0 -= rhs.0;
    }
}

impl std::fmt::Display for Points {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / MICROS_PER_POINT;
        let frac = (self.0 % MICROS_PER_POINT).abs();
        if self.0 < 0 && whole == 0 {
            write!(f, "-{whole}.{frac:06}")
        } else {
            write!(f, "{whole}.{frac:06}")
        }
    }
}

// JSON carries points as plain numbers (e.g. `729.98`).

impl Serialize for Points {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = f64::deserialize(deserializer)?;
        Points::from_f64(v).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_points_scale() {
        assert_eq!(Points::whole(500).raw(), 500_000_000);
    }

    #[test]
    fn from_f64_rounds_to_nearest_micro() {
        assert_eq!(Points::from_f64(729.98).unwrap(), Points::new(729_980_000));
        assert_eq!(Points::from_f64(0.0000004).unwrap(), Points::ZERO);
        assert_eq!(Points::from_f64(0.0000006).unwrap(), Points::new(1));
    }

    #[test]
    fn from_f64_rejects_nan_and_inf() {
        assert_eq!(Points::from_f64(f64::NAN), Err(PointsError::NotFinite));
        assert_eq!(Points::from_f64(f64::INFINITY), Err(PointsError::NotFinite));
    }

    #[test]
    fn from_f64_rejects_overflow() {
        assert_eq!(Points::from_f64(1e300), Err(PointsError::OutOfRange));
    }

    #[test]
    fn sum_of_accruals_is_exact() {
        // 0.1 + 0.2 drifts in f64; integer micro-points do not.
        let total = Points::checked_sum([0.1, 0.2].iter().map(|v| Points::from_f64(*v).unwrap()))
            .unwrap();
        assert_eq!(total, Points::from_f64(0.3).unwrap());
    }

    #[test]
    fn checked_sum_reports_overflow() {
        let big = Points::new(i64::MAX - 1);
        assert_eq!(
            Points::checked_sum([big, Points::new(2)]),
            Err(PointsError::OutOfRange)
        );
        assert_eq!(Points::checked_sum([big, Points::new(1)]), Ok(Points::new(i64::MAX)));
        assert_eq!(Points::checked_sum(std::iter::empty()), Ok(Points::ZERO));
    }

    #[test]
    fn display_keeps_sign_below_one_point() {
        assert_eq!(Points::new(-500_000).to_string(), "-0.500000");
        assert_eq!(Points::whole(3).to_string(), "3.000000");
    }

    #[test]
    fn json_uses_plain_numbers() {
        let json = serde_json::to_string(&Points::from_f64(42.5).unwrap()).unwrap();
        assert_eq!(json, "42.5");
        let back: Points = serde_json::from_str("42.5").unwrap();
        assert_eq!(back, Points::new(42_500_000));
    }
}
