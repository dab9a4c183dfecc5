//! Resource quantity algebra.
//!
//! Quantities are stored as a signed number of milli-units so that fractional
//! CPU requests ("2.5", "500m") and byte counts with binary suffixes ("10Gi")
//! share one representation with exact integer arithmetic.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A resource quantity in milli-units.
///
/// `Quantity::from_str("1")` is 1000 milli-units; `"500m"` is 500;
/// `"1Ki"` is 1_024_000. Values are non-negative: parsing rejects signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(i64);

/// Error parsing a quantity string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseQuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity syntax: {0:?}")]
    Syntax(String),

    #[error("unknown suffix {suffix:?} in {input:?}")]
    UnknownSuffix { input: String, suffix: String },

    #[error("quantity out of range: {0:?}")]
    Overflow(String),
}

const MILLI: i64 = 1000;

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    /// Whole units (e.g. cores, bytes).
    pub fn from_units(units: i64) -> Self {
        Quantity(units * MILLI)
    }

    pub fn from_millis(millis: i64) -> Self {
        Quantity(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition; `None` on overflow.
    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Quantity)
    }

    /// Addition that saturates at the numeric bounds.
    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0).max(0))
    }

    /// Multiply by a count (e.g. pods in a pod set), saturating.
    pub fn scale(self, count: u32) -> Quantity {
        Quantity(self.0.saturating_mul(count as i64))
    }
}

fn suffix_multiplier(suffix: &str) -> Option<i128> {
    let m: i128 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    };
    Some(m)
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseQuantityError::Empty);
        }

        let digits_end = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(digits_end);
        if number.is_empty() {
            return Err(ParseQuantityError::Syntax(s.to_string()));
        }

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(ParseQuantityError::Syntax(s.to_string()));
        }
        if frac_part.contains('.') {
            return Err(ParseQuantityError::Syntax(s.to_string()));
        }

        // "m" scales down instead of up and may not carry a fraction.
        let (multiplier, divisor) = if suffix == "m" {
            (1i128, 1i128)
        } else {
            match suffix_multiplier(suffix) {
                Some(m) => (m * MILLI as i128, 1i128),
                None => {
                    return Err(ParseQuantityError::UnknownSuffix {
                        input: s.to_string(),
                        suffix: suffix.to_string(),
                    })
                }
            }
        };

        let int_value: i128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| ParseQuantityError::Syntax(s.to_string()))?
        };

        let mut millis = int_value
            .checked_mul(multiplier)
            .ok_or_else(|| ParseQuantityError::Overflow(s.to_string()))?
            / divisor;

        if !frac_part.is_empty() {
            if suffix == "m" {
                return Err(ParseQuantityError::Syntax(s.to_string()));
            }
            let frac_value: i128 = frac_part
                .parse()
                .map_err(|_| ParseQuantityError::Syntax(s.to_string()))?;
            let denom = 10i128
                .checked_pow(frac_part.len() as u32)
                .ok_or_else(|| ParseQuantityError::Overflow(s.to_string()))?;
            let scaled = frac_value
                .checked_mul(multiplier)
                .ok_or_else(|| ParseQuantityError::Overflow(s.to_string()))?;
            // Round up so a request is never under-counted.
            millis += (scaled + denom - 1) / denom;
        }

        i64::try_from(millis)
            .map(Quantity)
            .map_err(|_| ParseQuantityError::Overflow(s.to_string()))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % MILLI == 0 {
            write!(f, "{}", self.0 / MILLI)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl<'de> Visitor<'de> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quantity string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                v.parse().map_err(de::Error::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::from_units(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                i64::try_from(v)
                    .map(Quantity::from_units)
                    .map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}
