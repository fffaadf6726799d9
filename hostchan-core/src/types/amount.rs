//! Millisatoshi and satoshi amounts.
//!
//! Upstream JSON may carry amounts either as a bare number or as a string
//! with an `msat` suffix, so deserialization accepts both forms.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An amount in millisatoshi.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MilliSatoshi(pub u64);

impl MilliSatoshi {
    /// The zero amount.
    pub const ZERO: MilliSatoshi = MilliSatoshi(0);

    /// Raw millisatoshi value.
    #[inline]
    pub fn msat(self) -> u64 {
        self.0
    }

    /// Subtraction that reports underflow instead of wrapping.
    pub fn checked_sub(self, rhs: MilliSatoshi) -> Option<MilliSatoshi> {
        self.0.checked_sub(rhs.0).map(MilliSatoshi)
    }

    /// Proportional fee helper: `self * parts_per_million / 1_000_000`.
    pub fn fee_proportional(self, millionths: u64) -> MilliSatoshi {
        MilliSatoshi((self.0 as u128 * millionths as u128 / 1_000_000) as u64)
    }
}

impl Add for MilliSatoshi {
    type Output = MilliSatoshi;
    fn add(self, rhs: MilliSatoshi) -> MilliSatoshi {
        MilliSatoshi(self.0 + rhs.0)
    }
}

impl Sub for MilliSatoshi {
    type Output = MilliSatoshi;
    fn sub(self, rhs: MilliSatoshi) -> MilliSatoshi {
        MilliSatoshi(self.0 - rhs.0)
    }
}

impl AddAssign for MilliSatoshi {
    fn add_assign(&mut self, rhs: MilliSatoshi) {
        self.0 += rhs.0;
    }
}

impl SubAssign for MilliSatoshi {
    fn sub_assign(&mut self, rhs: MilliSatoshi) {
        self.0 -= rhs.0;
    }
}

impl Sum for MilliSatoshi {
    fn sum<I: Iterator<Item = MilliSatoshi>>(iter: I) -> MilliSatoshi {
        MilliSatoshi(iter.map(|m| m.0).sum())
    }
}

impl fmt::Display for MilliSatoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

impl From<u64> for MilliSatoshi {
    fn from(v: u64) -> Self {
        MilliSatoshi(v)
    }
}

impl Serialize for MilliSatoshi {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for MilliSatoshi {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MsatVisitor;

        impl serde::de::Visitor<'_> for MsatVisitor {
            type Value = MilliSatoshi;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("millisatoshi as integer or \"<n>msat\" string")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<MilliSatoshi, E> {
                Ok(MilliSatoshi(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<MilliSatoshi, E> {
                u64::try_from(v)
                    .map(MilliSatoshi)
                    .map_err(|_| E::custom("negative millisatoshi amount"))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<MilliSatoshi, E> {
                let digits = v.strip_suffix("msat").unwrap_or(v);
                digits
                    .parse::<u64>()
                    .map(MilliSatoshi)
                    .map_err(|_| E::custom(format!("bad millisatoshi amount: {}", v)))
            }
        }

        deserializer.deserialize_any(MsatVisitor)
    }
}

/// An amount in whole satoshi.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Satoshi(pub u64);

impl Satoshi {
    /// Convert to millisatoshi.
    pub fn to_msat(self) -> MilliSatoshi {
        MilliSatoshi(self.0 * 1000)
    }
}

impl fmt::Display for Satoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}sat", self.0)
    }
}
