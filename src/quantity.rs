//! Storage capacity quantities
//!
//! Parses Kubernetes quantity strings (`10Gi`, `1.5G`, `1e9`, `500m`) into a
//! whole number of bytes and renders them back in binary-SI form, so a
//! capacity that went in as `10Gi` comes out of the descriptor as `10Gi`.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::fmt;
use std::str::FromStr;

const BINARY_SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

/// A capacity in bytes, rounded up from the requested quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Capacity {
    bytes: u128,
}

impl Capacity {
    pub fn from_bytes(bytes: u128) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> u128 {
        self.bytes
    }

    /// Size in the integer form targetd expects
    pub fn to_daemon_size(&self) -> Result<u64> {
        u64::try_from(self.bytes)
            .ok()
            .filter(|size| *size <= i64::MAX as u64)
            .ok_or_else(|| Error::CapacityParse(format!("{} bytes is too large for targetd", self.bytes)))
    }

    pub fn to_quantity(&self) -> Quantity {
        Quantity(self.to_string())
    }
}

impl TryFrom<&Quantity> for Capacity {
    type Error = Error;

    fn try_from(quantity: &Quantity) -> Result<Self> {
        quantity.0.parse()
    }
}

impl FromStr for Capacity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::CapacityParse("empty capacity string".into()));
        }
        if s.starts_with('-') {
            return Err(Error::CapacityParse(format!("negative capacity: {}", s)));
        }
        let s = s.strip_prefix('+').unwrap_or(s);

        let num_end = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(num_end);

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if fraction.contains('.') || (whole.is_empty() && fraction.is_empty()) {
            return Err(Error::CapacityParse(format!("invalid number: {}", number)));
        }

        let overflow = || Error::CapacityParse(format!("capacity out of range: {}", s));

        let mantissa: u128 = format!("{}{}", whole, fraction)
            .parse()
            .map_err(|_| overflow())?;
        let mut denominator = 10u128
            .checked_pow(fraction.len() as u32)
            .ok_or_else(overflow)?;

        let (multiplier, divisor) = suffix_scale(suffix)?;
        denominator = denominator.checked_mul(divisor).ok_or_else(overflow)?;
        let numerator = mantissa.checked_mul(multiplier).ok_or_else(overflow)?;

        // Round up to whole bytes
        let mut bytes = numerator / denominator;
        if numerator % denominator != 0 {
            bytes += 1;
        }

        Ok(Self { bytes })
    }
}

/// Multiplier and divisor for a quantity suffix
fn suffix_scale(suffix: &str) -> Result<(u128, u128)> {
    let scale = match suffix {
        "" => (1, 1),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))
                .and_then(|e| e.parse::<i32>().ok())
                .ok_or_else(|| Error::CapacityParse(format!("unknown unit: {}", suffix)))?;

            let power = 10u128
                .checked_pow(exponent.unsigned_abs())
                .ok_or_else(|| Error::CapacityParse(format!("exponent out of range: {}", suffix)))?;
            if exponent >= 0 {
                (power, 1)
            } else {
                (1, power)
            }
        }
    };

    Ok(scale)
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes == 0 {
            return write!(f, "0");
        }

        let mut value = self.bytes;
        let mut suffix = "";
        for candidate in BINARY_SUFFIXES {
            if value % 1024 != 0 {
                break;
            }
            value /= 1024;
            suffix = candidate;
        }

        write!(f, "{}{}", value, suffix)
    }
}
