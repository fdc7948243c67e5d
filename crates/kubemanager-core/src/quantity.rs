//! Kubernetes resource-quantity parsing.
//!
//! Accepts the quantity grammar the API server accepts for resource
//! requests and limits: an unsigned decimal number followed by an optional
//! suffix. Suffixes are `m` (milli), decimal SI (`k`, `M`, `G`, `T`, `P`,
//! `E`), binary SI (`Ki` … `Ei`) or a decimal exponent (`e3`, `E-2`).
//!
//! Values are held in milli-units so that both CPU (`250m`) and byte sizes
//! (`4Gi`) stay exact. Rounding always goes up, matching the API server.

use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

const MILLI_PER_UNIT: u128 = 1000;
const MAX_FRACTION_DIGITS: usize = 9;
const MAX_EXPONENT: u32 = 18;

/// A non-negative resource quantity, stored in milli-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity {
    milli: u64,
}

impl Quantity {
    /// Parse a quantity string such as `"2000m"`, `"1.5"`, `"4Gi"` or `"1e3"`.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(CoreError::quantity(input, "empty quantity"));
        }
        if s.starts_with('-') {
            return Err(CoreError::quantity(input, "negative quantities are not allowed"));
        }
        let s = s.strip_prefix('+').unwrap_or(s);

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(CoreError::quantity(input, "missing number"));
        }
        if frac_part.contains('.') {
            return Err(CoreError::quantity(input, "malformed number"));
        }
        if frac_part.len() > MAX_FRACTION_DIGITS {
            return Err(CoreError::quantity(input, "too many fractional digits"));
        }

        let digits: u128 = format!("{int_part}{frac_part}")
            .parse()
            .map_err(|_| CoreError::quantity(input, "number out of range"))?;
        let scale = 10u128.pow(frac_part.len() as u32);

        let (num, den) = multiplier(suffix)
            .ok_or_else(|| CoreError::quantity(input, format!("unknown suffix {suffix:?}")))?;

        let overflow = || CoreError::quantity(input, "quantity out of range");
        let numerator = digits
            .checked_mul(num)
            .and_then(|v| v.checked_mul(MILLI_PER_UNIT))
            .ok_or_else(overflow)?;
        let denominator = scale.checked_mul(den).ok_or_else(overflow)?;
        let milli = u64::try_from(numerator.div_ceil(denominator)).map_err(|_| overflow())?;

        Ok(Self { milli })
    }

    pub fn from_milli(milli: u64) -> Self {
        Self { milli }
    }

    /// Value in milli-units (`"1"` → 1000, `"250m"` → 250).
    pub fn milli_value(&self) -> u64 {
        self.milli
    }

    /// Value in whole units, rounded up (`"4Gi"` → 4294967296).
    pub fn value(&self) -> u64 {
        self.milli.div_ceil(MILLI_PER_UNIT as u64)
    }
}

impl FromStr for Quantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.milli % 1000 == 0 {
            write!(f, "{}", self.milli / 1000)
        } else {
            write!(f, "{}m", self.milli)
        }
    }
}

/// Parse a CPU quantity into millicores.
pub fn cpu_millis(input: &str) -> CoreResult<u64> {
    Ok(Quantity::parse(input)?.milli_value())
}

/// Parse a memory or storage quantity into bytes.
pub fn bytes(input: &str) -> CoreResult<u64> {
    Ok(Quantity::parse(input)?.value())
}

/// Render millicores the way the metrics API does (`"350m"`).
pub fn format_millicores(milli: u64) -> String {
    format!("{milli}m")
}

/// Render a byte count as whole mebibytes (`"512Mi"`), truncating.
pub fn format_mebibytes(bytes: u64) -> String {
    format!("{}Mi", bytes / MIB)
}

/// `(numerator, denominator)` multiplier for a suffix, in base units.
fn multiplier(suffix: &str) -> Option<(u128, u128)> {
    let m = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (10u128.pow(3), 1),
        "M" => (10u128.pow(6), 1),
        "G" => (10u128.pow(9), 1),
        "T" => (10u128.pow(12), 1),
        "P" => (10u128.pow(15), 1),
        "E" => (10u128.pow(18), 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        other => return exponent(other),
    };
    Some(m)
}

fn exponent(suffix: &str) -> Option<(u128, u128)> {
    let rest = suffix.strip_prefix(['e', 'E'])?;
    let exp: i32 = rest.parse().ok()?;
    if exp.unsigned_abs() > MAX_EXPONENT {
        return None;
    }
    let p = 10u128.pow(exp.unsigned_abs());
    Some(if exp >= 0 { (p, 1) } else { (1, p) })
}
