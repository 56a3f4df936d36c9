//! Exact decimal numbers.
//!
//! Decimal columns store scaled integers of 32, 64, 128 or 256 bits. A [`Decimal`] keeps the
//! digits as text with an explicit scale so values can move between scales without ever
//! passing through a float.

use std::fmt;
use std::str::FromStr;

/// A signed decimal: `digits * 10^-scale`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal {
    negative: bool,
    /// ASCII digits without leading zeros; `"0"` for zero.
    digits: String,
    scale: u32,
}

/// Two's complement 256-bit integer, least significant limb first.
pub type I256 = [u64; 4];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDecimalError(String);

impl fmt::Display for ParseDecimalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decimal literal: {:?}", self.0)
    }
}

impl std::error::Error for ParseDecimalError {}

impl Decimal {
    fn from_parts(negative: bool, digits: &str, scale: u32) -> Self {
        let trimmed = digits.trim_start_matches('0');
        let digits = if trimmed.is_empty() { "0" } else { trimmed };
        Decimal {
            negative: negative && digits != "0",
            digits: digits.to_string(),
            scale,
        }
    }

    pub fn zero(scale: u32) -> Self {
        Self::from_parts(false, "0", scale)
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.digits == "0"
    }

    /// Number of significant digits, counting the fractional ones.
    pub fn precision(&self) -> u32 {
        (self.digits.len() as u32).max(self.scale)
    }

    /// Same value at another scale. Fails when shrinking the scale would drop non-zero digits.
    pub fn rescale(&self, scale: u32) -> Option<Decimal> {
        if scale >= self.scale {
            let mut digits = self.digits.clone();
            digits.extend(std::iter::repeat('0').take((scale - self.scale) as usize));
            return Some(Self::from_parts(self.negative, &digits, scale));
        }

        let drop = (self.scale - scale) as usize;
        if self.digits.len() <= drop {
            return self.is_zero().then(|| Self::zero(scale));
        }
        let (kept, dropped) = self.digits.split_at(self.digits.len() - drop);
        if dropped.bytes().any(|b| b != b'0') {
            return None;
        }
        Some(Self::from_parts(self.negative, kept, scale))
    }

    /// Unscaled integer at `scale`, if it fits in an i128.
    pub fn to_i128_scaled(&self, scale: u32) -> Option<i128> {
        let scaled = self.rescale(scale)?;
        let magnitude: u128 = scaled.digits.parse().ok()?;
        if scaled.negative {
            if magnitude > i128::MAX as u128 + 1 {
                return None;
            }
            Some((magnitude as i128).wrapping_neg())
        } else {
            i128::try_from(magnitude).ok()
        }
    }

    pub fn from_i128_scaled(value: i128, scale: u32) -> Self {
        Self::from_parts(value < 0, &value.unsigned_abs().to_string(), scale)
    }

    /// Unscaled 256-bit integer at `scale`.
    pub fn to_i256_scaled(&self, scale: u32) -> Option<I256> {
        let scaled = self.rescale(scale)?;
        let mut limbs: I256 = [0; 4];
        for b in scaled.digits.bytes() {
            if !mul_add(&mut limbs, 10, (b - b'0') as u64) {
                return None;
            }
        }
        // The magnitude must leave the sign bit clear, except for the minimum value.
        if limbs[3] >> 63 == 1 {
            let is_min = scaled.negative && limbs == [0, 0, 0, 1 << 63];
            if !is_min {
                return None;
            }
        }
        if scaled.negative {
            negate(&mut limbs);
        }
        Some(limbs)
    }

    pub fn from_i256_scaled(value: I256, scale: u32) -> Self {
        let mut magnitude = value;
        let negative = value[3] >> 63 == 1;
        if negative {
            negate(&mut magnitude);
        }
        let mut digits = Vec::new();
        while magnitude != [0; 4] {
            digits.push(b'0' + div_rem(&mut magnitude, 10) as u8);
        }
        if digits.is_empty() {
            return Self::zero(scale);
        }
        digits.reverse();
        // Only ASCII digits were pushed.
        let digits = String::from_utf8_lossy(&digits).into_owned();
        Self::from_parts(negative, &digits, scale)
    }
}

fn mul_add(limbs: &mut I256, mul: u64, add: u64) -> bool {
    let mut carry = add as u128;
    for limb in limbs.iter_mut() {
        let v = (*limb as u128) * (mul as u128) + carry;
        *limb = v as u64;
        carry = v >> 64;
    }
    carry == 0
}

fn div_rem(limbs: &mut I256, div: u64) -> u64 {
    let mut rem = 0u128;
    for limb in limbs.iter_mut().rev() {
        let cur = (rem << 64) | *limb as u128;
        *limb = (cur / div as u128) as u64;
        rem = cur % div as u128;
    }
    rem as u64
}

fn negate(limbs: &mut I256) {
    let mut carry = true;
    for limb in limbs.iter_mut() {
        let (v, c) = (!*limb).overflowing_add(carry as u64);
        *limb = v;
        carry = c;
    }
}

impl FromStr for Decimal {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseDecimalError(s.to_string());
        let trimmed = s.trim();
        let (negative, body) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let mut digits = String::with_capacity(int_part.len() + frac_part.len());
        digits.push_str(int_part);
        digits.push_str(frac_part);
        Ok(Self::from_parts(negative, &digits, frac_part.len() as u32))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        let scale = self.scale as usize;
        if scale == 0 {
            return f.write_str(&self.digits);
        }
        if self.digits.len() > scale {
            let (int_part, frac_part) = self.digits.split_at(self.digits.len() - scale);
            write!(f, "{}.{}", int_part, frac_part)
        } else {
            write!(f, "0.{:0>width$}", self.digits, width = scale)
        }
    }
}

macro_rules! decimal_from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for Decimal {
            fn from(v: $t) -> Self {
                Decimal::from_i128_scaled(v as i128, 0)
            }
        }
    )*};
}

decimal_from_int!(i8, i16, i32, i64, u8, u16, u32, u64);
