//! Helpers for decimal numbers held as a `(mantissa, exponent)` pair, where
//! the value is `mantissa * 10^exponent`.
//!
//! Ingestion hands values over in this form so that no binary rounding happens
//! before a `Chunk` is compressed. Every conversion to `f64` below rounds
//! exactly once, which is what lets a scaled chunk reproduce the double that a
//! parser would have produced for the same text.

/// Exact powers of ten that fit in an `i64`
const POW10: [i64; 19] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
];

/// The largest exponent magnitude used by the scaled codecs
pub(crate) const MAX_SCALE: i32 = 18;

/// Integers with a magnitude up to this bound convert to `f64` exactly
pub(crate) const MAX_EXACT_INT: i64 = 1 << 53;

/// Powers of ten up to `1e22` are exact in an `f64`
const MAX_EXACT_POW10: u32 = 22;

/// Returns `10^e` if it fits in an `i64`
pub(crate) fn pow10(e: u32) -> Option<i64> {
    POW10.get(e as usize).copied()
}

/// Folds trailing decimal zeros of the mantissa into the exponent, so that
/// `(1200, -2)` becomes `(12, 0)`. Zero always normalizes to `(0, 0)`.
/// Folding stops early if the exponent would overflow.
pub(crate) fn normalize(mut mantissa: i64, mut exponent: i32) -> (i64, i32) {
    if mantissa == 0 {
        return (0, 0);
    }
    while mantissa % 10 == 0 {
        match exponent.checked_add(1) {
            Some(e) => exponent = e,
            None => break,
        }
        mantissa /= 10;
    }
    (mantissa, exponent)
}

/// Rescales `mantissa * 10^exponent` to the (smaller or equal) exponent
/// `target`, returning the new mantissa or `None` on overflow.
pub(crate) fn rescale(mantissa: i64, exponent: i32, target: i32) -> Option<i64> {
    if exponent < target {
        return None;
    }
    let diff = u32::try_from(i64::from(exponent) - i64::from(target)).ok()?;
    mantissa.checked_mul(pow10(diff)?)
}

/// Converts a decimal to the nearest `f64`
pub(crate) fn to_f64(mantissa: i64, exponent: i32) -> f64 {
    if mantissa.unsigned_abs() <= MAX_EXACT_INT as u64
        && exponent.unsigned_abs() <= MAX_EXACT_POW10
    {
        let m = mantissa as f64;
        let p = 10f64.powi(exponent.unsigned_abs() as i32);
        if exponent < 0 {
            m / p
        } else {
            m * p
        }
    } else {
        // the standard library parser is correctly rounded
        format!("{}e{}", mantissa, exponent)
            .parse()
            .unwrap_or(f64::NAN)
    }
}

/// Finds the shortest decimal that converts back to exactly `value`. Returns
/// `None` for non-finite values, negative zero and anything whose shortest
/// form does not fit in an `i64` mantissa.
pub(crate) fn from_f64(value: f64) -> Option<(i64, i32)> {
    if !value.is_finite() || (value == 0.0 && value.is_sign_negative()) {
        return None;
    }
    // `{:e}` prints the shortest representation that round-trips
    let text = format!("{:e}", value);
    let (digits, exp) = text.split_once('e')?;
    let exp: i32 = exp.parse().ok()?;
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    let mantissa: i64 = format!("{}{}", int_part, frac_part).parse().ok()?;
    let exponent = exp - frac_part.len() as i32;
    let (mantissa, exponent) = normalize(mantissa, exponent);
    if to_f64(mantissa, exponent).to_bits() == value.to_bits() {
        Some((mantissa, exponent))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(1200, -2), (12, 0));
        assert_eq!(normalize(0, -7), (0, 0));
        assert_eq!(normalize(-30, 1), (-3, 2));
        assert_eq!(normalize(17, -3), (17, -3));
    }

    #[test]
    fn test_extreme_exponents() {
        assert_eq!(normalize(10, i32::MAX), (10, i32::MAX));
        assert_eq!(normalize(100, i32::MAX - 1), (10, i32::MAX));
        assert_eq!(to_f64(1, i32::MIN), 0.0);
        assert_eq!(to_f64(i64::MIN, 0), i64::MIN as f64);
        assert_eq!(to_f64(1, i32::MAX), f64::INFINITY);
        assert_eq!(rescale(1, i32::MAX, i32::MIN), None);
    }

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(12, 0, -2), Some(1200));
        assert_eq!(rescale(12, -2, 0), None);
        assert_eq!(rescale(i64::MAX, 1, 0), None);
    }

    #[test]
    fn test_to_f64_matches_parser() {
        assert_eq!(to_f64(1, -1), 0.1);
        assert_eq!(to_f64(123, -2), 1.23);
        assert_eq!(to_f64(-5, 3), -5000.0);
        assert_eq!(to_f64(7, -30), "7e-30".parse::<f64>().unwrap());
    }

    #[test]
    fn test_from_f64() {
        assert_eq!(from_f64(0.1), Some((1, -1)));
        assert_eq!(from_f64(1.25), Some((125, -2)));
        assert_eq!(from_f64(1500.0), Some((15, 2)));
        assert_eq!(from_f64(0.0), Some((0, 0)));
        assert_eq!(from_f64(-0.0), None);
        assert_eq!(from_f64(f64::NAN), None);
        let third = 1.0 / 3.0;
        let (m, e) = from_f64(third).unwrap();
        assert_eq!(to_f64(m, e), third);
    }
}
