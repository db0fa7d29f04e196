//! Picks the narrowest [`Encoded`] form that holds a batch of values exactly.
use super::decimal::{self, MAX_EXACT_INT, MAX_SCALE};
use super::{Encoded, Num, BITS_NA, BYTE_NA, INT_NA, LONG_NA, SCALED_BYTE_NA, SHORT_NA, STR_NA_BIT};

/// A batch is stored sparsely when fewer than one row in this many differs
/// from the fill value
const SPARSE_RATIO: usize = 8;

/// Compresses a batch of numeric values.
///
/// Mostly-zero and mostly-missing batches are stored as [`Encoded::Sparse`],
/// with the remaining rows compressed on their own. Otherwise values are
/// first brought to a common decimal exponent. Integers then try,
/// in order: constant, bits, byte, scaled byte, short, scaled short, int,
/// float, long. Fractional decimals try the scaled forms, then float. Any
/// batch that can't be expressed as exact decimals (or that overflows the
/// scaled forms) is stored as floats when every value survives the trip to
/// `f32` and as doubles otherwise.
pub(crate) fn compress_numeric(values: &[Num]) -> Encoded {
    compress_sparse(values).unwrap_or_else(|| compress_dense(values))
}

fn is_missing(v: Num) -> bool {
    match v {
        Num::Na => true,
        Num::Dbl(d) => d.is_nan(),
        Num::Dec(..) => false,
    }
}

/// Only a positive zero may be left out of a sparse buffer
fn is_zero(v: Num) -> bool {
    match v {
        Num::Dec(m, _) => m == 0,
        Num::Dbl(d) => d.to_bits() == 0,
        Num::Na => false,
    }
}

fn compress_sparse(values: &[Num]) -> Option<Encoded> {
    let len = values.len();
    if u32::try_from(len).is_err() {
        return None;
    }
    let n_na = values.iter().filter(|v| is_missing(**v)).count();
    let n_nz = values
        .iter()
        .filter(|v| !is_missing(**v) && !is_zero(**v))
        .count();
    // all missing or all zero is a constant
    if n_na == len || n_na + n_nz == 0 {
        return None;
    }
    let na_fill = if SPARSE_RATIO * (n_na + n_nz) < len {
        false
    } else if SPARSE_RATIO * (len - n_na) < len {
        true
    } else {
        return None;
    };
    let (rows, kept): (Vec<u32>, Vec<Num>) = values
        .iter()
        .enumerate()
        .filter(|(_, v)| {
            if na_fill {
                !is_missing(**v)
            } else {
                is_missing(**v) || !is_zero(**v)
            }
        })
        .map(|(i, v)| (i as u32, *v))
        .unzip();
    Some(Encoded::Sparse {
        len,
        rows,
        values: Box::new(compress_dense(&kept)),
        na_fill,
    })
}

fn compress_dense(values: &[Num]) -> Encoded {
    let len = values.len();
    let mut decimals = Vec::with_capacity(len);
    let mut n_na = 0;
    for v in values {
        let d = match *v {
            Num::Na => None,
            Num::Dbl(d) if d.is_nan() => None,
            Num::Dec(m, e) => Some(decimal::normalize(m, e)),
            Num::Dbl(d) => match decimal::from_f64(d) {
                Some(dec) => Some(dec),
                None => return compress_doubles(values),
            },
        };
        if d.is_none() {
            n_na += 1;
        }
        decimals.push(d);
    }

    if n_na == len {
        return Encoded::Constant {
            value: f64::NAN,
            len,
        };
    }
    if n_na == 0 {
        let first = decimals[0];
        if decimals.iter().all(|d| *d == first) {
            if let Some((m, e)) = first {
                return Encoded::Constant {
                    value: decimal::to_f64(m, e),
                    len,
                };
            }
        }
    }

    // zero normalizes to (0, 0) and fits any exponent
    let exp = decimals
        .iter()
        .flatten()
        .filter(|(m, _)| *m != 0)
        .map(|(_, e)| *e)
        .min()
        .unwrap_or(0);
    if exp < -MAX_SCALE {
        return compress_doubles(values);
    }
    let mut scaled = Vec::with_capacity(len);
    for d in &decimals {
        let q = match d {
            None => None,
            Some((0, _)) => Some(0),
            Some((m, e)) => match decimal::rescale(*m, *e, exp) {
                Some(q) => Some(q),
                None => return compress_doubles(values),
            },
        };
        scaled.push(q);
    }

    if exp >= 0 {
        compress_ints(&scaled, exp, values)
    } else {
        compress_fractions(&scaled, exp, values)
    }
}

/// Bounds of the present values, which must not all be missing
fn bounds(scaled: &[Option<i64>]) -> (i64, i64) {
    scaled
        .iter()
        .flatten()
        .fold((i64::MAX, i64::MIN), |(lo, hi), q| (lo.min(*q), hi.max(*q)))
}

/// `scaled` holds `value / 10^exp` for every present value, with `exp >= 0`
fn compress_ints(scaled: &[Option<i64>], exp: i32, values: &[Num]) -> Encoded {
    let (qmin, qmax) = bounds(scaled);
    let has_na = scaled.iter().any(Option::is_none);
    let ints = if exp == 0 {
        scaled.to_vec()
    } else {
        let mut ints = Vec::with_capacity(scaled.len());
        for q in scaled {
            match q.map(|q| decimal::rescale(q, exp, 0)) {
                None => ints.push(None),
                Some(Some(v)) => ints.push(Some(v)),
                Some(None) => return compress_doubles(values),
            }
        }
        ints
    };
    let (min, max) = bounds(&ints);

    if min >= 0 && max <= 1 {
        return pack_bits(&ints, has_na);
    }
    if min >= -127 && max <= 127 {
        return Encoded::Byte(narrow(&ints, BYTE_NA, |v| v as i8));
    }
    if let Some(enc) = scaled_byte(scaled, qmin, qmax, exp) {
        return enc;
    }
    if min >= -32767 && max <= 32767 {
        return Encoded::Short(narrow(&ints, SHORT_NA, |v| v as i16));
    }
    if let Some(enc) = scaled_short(scaled, qmin, qmax, exp) {
        return enc;
    }
    if min > i32::MIN as i64 && max <= i32::MAX as i64 {
        return Encoded::Int(narrow(&ints, INT_NA, |v| v as i32));
    }
    if ints.iter().flatten().all(|v| int_is_f32(*v)) {
        return Encoded::Float(ints.iter().map(|v| v.map_or(f32::NAN, |v| v as f32)).collect());
    }
    if min == i64::MIN {
        // the sentinel is taken by a value
        return compress_doubles(values);
    }
    Encoded::Long(narrow(&ints, LONG_NA, |v| v))
}

/// `scaled` holds `value * 10^-exp` for every present value, with `exp < 0`
fn compress_fractions(scaled: &[Option<i64>], exp: i32, values: &[Num]) -> Encoded {
    let (qmin, qmax) = bounds(scaled);
    if qmin < -MAX_EXACT_INT || qmax > MAX_EXACT_INT {
        return compress_doubles(values);
    }
    if let Some(enc) = scaled_byte(scaled, qmin, qmax, exp) {
        return enc;
    }
    if let Some(enc) = scaled_short(scaled, qmin, qmax, exp) {
        return enc;
    }
    compress_doubles(values)
}

fn scaled_byte(scaled: &[Option<i64>], qmin: i64, qmax: i64, exp: i32) -> Option<Encoded> {
    if exp > MAX_SCALE || qmax.checked_sub(qmin)? > 254 {
        return None;
    }
    let data = scaled
        .iter()
        .map(|q| q.map_or(SCALED_BYTE_NA, |q| (q - qmin) as u8))
        .collect();
    Some(Encoded::ScaledByte {
        data,
        bias: qmin,
        exp,
    })
}

fn scaled_short(scaled: &[Option<i64>], qmin: i64, qmax: i64, exp: i32) -> Option<Encoded> {
    if exp > MAX_SCALE || qmax.checked_sub(qmin)? > 65534 {
        return None;
    }
    let bias = qmin + 32767;
    let data = scaled
        .iter()
        .map(|q| q.map_or(SHORT_NA, |q| (q - bias) as i16))
        .collect();
    Some(Encoded::ScaledShort { data, bias, exp })
}

/// The fallback for anything without an exact decimal form
fn compress_doubles(values: &[Num]) -> Encoded {
    let doubles: Vec<f64> = values
        .iter()
        .map(|v| match *v {
            Num::Na => f64::NAN,
            Num::Dec(m, e) => decimal::to_f64(m, e),
            Num::Dbl(d) => d,
        })
        .collect();
    let len = doubles.len();
    if let Some(first) = doubles.first() {
        if !first.is_nan() && doubles.iter().all(|d| d.to_bits() == first.to_bits()) {
            return Encoded::Constant { value: *first, len };
        }
    }
    if doubles.iter().all(|d| d.is_nan() || f32_exact(*d)) {
        Encoded::Float(doubles.iter().map(|d| *d as f32).collect())
    } else {
        Encoded::Double(doubles)
    }
}

/// Compresses category codes with the numeric selector
pub(crate) fn compress_categorical(codes: &[Option<u32>]) -> Encoded {
    let nums: Vec<Num> = codes
        .iter()
        .map(|c| c.map_or(Num::Na, |c| Num::Dec(c as i64, 0)))
        .collect();
    Encoded::Categorical(Box::new(compress_numeric(&nums)))
}

/// Packs strings into one heap. The heap must stay below 2 GiB, one `Chunk`
/// holds far less than that.
pub(crate) fn compress_strings(values: &[Option<String>]) -> Encoded {
    let mut offsets = Vec::with_capacity(values.len());
    let mut heap = Vec::new();
    for v in values {
        match v {
            Some(s) => {
                offsets.push(heap.len() as u32);
                heap.extend_from_slice(s.as_bytes());
            }
            None => offsets.push(heap.len() as u32 | STR_NA_BIT),
        }
    }
    Encoded::Str { offsets, heap }
}

fn f32_exact(d: f64) -> bool {
    (d as f32) as f64 == d
}

fn int_is_f32(v: i64) -> bool {
    let d = v as f64;
    // 2^63 saturates back to i64::MAX
    d < 9.223_372_036_854_775_808e18 && d as i64 == v && f32_exact(d)
}

fn narrow<T: Copy>(ints: &[Option<i64>], na: T, cast: impl Fn(i64) -> T) -> Vec<T> {
    ints.iter().map(|v| v.map_or(na, &cast)).collect()
}

fn pack_bits(ints: &[Option<i64>], nullable: bool) -> Encoded {
    let len = ints.len();
    let bytes = if nullable {
        let mut bytes = vec![0u8; (len + 3) / 4];
        for (i, v) in ints.iter().enumerate() {
            let code = v.map_or(BITS_NA, |v| v as u8);
            bytes[i >> 2] |= code << ((i & 3) << 1);
        }
        bytes
    } else {
        let mut bytes = vec![0u8; (len + 7) / 8];
        for (i, v) in ints.iter().enumerate() {
            if *v == Some(1) {
                bytes[i >> 3] |= 1 << (i & 7);
            }
        }
        bytes
    };
    Encoded::Bits {
        bytes,
        len,
        nullable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;

    fn ints(values: &[i64]) -> Vec<Num> {
        values.iter().map(|v| Num::Dec(*v, 0)).collect()
    }

    fn doubles(values: &[f64]) -> Vec<Num> {
        values.iter().map(|v| Num::Dbl(*v)).collect()
    }

    fn assert_round_trip(values: &[Num], enc: &Encoded) {
        assert_eq!(enc.len(), values.len());
        for (i, v) in values.iter().enumerate() {
            match *v {
                Num::Na => assert!(enc.is_na(i), "row {} should be missing", i),
                Num::Dbl(d) if d.is_nan() => assert!(enc.is_na(i)),
                Num::Dec(m, e) => {
                    assert_eq!(enc.atd(i), decimal::to_f64(m, e), "row {}", i)
                }
                Num::Dbl(d) => assert_eq!(enc.atd(i).to_bits(), d.to_bits(), "row {}", i),
            }
        }
    }

    #[test]
    fn test_constant() {
        let values = ints(&[42; 1000]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Constant);
        assert_eq!(enc.bits_per_value(), 0);
        assert_round_trip(&values, &enc);

        let enc = compress_numeric(&[Num::Na, Num::Na]);
        assert_eq!(enc.codec(), Codec::Constant);
        assert!(enc.is_na(1));
    }

    #[test]
    fn test_bits() {
        let values = ints(&[0, 1, 1, 0, 1, 0, 0, 0, 1, 1]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Bits);
        assert_eq!(enc.bits_per_value(), 1);
        assert_round_trip(&values, &enc);

        let mut with_na = values.clone();
        with_na[4] = Num::Na;
        let enc = compress_numeric(&with_na);
        assert_eq!(enc.codec(), Codec::Bits);
        assert_eq!(enc.bits_per_value(), 2);
        assert_round_trip(&with_na, &enc);
    }

    #[test]
    fn test_integer_widths() {
        let cases: Vec<(Vec<i64>, Codec)> = vec![
            (vec![-127, 0, 127], Codec::Byte),
            (vec![0, 128], Codec::ScaledByte),
            (vec![40_000, 40_100], Codec::ScaledByte),
            (vec![-200, 200], Codec::Short),
            (vec![-32767, 32767], Codec::Short),
            (vec![0, 40_000], Codec::ScaledShort),
            (vec![0, 70_000], Codec::Int),
            (vec![i32::MIN as i64 + 1, i32::MAX as i64], Codec::Int),
            (vec![0, 1 << 40], Codec::Float),
            (vec![0, (1 << 40) + 1], Codec::Long),
            (vec![i64::MIN + 1, i64::MAX], Codec::Long),
        ];
        for (values, codec) in cases {
            let mut nums = ints(&values);
            nums.push(Num::Na);
            let enc = compress_numeric(&nums);
            assert_eq!(enc.codec(), codec, "{:?}", values);
            for (i, v) in values.iter().enumerate() {
                assert_eq!(enc.at8(i), Some(*v), "{:?}", values);
            }
            assert!(enc.is_na(values.len()));
        }
    }

    #[test]
    fn test_positive_exponent() {
        let values = ints(&[1_000_000, 2_000_000, 250_000_000]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::ScaledByte);
        assert_eq!(enc.at8(2), Some(250_000_000));
        assert_round_trip(&values, &enc);
    }

    #[test]
    fn test_long_min_escalates() {
        let values = ints(&[i64::MIN, 0, (1 << 40) + 1]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Double);
        assert_eq!(enc.atd(0), i64::MIN as f64);
        assert_eq!(enc.at8(2), Some((1 << 40) + 1));
    }

    #[test]
    fn test_fractions() {
        let values = vec![Num::Dec(15, -1), Num::Dec(225, -2), Num::Na, Num::Dec(3, 0)];
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::ScaledByte);
        assert_round_trip(&values, &enc);

        let values = doubles(&[0.1, 1000.5, 3.7]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::ScaledShort);
        assert_round_trip(&values, &enc);

        let values = doubles(&[0.1, 1_000_000.1]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Double);
        assert_round_trip(&values, &enc);

        let values = doubles(&[0.5, 0.25, 1e6]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Float);
        assert_round_trip(&values, &enc);
    }

    #[test]
    fn test_doubles_that_are_not_decimals() {
        let values = doubles(&[1.0 / 3.0, std::f64::consts::PI, f64::NAN, 1e300]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Double);
        assert_round_trip(&values, &enc);

        let values = doubles(&[f64::INFINITY, 1.0]);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Float);
        assert_eq!(enc.atd(0), f64::INFINITY);
    }

    #[test]
    fn test_categorical() {
        let enc = compress_categorical(&[Some(0), Some(1), None, Some(1)]);
        assert_eq!(enc.codec(), Codec::Categorical);
        assert_eq!(enc.bits_per_value(), 2);
        assert_eq!(enc.at8(1), Some(1));
        assert!(enc.is_na(2));

        let enc = compress_categorical(&[Some(3), Some(90)]);
        assert_eq!(enc.bits_per_value(), 8);
    }

    #[test]
    fn test_sparse_zero() {
        let mut values = ints(&[0; 100]);
        values[10] = Num::Dec(5, 0);
        values[60] = Num::Na;
        values[99] = Num::Dec(-300, 0);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Sparse);
        assert_round_trip(&values, &enc);
        match &enc {
            Encoded::Sparse {
                rows,
                values,
                na_fill,
                ..
            } => {
                assert_eq!(rows, &vec![10, 60, 99]);
                assert_eq!(values.codec(), Codec::Short);
                assert!(!na_fill);
            }
            other => panic!("not sparse: {:?}", other),
        }
    }

    #[test]
    fn test_sparse_missing() {
        let mut values = vec![Num::Na; 64];
        values[0] = Num::Dbl(0.5);
        values[33] = Num::Dbl(0.0);
        let enc = compress_numeric(&values);
        assert_eq!(enc.codec(), Codec::Sparse);
        assert_round_trip(&values, &enc);
        assert!(matches!(enc, Encoded::Sparse { na_fill: true, .. }));
    }

    #[test]
    fn test_sparse_threshold() {
        // 1 in 8 rows set is not below the ratio
        let values: Vec<Num> = (0..80)
            .map(|i| Num::Dec(if i % 8 == 0 { 3 } else { 0 }, 0))
            .collect();
        assert_eq!(compress_numeric(&values).codec(), Codec::Byte);
        assert_eq!(compress_numeric(&ints(&[0; 50])).codec(), Codec::Constant);

        let codes: Vec<Option<u32>> = (0..90).map(|i| if i == 4 { Some(2) } else { Some(0) }).collect();
        let enc = compress_categorical(&codes);
        assert_eq!(enc.codec(), Codec::Categorical);
        assert_eq!(enc.at8(4), Some(2));
        assert_eq!(enc.at8(5), Some(0));
    }

    #[test]
    fn test_strings() {
        let values = vec![Some("a".to_string()), None, Some(String::new()), Some("xyz".into())];
        let enc = compress_strings(&values);
        assert_eq!(enc.at_str(0), Some("a"));
        assert_eq!(enc.at_str(1), None);
        assert_eq!(enc.at_str(2), Some(""));
        assert_eq!(enc.at_str(3), Some("xyz"));
    }
}
