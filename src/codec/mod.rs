//! Fixed-width binary encodings for the values of one `Chunk`.
//!
//! The set of encodings is closed: an [`Encoded`] buffer is one of the
//! variants below, and every read or write is a `match` over them. Each
//! variant reserves a sentinel bit pattern for missing values that no value
//! it can represent uses.
//!
//! | Variant       | Width          | Value                        | Missing     |
//! |---------------|----------------|------------------------------|-------------|
//! | `Constant`    | O(1)           | one `f64` for every row      | `NaN`       |
//! | `Bits`        | 1 (2 with NAs) | `0` / `1`                    | `0b11`      |
//! | `Byte`        | 8              | `i8` in `[-127, 127]`        | `i8::MIN`   |
//! | `ScaledByte`  | 8              | `(u8 + bias) * 10^exp`       | `u8::MAX`   |
//! | `Short`       | 16             | `i16` in `[-32767, 32767]`   | `i16::MIN`  |
//! | `ScaledShort` | 16             | `(i16 + bias) * 10^exp`      | `i16::MIN`  |
//! | `Int`         | 32             | `i32`                        | `i32::MIN`  |
//! | `Float`       | 32             | `f32` that is exactly the value | `NaN`    |
//! | `Long`        | 64             | `i64`                        | `i64::MIN`  |
//! | `Double`      | 64             | `f64`                        | `NaN`       |
//! | `Categorical` | inner          | category codes               | inner       |
//! | `Str`         | offsets + heap | UTF-8 strings                | high bit    |
//! | `Sparse`      | listed rows    | zero (or missing) elsewhere  | fill / inner |
//!
//! [`compress`](select::compress_numeric) picks the narrowest of these that
//! reproduces a batch of values exactly. A batch where fewer than one row in
//! eight differs from zero (or from missing) keeps only those rows, as a
//! dense buffer of their own.
use crate::chunk::Data;
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};

pub(crate) mod decimal;
pub(crate) mod select;

pub(crate) use select::{compress_categorical, compress_numeric, compress_strings};

/// A numeric value staged for compression
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Num {
    /// A missing value
    Na,
    /// `mantissa * 10^exponent`, exact
    Dec(i64, i32),
    /// A binary floating point value, `NaN` counts as missing
    Dbl(f64),
}

impl Num {
    /// The value as a double, `NaN` when missing
    pub(crate) fn to_f64(self) -> f64 {
        match self {
            Num::Na => f64::NAN,
            Num::Dec(m, e) => decimal::to_f64(m, e),
            Num::Dbl(d) => d,
        }
    }
}

/// The tag of an [`Encoded`] buffer, used to report which representation a
/// `Chunk` ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    Constant,
    Bits,
    Byte,
    ScaledByte,
    Short,
    ScaledShort,
    Int,
    Float,
    Long,
    Double,
    Categorical,
    Str,
    Sparse,
}

/// The compressed values of one `Chunk`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, DeepSizeOf)]
pub enum Encoded {
    /// Every row holds `value`; `NaN` means every row is missing
    Constant { value: f64, len: usize },
    /// Bit-packed `0`/`1` values, two bits per value when `nullable`
    Bits {
        bytes: Vec<u8>,
        len: usize,
        nullable: bool,
    },
    Byte(Vec<i8>),
    ScaledByte { data: Vec<u8>, bias: i64, exp: i32 },
    Short(Vec<i16>),
    ScaledShort { data: Vec<i16>, bias: i64, exp: i32 },
    Int(Vec<i32>),
    Float(Vec<f32>),
    Long(Vec<i64>),
    Double(Vec<f64>),
    /// Category codes, compressed like integers
    Categorical(Box<Encoded>),
    /// `offsets[i]` is the start of row `i` in `heap`, and a string ends
    /// where the next row starts. A missing row has the high bit of its
    /// offset set; its start is still valid, so the heap stays below 2 GiB.
    Str { offsets: Vec<u32>, heap: Vec<u8> },
    /// Only `rows` (sorted) are stored, in `values`. Every other row is zero,
    /// or missing when `na_fill` is set.
    Sparse {
        len: usize,
        rows: Vec<u32>,
        values: Box<Encoded>,
        na_fill: bool,
    },
}

const BYTE_NA: i8 = i8::MIN;
const SCALED_BYTE_NA: u8 = u8::MAX;
const SHORT_NA: i16 = i16::MIN;
const INT_NA: i32 = i32::MIN;
const LONG_NA: i64 = i64::MIN;
const STR_NA_BIT: u32 = 1 << 31;
const BITS_NA: u8 = 0b11;

impl Codec {
    /// The number of bits each value takes in this representation. Constant
    /// chunks take none, strings report the width of their offsets. The width
    /// of categorical and sparse chunks depends on what they wrap.
    pub fn bits_per_value(self) -> usize {
        match self {
            Codec::Constant => 0,
            Codec::Bits => 1,
            Codec::Byte | Codec::ScaledByte => 8,
            Codec::Short | Codec::ScaledShort => 16,
            Codec::Int | Codec::Float | Codec::Str => 32,
            Codec::Long | Codec::Double => 64,
            Codec::Categorical | Codec::Sparse => 0,
        }
    }
}

impl Encoded {
    /// The number of rows held in this buffer
    pub fn len(&self) -> usize {
        match self {
            Encoded::Constant { len, .. }
            | Encoded::Bits { len, .. }
            | Encoded::Sparse { len, .. } => *len,
            Encoded::Byte(d) => d.len(),
            Encoded::ScaledByte { data, .. } => data.len(),
            Encoded::Short(d) => d.len(),
            Encoded::ScaledShort { data, .. } => data.len(),
            Encoded::Int(d) => d.len(),
            Encoded::Float(d) => d.len(),
            Encoded::Long(d) => d.len(),
            Encoded::Double(d) => d.len(),
            Encoded::Categorical(inner) => inner.len(),
            Encoded::Str { offsets, .. } => offsets.len(),
        }
    }

    /// Whether this buffer holds no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The tag of this representation
    pub fn codec(&self) -> Codec {
        match self {
            Encoded::Constant { .. } => Codec::Constant,
            Encoded::Bits { .. } => Codec::Bits,
            Encoded::Byte(_) => Codec::Byte,
            Encoded::ScaledByte { .. } => Codec::ScaledByte,
            Encoded::Short(_) => Codec::Short,
            Encoded::ScaledShort { .. } => Codec::ScaledShort,
            Encoded::Int(_) => Codec::Int,
            Encoded::Float(_) => Codec::Float,
            Encoded::Long(_) => Codec::Long,
            Encoded::Double(_) => Codec::Double,
            Encoded::Categorical(_) => Codec::Categorical,
            Encoded::Str { .. } => Codec::Str,
            Encoded::Sparse { .. } => Codec::Sparse,
        }
    }

    /// Bits used per value. Categoricals report the width of their codes,
    /// sparse buffers the width of each stored row.
    pub fn bits_per_value(&self) -> usize {
        match self {
            Encoded::Bits { nullable: true, .. } => 2,
            Encoded::Categorical(inner) => inner.bits_per_value(),
            Encoded::Sparse { values, .. } => values.bits_per_value(),
            other => other.codec().bits_per_value(),
        }
    }

    /// Whether the value at `idx` is missing. `idx` must be in bounds.
    pub fn is_na(&self, idx: usize) -> bool {
        match self {
            Encoded::Constant { value, .. } => value.is_nan(),
            Encoded::Bits { bytes, nullable, .. } => {
                *nullable && read_2b(bytes, idx) == BITS_NA
            }
            Encoded::Byte(d) => d[idx] == BYTE_NA,
            Encoded::ScaledByte { data, .. } => data[idx] == SCALED_BYTE_NA,
            Encoded::Short(d) => d[idx] == SHORT_NA,
            Encoded::ScaledShort { data, .. } => data[idx] == SHORT_NA,
            Encoded::Int(d) => d[idx] == INT_NA,
            Encoded::Float(d) => d[idx].is_nan(),
            Encoded::Long(d) => d[idx] == LONG_NA,
            Encoded::Double(d) => d[idx].is_nan(),
            Encoded::Categorical(inner) => inner.is_na(idx),
            Encoded::Str { offsets, .. } => offsets[idx] & STR_NA_BIT != 0,
            Encoded::Sparse {
                rows,
                values,
                na_fill,
                ..
            } => match sparse_pos(rows, idx) {
                Some(pos) => values.is_na(pos),
                None => *na_fill,
            },
        }
    }

    /// The value at `idx` as a double, `NaN` when missing. Strings always
    /// read as `NaN`. `idx` must be in bounds.
    pub fn atd(&self, idx: usize) -> f64 {
        if self.is_na(idx) {
            return f64::NAN;
        }
        match self {
            Encoded::Constant { value, .. } => *value,
            Encoded::Bits { bytes, nullable, .. } => {
                bit_at(bytes, idx, *nullable) as f64
            }
            Encoded::Byte(d) => d[idx] as f64,
            Encoded::ScaledByte { data, bias, exp } => {
                decimal::to_f64(data[idx] as i64 + bias, *exp)
            }
            Encoded::Short(d) => d[idx] as f64,
            Encoded::ScaledShort { data, bias, exp } => {
                decimal::to_f64(data[idx] as i64 + bias, *exp)
            }
            Encoded::Int(d) => d[idx] as f64,
            Encoded::Float(d) => d[idx] as f64,
            Encoded::Long(d) => d[idx] as f64,
            Encoded::Double(d) => d[idx],
            Encoded::Categorical(inner) => inner.atd(idx),
            Encoded::Str { .. } => f64::NAN,
            Encoded::Sparse { rows, values, .. } => {
                sparse_pos(rows, idx).map_or(0.0, |pos| values.atd(pos))
            }
        }
    }

    /// The value at `idx` as an integer, `None` when missing or outside the
    /// range of an `i64`. Fractional values are truncated toward zero. `idx`
    /// must be in bounds.
    pub fn at8(&self, idx: usize) -> Option<i64> {
        if self.is_na(idx) {
            return None;
        }
        match self {
            Encoded::Bits { bytes, nullable, .. } => {
                Some(bit_at(bytes, idx, *nullable) as i64)
            }
            Encoded::Byte(d) => Some(d[idx] as i64),
            Encoded::ScaledByte { data, bias, exp } if *exp >= 0 => {
                scaled_int(data[idx] as i64 + bias, *exp)
            }
            Encoded::Short(d) => Some(d[idx] as i64),
            Encoded::ScaledShort { data, bias, exp } if *exp >= 0 => {
                scaled_int(data[idx] as i64 + bias, *exp)
            }
            Encoded::Int(d) => Some(d[idx] as i64),
            Encoded::Long(d) => Some(d[idx]),
            Encoded::Categorical(inner) => inner.at8(idx),
            Encoded::Str { .. } => None,
            Encoded::Sparse { rows, values, .. } => match sparse_pos(rows, idx) {
                Some(pos) => values.at8(pos),
                None => Some(0),
            },
            other => {
                let d = other.atd(idx);
                // 2^63 would saturate to i64::MAX
                if d.is_finite() && d.abs() < 9.223_372_036_854_775_808e18 {
                    Some(d as i64)
                } else {
                    None
                }
            }
        }
    }

    /// The value at `idx` as `Data`. Numbers read as `Data::Int` when they
    /// are stored as integers, or as a constant that is exact in both an
    /// `i64` and an `f64`. `idx` must be in bounds.
    pub fn at_data(&self, idx: usize) -> Data {
        if self.is_na(idx) {
            return Data::Null;
        }
        match self {
            Encoded::Categorical(inner) => {
                inner.at8(idx).map_or(Data::Null, |c| Data::Cat(c as u32))
            }
            Encoded::Str { .. } => self
                .at_str(idx)
                .map_or(Data::Null, |s| Data::Str(s.to_string())),
            Encoded::Sparse { rows, values, .. } => match sparse_pos(rows, idx) {
                Some(pos) => values.at_data(pos),
                None => Data::Int(0),
            },
            Encoded::Float(_) | Encoded::Double(_) => Data::Float(self.atd(idx)),
            Encoded::ScaledByte { exp, .. } | Encoded::ScaledShort { exp, .. }
                if *exp < 0 =>
            {
                Data::Float(self.atd(idx))
            }
            Encoded::Constant { value, .. } => {
                if value.fract() == 0.0
                    && value.abs() <= decimal::MAX_EXACT_INT as f64
                {
                    Data::Int(*value as i64)
                } else {
                    Data::Float(*value)
                }
            }
            _ => match self.at8(idx) {
                Some(i) => Data::Int(i),
                None => Data::Float(self.atd(idx)),
            },
        }
    }

    /// The string at `idx`, `None` when missing or not a string buffer
    pub fn at_str(&self, idx: usize) -> Option<&str> {
        match self {
            Encoded::Str { offsets, heap } => {
                if offsets[idx] & STR_NA_BIT != 0 {
                    return None;
                }
                let (start, end) = str_slot(offsets, heap.len(), idx);
                std::str::from_utf8(&heap[start..end]).ok()
            }
            _ => None,
        }
    }

    /// The value at `idx` in a form that can be re-compressed without any
    /// loss. Used when inflating a chunk.
    pub(crate) fn num_at(&self, idx: usize) -> Num {
        if self.is_na(idx) {
            return Num::Na;
        }
        match self {
            Encoded::ScaledByte { data, bias, exp } => {
                Num::Dec(data[idx] as i64 + bias, *exp)
            }
            Encoded::ScaledShort { data, bias, exp } => {
                Num::Dec(data[idx] as i64 + bias, *exp)
            }
            Encoded::Constant { value, .. } => Num::Dbl(*value),
            Encoded::Float(_) | Encoded::Double(_) => Num::Dbl(self.atd(idx)),
            Encoded::Categorical(inner) => inner.num_at(idx),
            Encoded::Str { .. } => Num::Na,
            Encoded::Sparse { rows, values, .. } => match sparse_pos(rows, idx) {
                Some(pos) => values.num_at(pos),
                None => Num::Dec(0, 0),
            },
            other => match other.at8(idx) {
                Some(v) => Num::Dec(v, 0),
                None => Num::Na,
            },
        }
    }

    /// Writes `value` at `idx` if this representation can hold it exactly,
    /// returning `false` (and leaving the buffer untouched) otherwise. The
    /// caller is responsible for checking that the value matches the column
    /// type and that `idx` is in bounds.
    pub(crate) fn try_set(&mut self, idx: usize, value: &Data) -> bool {
        if let Encoded::Categorical(inner) = self {
            return match value {
                Data::Cat(code) => inner.try_set(idx, &Data::Int(*code as i64)),
                Data::Null => inner.try_set(idx, &Data::Null),
                _ => false,
            };
        }
        if let Encoded::Str { offsets, heap } = self {
            return match value {
                Data::Null => {
                    offsets[idx] |= STR_NA_BIT;
                    true
                }
                // only a string of the same byte length fits the slot
                Data::Str(s) => {
                    let (start, end) = str_slot(offsets, heap.len(), idx);
                    if s.len() != end - start {
                        return false;
                    }
                    heap[start..end].copy_from_slice(s.as_bytes());
                    offsets[idx] &= !STR_NA_BIT;
                    true
                }
                _ => false,
            };
        }
        let num = match value {
            Data::Null => Num::Na,
            Data::Int(i) => Num::Dec(*i, 0),
            Data::Float(f) if f.is_nan() => Num::Na,
            Data::Float(f) => Num::Dbl(*f),
            Data::Cat(_) | Data::Str(_) => return false,
        };
        self.try_set_num(idx, num)
    }

    fn try_set_num(&mut self, idx: usize, num: Num) -> bool {
        match self {
            Encoded::Constant { value, .. } => match num {
                Num::Na => value.is_nan(),
                other => other.to_f64().to_bits() == value.to_bits(),
            },
            Encoded::Bits {
                bytes, nullable, ..
            } => match (num, as_int(num)) {
                (Num::Na, _) if *nullable => {
                    write_2b(bytes, idx, BITS_NA);
                    true
                }
                (_, Some(b @ 0..=1)) => {
                    if *nullable {
                        write_2b(bytes, idx, b as u8);
                    } else {
                        write_1b(bytes, idx, b as u8);
                    }
                    true
                }
                _ => false,
            },
            Encoded::Byte(d) => {
                set_int(d, idx, num, BYTE_NA, -127, 127, |v| v as i8)
            }
            Encoded::Short(d) => {
                set_int(d, idx, num, SHORT_NA, -32767, 32767, |v| v as i16)
            }
            Encoded::Int(d) => set_int(
                d,
                idx,
                num,
                INT_NA,
                -(i32::MAX as i64),
                i32::MAX as i64,
                |v| v as i32,
            ),
            Encoded::Long(d) => {
                set_int(d, idx, num, LONG_NA, i64::MIN + 1, i64::MAX, |v| v)
            }
            Encoded::ScaledByte { data, bias, exp } => {
                if num == Num::Na {
                    data[idx] = SCALED_BYTE_NA;
                    return true;
                }
                match scaled_offset(num, *bias, *exp) {
                    Some(s @ 0..=254) => {
                        data[idx] = s as u8;
                        true
                    }
                    _ => false,
                }
            }
            Encoded::ScaledShort { data, bias, exp } => {
                if num == Num::Na {
                    data[idx] = SHORT_NA;
                    return true;
                }
                match scaled_offset(num, *bias, *exp) {
                    Some(s @ -32767..=32767) => {
                        data[idx] = s as i16;
                        true
                    }
                    _ => false,
                }
            }
            Encoded::Float(d) => {
                let v = num.to_f64();
                if num == Num::Na || (v as f32) as f64 == v {
                    d[idx] = v as f32;
                    true
                } else {
                    false
                }
            }
            Encoded::Double(d) => match num {
                Num::Dec(m, 0) if m.unsigned_abs() > decimal::MAX_EXACT_INT as u64 => {
                    false
                }
                other => {
                    d[idx] = other.to_f64();
                    true
                }
            },
            Encoded::Sparse {
                rows,
                values,
                na_fill,
                ..
            } => match sparse_pos(rows, idx) {
                Some(pos) => values.try_set_num(pos, num),
                None if *na_fill => num == Num::Na,
                // unlisted rows hold a positive zero
                None => num.to_f64().to_bits() == 0.0f64.to_bits(),
            },
            Encoded::Categorical(_) | Encoded::Str { .. } => false,
        }
    }
}

/// Where row `idx` of a sparse buffer is stored, if it is
fn sparse_pos(rows: &[u32], idx: usize) -> Option<usize> {
    u32::try_from(idx)
        .ok()
        .and_then(|idx| rows.binary_search(&idx).ok())
}

/// The byte range of row `idx` in a string heap
fn str_slot(offsets: &[u32], heap_len: usize, idx: usize) -> (usize, usize) {
    let start = (offsets[idx] & !STR_NA_BIT) as usize;
    let end = offsets
        .get(idx + 1)
        .map_or(heap_len, |o| (o & !STR_NA_BIT) as usize);
    (start, end)
}

/// The exact integer value of `num`, if it has one
fn as_int(num: Num) -> Option<i64> {
    match num {
        Num::Na => None,
        Num::Dec(m, e) => {
            let (m, e) = decimal::normalize(m, e);
            if e < 0 {
                None
            } else {
                m.checked_mul(decimal::pow10(e as u32)?)
            }
        }
        Num::Dbl(d) => {
            if d.fract() == 0.0 && d.abs() < 9.0e18 {
                Some(d as i64)
            } else {
                None
            }
        }
    }
}

fn set_int<T: Copy>(
    data: &mut [T],
    idx: usize,
    num: Num,
    na: T,
    lo: i64,
    hi: i64,
    cast: impl Fn(i64) -> T,
) -> bool {
    if num == Num::Na {
        data[idx] = na;
        return true;
    }
    match as_int(num) {
        Some(v) if lo <= v && v <= hi => {
            data[idx] = cast(v);
            true
        }
        _ => false,
    }
}

/// The stored offset for `num` in a scaled representation, or `None` when
/// `num` is not a multiple of `10^exp`
fn scaled_offset(num: Num, bias: i64, exp: i32) -> Option<i64> {
    let (m, e) = match num {
        Num::Na => return None,
        Num::Dec(m, e) => decimal::normalize(m, e),
        Num::Dbl(d) => decimal::from_f64(d)?,
    };
    let q = if m == 0 { 0 } else { decimal::rescale(m, e, exp)? };
    if q.unsigned_abs() > decimal::MAX_EXACT_INT as u64 {
        return None;
    }
    q.checked_sub(bias)
}

fn scaled_int(q: i64, exp: i32) -> Option<i64> {
    q.checked_mul(decimal::pow10(exp as u32)?)
}

fn bit_at(bytes: &[u8], idx: usize, nullable: bool) -> u8 {
    if nullable {
        read_2b(bytes, idx)
    } else {
        (bytes[idx >> 3] >> (idx & 7)) & 1
    }
}

fn read_2b(bytes: &[u8], idx: usize) -> u8 {
    (bytes[idx >> 2] >> ((idx & 3) << 1)) & 0b11
}

fn write_1b(bytes: &mut [u8], idx: usize, bit: u8) {
    let mask = 1 << (idx & 7);
    if bit == 0 {
        bytes[idx >> 3] &= !mask;
    } else {
        bytes[idx >> 3] |= mask;
    }
}

fn write_2b(bytes: &mut [u8], idx: usize, code: u8) {
    let shift = (idx & 3) << 1;
    let byte = &mut bytes[idx >> 2];
    *byte = (*byte & !(0b11 << shift)) | ((code & 0b11) << shift);
}
