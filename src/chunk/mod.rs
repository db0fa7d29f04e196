//! A `Chunk` is a compressed, fixed-length slice `[start, start + len)` of
//! one column. Chunks are built by appending to a [`NewChunk`] and calling
//! [`NewChunk::close`], which picks the narrowest exact encoding. Once
//! published, a chunk is read concurrently; the only mutation allowed is a
//! `set`, which writes in place when the current encoding can hold the new
//! value and otherwise *inflates* the chunk to a wider encoding.
use crate::codec::{Codec, Encoded};
use crate::error::LiquidError;
use deepsize::{Context, DeepSizeOf};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

mod new_chunk;
pub use new_chunk::NewChunk;

/// A single value read from, or written to, a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Data {
    Int(i64),
    Float(f64),
    /// A category code, an index into the domain of a categorical column
    Cat(u32),
    Str(String),
    Null,
}

/// A compressed slice of one column. See the [module level
/// documentation](crate::chunk) for the life cycle of a chunk.
#[derive(Debug, Serialize, Deserialize)]
#[serde(from = "ChunkRepr", into = "ChunkRepr")]
pub struct Chunk {
    cidx: usize,
    start: usize,
    len: usize,
    data: RwLock<Encoded>,
    /// Advanced by every write, widenings compare-and-swap on it
    version: AtomicU64,
    inflations: AtomicU64,
}

/// The serialized form of a `Chunk`
#[derive(Serialize, Deserialize)]
struct ChunkRepr {
    cidx: usize,
    start: usize,
    data: Encoded,
}

impl From<ChunkRepr> for Chunk {
    fn from(repr: ChunkRepr) -> Self {
        Chunk::new(repr.cidx, repr.start, repr.data)
    }
}

impl From<Chunk> for ChunkRepr {
    fn from(chunk: Chunk) -> Self {
        ChunkRepr {
            cidx: chunk.cidx,
            start: chunk.start,
            data: chunk.data.into_inner(),
        }
    }
}

impl Clone for Chunk {
    fn clone(&self) -> Self {
        Chunk::new(self.cidx, self.start, self.data.read().clone())
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.cidx == other.cidx
            && self.start == other.start
            && *self.data.read() == *other.data.read()
    }
}

impl DeepSizeOf for Chunk {
    fn deep_size_of_children(&self, context: &mut Context) -> usize {
        self.data.read().deep_size_of_children(context)
    }
}

impl Chunk {
    pub(crate) fn new(cidx: usize, start: usize, data: Encoded) -> Self {
        Chunk {
            cidx,
            start,
            len: data.len(),
            data: RwLock::new(data),
            version: AtomicU64::new(0),
            inflations: AtomicU64::new(0),
        }
    }

    /// The index of this chunk within its column
    pub fn cidx(&self) -> usize {
        self.cidx
    }

    /// The global row index of the first row of this chunk
    pub fn start(&self) -> usize {
        self.start
    }

    /// The number of rows in this chunk
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The encoding currently used by this chunk
    pub fn codec(&self) -> Codec {
        self.data.read().codec()
    }

    /// The number of bits used to store each value, `0` for a constant
    pub fn bits_per_value(&self) -> usize {
        self.data.read().bits_per_value()
    }

    /// The number of writes to this chunk so far, in place or not
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// How many times a write forced this chunk into a wider encoding
    pub fn inflations(&self) -> u64 {
        self.inflations.load(Ordering::Acquire)
    }

    fn check_row(&self, row: usize) -> Result<(), LiquidError> {
        if row < self.len {
            Ok(())
        } else {
            Err(LiquidError::RowIndexOutOfBounds)
        }
    }

    /// Reads the `Data` at the given `row`, relative to the start of this
    /// chunk. Integral numeric values are returned as `Data::Int` when they
    /// are exact as one, and as `Data::Float` otherwise.
    pub fn at(&self, row: usize) -> Result<Data, LiquidError> {
        self.check_row(row)?;
        Ok(self.data.read().at_data(row))
    }

    /// Reads the value at `row` as an integer. Reading a missing value is an
    /// error, as is reading a string or a number outside the `i64` range.
    pub fn at8(&self, row: usize) -> Result<i64, LiquidError> {
        self.check_row(row)?;
        let data = self.data.read();
        if let Encoded::Str { .. } = &*data {
            return Err(LiquidError::TypeMismatch);
        }
        if data.is_na(row) {
            return Err(LiquidError::MissingValue(self.start + row));
        }
        data.at8(row).ok_or(LiquidError::TypeMismatch)
    }

    /// Reads the value at `row` as a double, `NaN` when missing
    pub fn atd(&self, row: usize) -> Result<f64, LiquidError> {
        self.check_row(row)?;
        Ok(self.data.read().atd(row))
    }

    pub fn is_na(&self, row: usize) -> Result<bool, LiquidError> {
        self.check_row(row)?;
        Ok(self.data.read().is_na(row))
    }

    /// Reads the string at `row`, `None` when missing
    pub fn at_str(&self, row: usize) -> Result<Option<String>, LiquidError> {
        self.check_row(row)?;
        let data = self.data.read();
        match &*data {
            Encoded::Str { .. } => Ok(data.at_str(row).map(String::from)),
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    /// Decompresses every row to a double, missing values become `NaN`
    pub fn to_doubles(&self) -> Vec<f64> {
        let data = self.data.read();
        (0..self.len).map(|i| data.atd(i)).collect()
    }

    pub fn set_f64(&self, row: usize, value: f64) -> Result<(), LiquidError> {
        self.set(row, Data::Float(value))
    }

    pub fn set_i64(&self, row: usize, value: i64) -> Result<(), LiquidError> {
        self.set(row, Data::Int(value))
    }

    pub fn set_na(&self, row: usize) -> Result<(), LiquidError> {
        self.set(row, Data::Null)
    }

    pub fn set_category(&self, row: usize, code: u32) -> Result<(), LiquidError> {
        self.set(row, Data::Cat(code))
    }

    pub fn set_str(&self, row: usize, value: &str) -> Result<(), LiquidError> {
        self.set(row, Data::Str(value.to_string()))
    }

    /// Writes `value` at `row`. The write happens in place if the current
    /// encoding can hold `value` exactly. Otherwise the chunk is decoded,
    /// updated and re-compressed, and the wider encoding is swapped in if no
    /// other write landed in the meantime; a writer that loses that race
    /// retries against the chunk as it now is.
    pub fn set(&self, row: usize, value: Data) -> Result<(), LiquidError> {
        self.check_row(row)?;
        loop {
            let (observed, widened) = {
                let mut data = self.data.write();
                check_type(&data, &value)?;
                if data.try_set(row, &value) {
                    self.version.fetch_add(1, Ordering::AcqRel);
                    return Ok(());
                }
                let observed = self.version.load(Ordering::Acquire);
                let data = parking_lot::RwLockWriteGuard::downgrade(data);
                let mut nc = NewChunk::from_encoded(&data, self.cidx, self.start);
                nc.set(row, &value)?;
                (observed, nc.compress())
            };

            let mut data = self.data.write();
            if self
                .version
                .compare_exchange(
                    observed,
                    observed + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                *data = widened;
                self.inflations.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
        }
    }
}

fn check_type(data: &Encoded, value: &Data) -> Result<(), LiquidError> {
    let ok = match (data, value) {
        (_, Data::Null) => true,
        (Encoded::Categorical(_), Data::Cat(_)) => true,
        (Encoded::Str { .. }, Data::Str(_)) => true,
        (Encoded::Categorical(_), _) | (Encoded::Str { .. }, _) => false,
        (_, Data::Int(_)) | (_, Data::Float(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(LiquidError::TypeMismatch)
    }
}
