//! Defines functionality for a `NewChunk`, the append-only builder of a
//! `Chunk`.
use crate::chunk::{Chunk, Data};
use crate::codec::{self, Encoded, Num};
use crate::column::ColumnType;
use crate::error::LiquidError;

/// The values staged in a `NewChunk` before compression
#[derive(Debug, Clone, PartialEq)]
enum Staged {
    Numeric(Vec<Num>),
    Categorical(Vec<Option<u32>>),
    Str(Vec<Option<String>>),
}

/// An open, append-only buffer of values for one chunk of a column. A
/// `NewChunk` has a single producer; [`close`](NewChunk::close) consumes it
/// and selects the narrowest exact encoding for what was appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    cidx: usize,
    start: usize,
    staged: Staged,
}

impl NewChunk {
    /// Creates an empty `NewChunk` that will hold values of the given type
    /// for the chunk at index `cidx`, whose first row is `start`.
    pub fn new(col_type: ColumnType, cidx: usize, start: usize) -> Self {
        let staged = match col_type {
            ColumnType::Numeric | ColumnType::Time => {
                Staged::Numeric(Vec::new())
            }
            ColumnType::Categorical => Staged::Categorical(Vec::new()),
            ColumnType::String => Staged::Str(Vec::new()),
        };
        NewChunk {
            cidx,
            start,
            staged,
        }
    }

    /// Decodes a compressed buffer back into an open `NewChunk`
    pub(crate) fn from_encoded(
        encoded: &Encoded,
        cidx: usize,
        start: usize,
    ) -> Self {
        let len = encoded.len();
        let staged = match encoded {
            Encoded::Categorical(inner) => Staged::Categorical(
                (0..len).map(|i| inner.at8(i).map(|c| c as u32)).collect(),
            ),
            Encoded::Str { .. } => Staged::Str(
                (0..len)
                    .map(|i| encoded.at_str(i).map(String::from))
                    .collect(),
            ),
            _ => Staged::Numeric((0..len).map(|i| encoded.num_at(i)).collect()),
        };
        NewChunk {
            cidx,
            start,
            staged,
        }
    }

    /// The index of the chunk this will become
    pub fn cidx(&self) -> usize {
        self.cidx
    }

    /// The number of values appended so far
    pub fn len(&self) -> usize {
        match &self.staged {
            Staged::Numeric(v) => v.len(),
            Staged::Categorical(v) => v.len(),
            Staged::Str(v) => v.len(),
        }
    }

    /// Whether nothing has been appended yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the exact decimal `mantissa * 10^exponent`. This is the form
    /// parsers should use, since it avoids rounding through binary floating
    /// point before an encoding is chosen.
    pub fn append_decimal(
        &mut self,
        mantissa: i64,
        exponent: i32,
    ) -> Result<(), LiquidError> {
        self.append_num(Num::Dec(mantissa, exponent))
    }

    /// Appends a double, `NaN` is stored as a missing value
    pub fn append_f64(&mut self, value: f64) -> Result<(), LiquidError> {
        self.append_num(Num::Dbl(value))
    }

    /// Appends an integer
    pub fn append_i64(&mut self, value: i64) -> Result<(), LiquidError> {
        self.append_num(Num::Dec(value, 0))
    }

    /// Appends a category code of a categorical column
    pub fn append_category(&mut self, code: u32) -> Result<(), LiquidError> {
        match &mut self.staged {
            Staged::Categorical(v) => {
                v.push(Some(code));
                Ok(())
            }
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    /// Appends a string to a string column
    pub fn append_str(&mut self, value: &str) -> Result<(), LiquidError> {
        match &mut self.staged {
            Staged::Str(v) => {
                v.push(Some(value.to_string()));
                Ok(())
            }
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    /// Appends a missing value, valid for every column type
    pub fn append_na(&mut self) {
        match &mut self.staged {
            Staged::Numeric(v) => v.push(Num::Na),
            Staged::Categorical(v) => v.push(None),
            Staged::Str(v) => v.push(None),
        }
    }

    /// Appends any `Data`, failing with `TypeMismatch` if it does not fit
    /// the type of this chunk.
    pub fn append(&mut self, data: Data) -> Result<(), LiquidError> {
        match data {
            Data::Int(i) => self.append_i64(i),
            Data::Float(f) => self.append_f64(f),
            Data::Cat(c) => self.append_category(c),
            Data::Str(s) => match &mut self.staged {
                Staged::Str(v) => {
                    v.push(Some(s));
                    Ok(())
                }
                _ => Err(LiquidError::TypeMismatch),
            },
            Data::Null => {
                self.append_na();
                Ok(())
            }
        }
    }

    fn append_num(&mut self, num: Num) -> Result<(), LiquidError> {
        match &mut self.staged {
            Staged::Numeric(v) => {
                v.push(num);
                Ok(())
            }
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    /// Overwrites the staged value at `row`, used when inflating a `Chunk`
    pub(crate) fn set(
        &mut self,
        row: usize,
        data: &Data,
    ) -> Result<(), LiquidError> {
        if row >= self.len() {
            return Err(LiquidError::RowIndexOutOfBounds);
        }
        match (&mut self.staged, data) {
            (Staged::Numeric(v), Data::Int(i)) => v[row] = Num::Dec(*i, 0),
            (Staged::Numeric(v), Data::Float(f)) => v[row] = Num::Dbl(*f),
            (Staged::Numeric(v), Data::Null) => v[row] = Num::Na,
            (Staged::Categorical(v), Data::Cat(c)) => v[row] = Some(*c),
            (Staged::Categorical(v), Data::Null) => v[row] = None,
            (Staged::Str(v), Data::Str(s)) => v[row] = Some(s.clone()),
            (Staged::Str(v), Data::Null) => v[row] = None,
            _ => return Err(LiquidError::TypeMismatch),
        }
        Ok(())
    }

    /// The largest category code appended, if any
    pub(crate) fn max_category(&self) -> Option<u32> {
        match &self.staged {
            Staged::Categorical(v) => v.iter().flatten().max().copied(),
            _ => None,
        }
    }

    /// Selects an encoding for the staged values
    pub(crate) fn compress(&self) -> Encoded {
        match &self.staged {
            Staged::Numeric(v) => codec::compress_numeric(v),
            Staged::Categorical(v) => codec::compress_categorical(v),
            Staged::Str(v) => codec::compress_strings(v),
        }
    }

    /// Compresses the appended values and freezes them into a `Chunk`
    pub fn close(self) -> Chunk {
        Chunk::new(self.cidx, self.start, self.compress())
    }
}
