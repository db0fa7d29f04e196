//! Defines the row partitioning of a `Column` into chunks.
use crate::error::LiquidError;
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The row boundaries of the chunks of a column: chunk `i` holds rows
/// `espc[i]..espc[i + 1]`. The first boundary is always `0` and the last is
/// the number of rows, so chunk ranges are contiguous and never overlap.
/// Chunks may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, DeepSizeOf)]
pub struct Layout {
    espc: Vec<usize>,
}

impl Layout {
    /// Creates a `Layout` from its boundaries, which must start at `0` and
    /// never decrease.
    pub fn new(espc: Vec<usize>) -> Result<Self, LiquidError> {
        if espc.first() != Some(&0) || espc.windows(2).any(|w| w[0] > w[1]) {
            return Err(LiquidError::IncompatiblePartitioning);
        }
        Ok(Layout { espc })
    }

    /// Creates a `Layout` with one chunk of each given length
    pub fn from_chunk_lens(lens: &[usize]) -> Self {
        let mut espc = Vec::with_capacity(lens.len() + 1);
        espc.push(0);
        let mut total = 0;
        for len in lens {
            total += len;
            espc.push(total);
        }
        Layout { espc }
    }

    /// Splits `n_rows` into chunks of `rows_per_chunk` rows, the last chunk
    /// holding the remainder. Zero rows make a single empty chunk.
    pub fn uniform(n_rows: usize, rows_per_chunk: usize) -> Self {
        let rows_per_chunk = rows_per_chunk.max(1);
        let n_chunks = ((n_rows + rows_per_chunk - 1) / rows_per_chunk).max(1);
        let lens: Vec<usize> = (0..n_chunks)
            .map(|i| rows_per_chunk.min(n_rows - (i * rows_per_chunk).min(n_rows)))
            .collect();
        Layout::from_chunk_lens(&lens)
    }

    pub fn n_chunks(&self) -> usize {
        self.espc.len() - 1
    }

    pub fn n_rows(&self) -> usize {
        self.espc[self.espc.len() - 1]
    }

    /// The boundaries, `n_chunks() + 1` of them
    pub fn boundaries(&self) -> &[usize] {
        &self.espc
    }

    /// The index of the chunk holding `row`
    pub fn chunk_for_row(&self, row: usize) -> Result<usize, LiquidError> {
        if row >= self.n_rows() {
            return Err(LiquidError::RowIndexOutOfBounds);
        }
        // the last boundary <= row; empty chunks share a boundary with the
        // next one, so this skips them
        Ok(self.espc.partition_point(|b| *b <= row) - 1)
    }

    /// The rows of chunk `cidx`
    pub fn chunk_range(&self, cidx: usize) -> Result<Range<usize>, LiquidError> {
        if cidx >= self.n_chunks() {
            return Err(LiquidError::RowIndexOutOfBounds);
        }
        Ok(self.espc[cidx]..self.espc[cidx + 1])
    }

    pub fn chunk_len(&self, cidx: usize) -> Result<usize, LiquidError> {
        Ok(self.chunk_range(cidx)?.len())
    }
}
