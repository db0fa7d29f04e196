//! Summary statistics of a column, computed by one pass of an `MRTask`.
use crate::chunk::{Chunk, NewChunk};
use crate::column::ColumnType;
use crate::mrtask::{ChunkSet, MRTask, TaskError};
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};

/// Summary statistics of one column. `min`, `max`, `mean` and `sigma` are
/// taken over the finite values only; infinities and missing values are
/// counted separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, DeepSizeOf)]
pub struct RollupStats {
    pub rows: usize,
    /// Missing values
    pub na: usize,
    /// Non-zero values, infinities included
    pub nz: usize,
    pub pinf: usize,
    pub ninf: usize,
    /// `+inf` when there are no finite values
    pub min: f64,
    /// `-inf` when there are no finite values
    pub max: f64,
    /// `NaN` when there are no finite values
    pub mean: f64,
    /// Sum of squared deviations from `mean`
    m2: f64,
    /// Whether every finite value is an integer
    pub is_int: bool,
    /// The size of the domain of a categorical column
    pub cardinality: Option<usize>,
}

impl Default for RollupStats {
    fn default() -> Self {
        RollupStats {
            rows: 0,
            na: 0,
            nz: 0,
            pinf: 0,
            ninf: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: f64::NAN,
            m2: 0.0,
            is_int: true,
            cardinality: None,
        }
    }
}

impl RollupStats {
    /// The number of finite values
    pub fn count(&self) -> usize {
        self.rows - self.na - self.pinf - self.ninf
    }

    /// The sample standard deviation of the finite values, `NaN` with fewer
    /// than two of them
    pub fn sigma(&self) -> f64 {
        let n = self.count();
        if n < 2 {
            f64::NAN
        } else {
            (self.m2 / (n - 1) as f64).sqrt()
        }
    }

    fn add(&mut self, v: f64) {
        self.rows += 1;
        if v.is_nan() {
            self.na += 1;
            return;
        }
        if v != 0.0 {
            self.nz += 1;
        }
        if v == f64::INFINITY {
            self.pinf += 1;
            return;
        }
        if v == f64::NEG_INFINITY {
            self.ninf += 1;
            return;
        }
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.is_int &= v.fract() == 0.0;
        // Welford's update
        let n = self.count() as f64;
        if n == 1.0 {
            self.mean = v;
            self.m2 = 0.0;
        } else {
            let delta = v - self.mean;
            self.mean += delta / n;
            self.m2 += delta * (v - self.mean);
        }
    }

    fn add_chunk(&mut self, chunk: &Chunk, col_type: ColumnType) {
        if col_type == ColumnType::String {
            for row in 0..chunk.len() {
                self.rows += 1;
                if chunk.is_na(row).unwrap_or(true) {
                    self.na += 1;
                }
            }
            return;
        }
        for v in chunk.to_doubles() {
            self.add(v);
        }
    }

    /// Merges the statistics of disjoint sets of rows, with Chan's parallel
    /// update of the mean and squared deviations
    pub fn merge(&mut self, other: &RollupStats) {
        let n1 = self.count() as f64;
        let n2 = other.count() as f64;
        if n2 > 0.0 {
            if n1 == 0.0 {
                self.mean = other.mean;
                self.m2 = other.m2;
            } else {
                let n = n1 + n2;
                let delta = other.mean - self.mean;
                self.mean += delta * n2 / n;
                self.m2 += other.m2 + delta * delta * n1 * n2 / n;
            }
        }
        self.rows += other.rows;
        self.na += other.na;
        self.nz += other.nz;
        self.pinf += other.pinf;
        self.ninf += other.ninf;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.is_int &= other.is_int;
    }
}

/// Computes the `RollupStats` of the first input column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RollupTask {
    col_type: ColumnType,
    domain_len: Option<usize>,
    pub(crate) stats: RollupStats,
}

impl RollupTask {
    pub(crate) fn new(col_type: ColumnType, domain_len: Option<usize>) -> Self {
        RollupTask {
            col_type,
            domain_len,
            stats: RollupStats::default(),
        }
    }
}

impl MRTask for RollupTask {
    const NAME: &'static str = "liquid_frame::RollupTask";

    fn map(&mut self, chunks: &ChunkSet, _: &mut [NewChunk]) -> Result<(), TaskError> {
        self.stats.add_chunk(chunks.column(0)?, self.col_type);
        Ok(())
    }

    fn reduce(&mut self, other: Self) {
        self.stats.merge(&other.stats);
    }

    fn post_global(&mut self) {
        self.stats.cardinality = self.domain_len;
        if self.col_type == ColumnType::String {
            self.stats.is_int = false;
        }
    }
}
