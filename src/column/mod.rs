//! A module for distributed columns. A [`Column`] is the metadata of one
//! column of data: its element type, its [`Layout`] of rows into chunks, and
//! the `Key` its chunks are derived from. The chunks themselves live in the
//! `KVStore`, chunk `i` of every column on the same node.
use crate::chunk::{Chunk, Data, NewChunk};
use crate::codec::Encoded;
use crate::error::LiquidError;
use crate::kv::{KVStore, Key, KeyKind, Value};
use crate::node::Node;
use deepsize::DeepSizeOf;
use futures::future::try_join_all;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod layout;
pub use layout::Layout;

mod rollups;
pub(crate) use rollups::RollupTask;
pub use rollups::RollupStats;

/// The type of the elements of a column
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DeepSizeOf,
)]
pub enum ColumnType {
    Numeric,
    /// Milliseconds since the epoch
    Time,
    /// Codes into a finite domain of strings
    Categorical,
    String,
}

/// A distributed column. Cloning a `Column` clones its metadata, not its
/// data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, DeepSizeOf)]
pub struct Column {
    /// The key this column is published under, chunk keys are derived from it
    pub key: Key,
    col_type: ColumnType,
    /// The labels of the category codes of a categorical column
    domain: Option<Vec<String>>,
    layout: Layout,
}

impl Column {
    /// Creates the metadata of a column whose chunks are, or will be,
    /// published under `key.chunk(cidx)` for every chunk of `layout`.
    pub fn new(
        key: Key,
        col_type: ColumnType,
        domain: Option<Vec<String>>,
        layout: Layout,
    ) -> Self {
        Column {
            key,
            col_type,
            domain,
            layout,
        }
    }

    /// Publishes a numeric column over `layout` that holds `value` in every
    /// row, `NaN` making every row missing. Each chunk is a constant.
    pub async fn make_con(
        kv: &KVStore,
        name: &str,
        layout: Layout,
        value: f64,
    ) -> Result<Column, LiquidError> {
        let key = Key::generate(name, KeyKind::Column);
        let mut chunks = Vec::with_capacity(layout.n_chunks());
        for cidx in 0..layout.n_chunks() {
            let range = layout.chunk_range(cidx)?;
            let data = Encoded::Constant {
                value,
                len: range.len(),
            };
            chunks.push(Chunk::new(cidx, range.start, data));
        }
        let column = Column::new(key, ColumnType::Numeric, None, layout);
        column.publish_with(kv, chunks).await?;
        Ok(column)
    }

    /// Publishes a column of zeros with the layout of this one
    pub async fn make_zero(&self, kv: &KVStore, name: &str) -> Result<Column, LiquidError> {
        Column::make_con(kv, name, self.layout.clone(), 0.0).await
    }

    /// Publishes a numeric column over `layout` holding `1, 2, ..` up to
    /// the number of rows
    pub async fn make_seq(
        kv: &KVStore,
        name: &str,
        layout: Layout,
    ) -> Result<Column, LiquidError> {
        let key = Key::generate(name, KeyKind::Column);
        let mut chunks = Vec::with_capacity(layout.n_chunks());
        for cidx in 0..layout.n_chunks() {
            let range = layout.chunk_range(cidx)?;
            let mut nc = NewChunk::new(ColumnType::Numeric, cidx, range.start);
            for row in range {
                nc.append_i64(row as i64 + 1)?;
            }
            chunks.push(nc.close());
        }
        let column = Column::new(key, ColumnType::Numeric, None, layout);
        column.publish_with(kv, chunks).await?;
        Ok(column)
    }

    /// Publishes `chunks`, then this column once they are all stored
    async fn publish_with(&self, kv: &KVStore, chunks: Vec<Chunk>) -> Result<(), LiquidError> {
        try_join_all(chunks.into_iter().map(|chunk| {
            kv.put(self.chunk_key(chunk.cidx()), Value::Chunk(Arc::new(chunk)))
        }))
        .await?;
        kv.put(self.key.clone(), Value::Column(Arc::new(self.clone())))
            .await?;
        debug!("Published column {} with {} rows", self.key, self.n_rows());
        Ok(())
    }

    pub fn col_type(&self) -> ColumnType {
        self.col_type
    }

    pub fn domain(&self) -> Option<&[String]> {
        self.domain.as_deref()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn n_rows(&self) -> usize {
        self.layout.n_rows()
    }

    pub fn n_chunks(&self) -> usize {
        self.layout.n_chunks()
    }

    /// The key of chunk `cidx`
    pub fn chunk_key(&self, cidx: usize) -> Key {
        self.key.chunk(cidx)
    }

    /// Fetches the `Column` published under `key`
    pub async fn fetch(kv: &KVStore, key: &Key) -> Result<Arc<Column>, LiquidError> {
        kv.get(key).await?.into_column()
    }

    /// Fetches chunk `cidx`, from the local store if this node owns it
    pub async fn chunk_for_chunk_idx(
        &self,
        kv: &KVStore,
        cidx: usize,
    ) -> Result<Arc<Chunk>, LiquidError> {
        if cidx >= self.n_chunks() {
            return Err(LiquidError::RowIndexOutOfBounds);
        }
        kv.get(&self.chunk_key(cidx)).await?.into_chunk()
    }

    /// Fetches the chunk holding the global row `row`
    pub async fn chunk_for_row(
        &self,
        kv: &KVStore,
        row: usize,
    ) -> Result<Arc<Chunk>, LiquidError> {
        let cidx = self.layout.chunk_for_row(row)?;
        self.chunk_for_chunk_idx(kv, cidx).await
    }

    /// Reads the value at the global row `row`. Every call looks up the
    /// chunk, so reading many rows this way is slow; an `MRTask` is the way
    /// to process a column in bulk.
    pub async fn at(&self, kv: &KVStore, row: usize) -> Result<Data, LiquidError> {
        let chunk = self.chunk_for_row(kv, row).await?;
        chunk.at(row - chunk.start())
    }

    /// Writes `value` at the global row `row` and stores the chunk back at
    /// its home node. Cached statistics of this column are dropped.
    ///
    /// A write through a node that does not own the chunk ships the whole
    /// chunk home, so concurrent writes to the same remote chunk from
    /// different nodes may overwrite each other.
    pub async fn set(
        &self,
        kv: &KVStore,
        row: usize,
        value: Data,
    ) -> Result<(), LiquidError> {
        if let (Some(domain), Data::Cat(code)) = (&self.domain, &value) {
            if *code as usize >= domain.len() {
                return Err(LiquidError::TypeMismatch);
            }
        }
        let cidx = self.layout.chunk_for_row(row)?;
        let chunk = self.chunk_for_chunk_idx(kv, cidx).await?;
        chunk.set(row - chunk.start(), value)?;
        kv.put(self.chunk_key(cidx), Value::Chunk(chunk)).await?;
        kv.remove(&self.key.rollups()).await
    }

    /// The summary statistics of this column, computed with one pass over
    /// its chunks the first time they are asked for and cached in the
    /// `KVStore` until the column is written to.
    pub async fn rollups(&self, node: &Arc<Node>) -> Result<Arc<RollupStats>, LiquidError> {
        let key = self.key.rollups();
        match node.kv.get(&key).await {
            Ok(value) => return value.into_rollups(),
            Err(LiquidError::NotFound(_)) => (),
            Err(e) => return Err(e),
        }
        let task = RollupTask::new(self.col_type, self.domain.as_ref().map(Vec::len));
        let (task, _) = node.run_columns(task, &[self], &[]).await?;
        let stats = Arc::new(task.stats);
        node.kv.put(key, Value::Rollups(stats.clone())).await?;
        Ok(stats)
    }
}
