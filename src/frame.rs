//! Defines functionality for a `Frame`, an ordered set of uniquely named
//! columns that share one `Layout`, and for building one from values.
use crate::chunk::{Data, NewChunk};
use crate::column::{Column, ColumnType, Layout};
use crate::error::LiquidError;
use crate::kv::{KVStore, Key, KeyKind, Value};
use deepsize::DeepSizeOf;
use futures::future::try_join_all;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A named set of co-partitioned columns. Chunk `i` of every column holds the
/// same rows and lives on the same node, so a row can be processed locally.
///
/// A `Frame` is metadata: changing it does not change the `KVStore` until it
/// is [`publish`](Frame::publish)ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, DeepSizeOf)]
pub struct Frame {
    /// The key this frame is published under
    pub key: Key,
    names: Vec<String>,
    columns: Vec<Column>,
    layout: Layout,
}

impl Frame {
    /// Creates a `Frame` under a generated key
    pub fn new(
        names: Vec<String>,
        columns: Vec<Column>,
    ) -> Result<Self, LiquidError> {
        Frame::with_key(Key::generate("frame", KeyKind::Frame), names, columns)
    }

    /// Creates a `Frame` under `key`. Every column must share the same
    /// layout and every name must be unique.
    pub fn with_key(
        key: Key,
        names: Vec<String>,
        columns: Vec<Column>,
    ) -> Result<Self, LiquidError> {
        if names.len() != columns.len() {
            return Err(LiquidError::ColIndexOutOfBounds);
        }
        let mut frame = Frame {
            key,
            names: Vec::with_capacity(names.len()),
            columns: Vec::with_capacity(columns.len()),
            layout: Layout::from_chunk_lens(&[]),
        };
        for (name, column) in names.into_iter().zip(columns) {
            frame.add(&name, column)?;
        }
        Ok(frame)
    }

    /// Appends a column. The first column of an empty frame sets its layout.
    pub fn add(&mut self, name: &str, column: Column) -> Result<(), LiquidError> {
        if self.names.iter().any(|n| n == name) {
            return Err(LiquidError::NameAlreadyExists);
        }
        if self.columns.is_empty() {
            self.layout = column.layout().clone();
        } else if column.layout() != &self.layout {
            return Err(LiquidError::IncompatiblePartitioning);
        }
        self.names.push(name.to_string());
        self.columns.push(column);
        Ok(())
    }

    /// Removes the column called `name` from this frame and returns it. The
    /// column's data stays in the `KVStore`.
    pub fn remove(&mut self, name: &str) -> Result<Column, LiquidError> {
        let idx = self.col_idx(name)?;
        self.names.remove(idx);
        Ok(self.columns.remove(idx))
    }

    /// The index of the column called `name`
    pub fn col_idx(&self, name: &str) -> Result<usize, LiquidError> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or(LiquidError::ColIndexOutOfBounds)
    }

    pub fn column(&self, name: &str) -> Result<&Column, LiquidError> {
        Ok(&self.columns[self.col_idx(name)?])
    }

    pub fn column_at(&self, idx: usize) -> Result<&Column, LiquidError> {
        self.columns.get(idx).ok_or(LiquidError::ColIndexOutOfBounds)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn n_rows(&self) -> usize {
        self.layout.n_rows()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// A new frame, under a generated key, with the named columns in the
    /// given order. The columns are shared, not copied.
    pub fn subframe(&self, names: &[&str]) -> Result<Frame, LiquidError> {
        let columns = names
            .iter()
            .map(|n| self.column(n).map(Column::clone))
            .collect::<Result<Vec<_>, _>>()?;
        Frame::new(names.iter().map(|n| n.to_string()).collect(), columns)
    }

    /// Stores the metadata of this frame and of its columns in the
    /// `KVStore`. The chunks must already be there.
    pub async fn publish(&self, kv: &KVStore) -> Result<(), LiquidError> {
        try_join_all(self.columns.iter().map(|c| {
            kv.put(c.key.clone(), Value::Column(Arc::new(c.clone())))
        }))
        .await?;
        kv.put(self.key.clone(), Value::Frame(Arc::new(self.clone())))
            .await
    }

    /// Fetches the `Frame` published under `key`
    pub async fn fetch(kv: &KVStore, key: &Key) -> Result<Arc<Frame>, LiquidError> {
        kv.get(key).await?.into_frame()
    }

    /// Every key this frame owns: its own, and the column, chunk and rollups
    /// keys of each of its columns
    pub fn keys(&self) -> Vec<Key> {
        let mut keys = vec![self.key.clone()];
        for column in &self.columns {
            keys.extend(column_keys(column));
        }
        keys
    }

    /// Removes this frame, its columns and all of their chunks from the
    /// `KVStore`. Other frames sharing these columns lose their data too.
    pub async fn delete(&self, kv: &KVStore) -> Result<(), LiquidError> {
        let keys = self.keys();
        debug!("Deleting frame {} and {} other keys", self.key, keys.len() - 1);
        try_join_all(keys.iter().map(|k| kv.remove(k))).await?;
        Ok(())
    }
}

/// The column key of `column` along with its chunk and rollups keys
pub(crate) fn column_keys(column: &Column) -> Vec<Key> {
    let mut keys = vec![column.key.clone(), column.key.rollups()];
    keys.extend((0..column.n_chunks()).map(|cidx| column.chunk_key(cidx)));
    keys
}

/// Builds a `Frame` from the values of each of its columns, compressing
/// them into chunks and publishing everything to the `KVStore`.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    partition: Partition,
    columns: Vec<PendingColumn>,
}

#[derive(Debug, Clone)]
enum Partition {
    RowsPerChunk(usize),
    Layout(Layout),
}

#[derive(Debug, Clone)]
struct PendingColumn {
    name: String,
    col_type: ColumnType,
    domain: Option<Vec<String>>,
    values: Vec<Data>,
}

impl FrameBuilder {
    /// Splits the rows into chunks of `rows_per_chunk` rows
    pub fn new(rows_per_chunk: usize) -> Self {
        FrameBuilder {
            partition: Partition::RowsPerChunk(rows_per_chunk),
            columns: Vec::new(),
        }
    }

    /// Splits the rows along `layout`, which must cover exactly the rows of
    /// every column
    pub fn with_layout(layout: Layout) -> Self {
        FrameBuilder {
            partition: Partition::Layout(layout),
            columns: Vec::new(),
        }
    }

    /// Adds a numeric column, `NaN` is a missing value
    pub fn numeric(self, name: &str, values: Vec<f64>) -> Self {
        let values = values.into_iter().map(Data::Float).collect();
        self.add_column(name, ColumnType::Numeric, None, values)
    }

    /// Adds a numeric column of integers
    pub fn integers(self, name: &str, values: Vec<Option<i64>>) -> Self {
        let values = values
            .into_iter()
            .map(|v| v.map_or(Data::Null, Data::Int))
            .collect();
        self.add_column(name, ColumnType::Numeric, None, values)
    }

    /// Adds a categorical column of codes into `domain`
    pub fn categorical(
        self,
        name: &str,
        domain: Vec<String>,
        codes: Vec<Option<u32>>,
    ) -> Self {
        let values = codes
            .into_iter()
            .map(|c| c.map_or(Data::Null, Data::Cat))
            .collect();
        self.add_column(name, ColumnType::Categorical, Some(domain), values)
    }

    pub fn strings(self, name: &str, values: Vec<Option<String>>) -> Self {
        let values = values
            .into_iter()
            .map(|s| s.map_or(Data::Null, Data::Str))
            .collect();
        self.add_column(name, ColumnType::String, None, values)
    }

    /// Adds a column of any type. Values that do not fit `col_type` make
    /// `build` fail with `TypeMismatch`.
    pub fn add_column(
        mut self,
        name: &str,
        col_type: ColumnType,
        domain: Option<Vec<String>>,
        values: Vec<Data>,
    ) -> Self {
        self.columns.push(PendingColumn {
            name: name.to_string(),
            col_type,
            domain,
            values,
        });
        self
    }

    /// Compresses every column into chunks, publishes the chunks to their
    /// home nodes and then publishes the columns and the frame.
    pub async fn build(self, kv: &KVStore) -> Result<Frame, LiquidError> {
        let n_rows = self.columns.first().map_or(0, |c| c.values.len());
        if self.columns.iter().any(|c| c.values.len() != n_rows) {
            return Err(LiquidError::IncompatiblePartitioning);
        }
        let mut seen = HashSet::new();
        if !self.columns.iter().all(|c| seen.insert(c.name.as_str())) {
            return Err(LiquidError::NameAlreadyExists);
        }
        let layout = match self.partition {
            Partition::RowsPerChunk(rows) => Layout::uniform(n_rows, rows),
            Partition::Layout(layout) if layout.n_rows() == n_rows => layout,
            Partition::Layout(_) => {
                return Err(LiquidError::IncompatiblePartitioning)
            }
        };

        let mut names = Vec::with_capacity(self.columns.len());
        let mut columns = Vec::with_capacity(self.columns.len());
        for pending in self.columns {
            let key = Key::generate(&pending.name, KeyKind::Column);
            let domain_len = pending.domain.as_ref().map(Vec::len);
            let mut values = pending.values.into_iter();
            let mut chunks = Vec::with_capacity(layout.n_chunks());
            for cidx in 0..layout.n_chunks() {
                let range = layout.chunk_range(cidx)?;
                let mut nc = NewChunk::new(pending.col_type, cidx, range.start);
                for value in values.by_ref().take(range.len()) {
                    if let (Some(len), Data::Cat(code)) = (domain_len, &value) {
                        if *code as usize >= len {
                            return Err(LiquidError::TypeMismatch);
                        }
                    }
                    nc.append(value)?;
                }
                chunks.push((key.chunk(cidx), Value::Chunk(Arc::new(nc.close()))));
            }
            try_join_all(chunks.into_iter().map(|(k, v)| kv.put(k, v))).await?;
            names.push(pending.name);
            columns.push(Column::new(key, pending.col_type, pending.domain, layout.clone()));
        }

        let mut frame = Frame::new(names, columns)?;
        // a frame without columns still has the requested row count
        if frame.n_cols() == 0 {
            frame.layout = layout;
        }
        frame.publish(kv).await?;
        debug!("Built frame {} with {} rows", frame.key, frame.n_rows());
        Ok(frame)
    }
}
