//! A module for running data-parallel map-reduce tasks over the columns of
//! one or more identically partitioned `Frame`s.
//!
//! A task is any type implementing [`MRTask`]. Running one from a
//! [`Node`](crate::node::Node) ships the serialized task to every node that
//! owns a chunk of the inputs. Each node then:
//! 1. splits its chunk indices in halves recursively, on separate threads,
//!    until a branch holds at most `min_leaf_chunks` chunks or the thread
//!    budget is spent
//! 2. calls `map` once per chunk index, each time on a fresh clone of the
//!    submitted task, with the chunks of every input column at that index
//! 3. `reduce`s the clones bottom-up and sends the result back
//!
//! The invoking node `reduce`s the per-node results in the order they arrive
//! and calls `post_global` once on the final result. Since the pairing and
//! order of `reduce` calls is not fixed, `reduce` must be associative and
//! commutative for results to be deterministic.
//!
//! Before its first `map`, each node calls `setup_local` once on its copy of
//! the submitted task, so every clone starts from the state it leaves. Once
//! the node has reduced its clones it calls `close_local` on the result,
//! before sending it back.
//!
//! A task may also produce a new `Frame`: every `map` call gets one
//! `NewChunk` per [`OutputColumn`] to append to, with as many rows as the
//! input chunk. The closed chunks are published on the node that made them,
//! under fresh keys, and the inputs are never changed. Codes appended to a
//! categorical output with a domain must index into that domain.
//!
//! If any `map` call returns an error or panics, the whole task fails with
//! `LiquidError::TaskFailed` carrying the error message as is, and no result
//! is returned. Cancelling a task through its [`TaskHandle`] makes every leaf
//! stop before its next chunk and the task fails with
//! `LiquidError::Cancelled`. In both cases output chunks that were already
//! published are removed.
use crate::chunk::{Chunk, NewChunk};
use crate::column::{ColumnType, Layout};
use crate::error::LiquidError;
use crate::frame::Frame;
use crate::kv::Key;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

mod cancel;
pub use cancel::CancelToken;

pub(crate) mod fork_join;

mod registry;
pub use registry::TaskRegistry;

/// The error a `map` call may fail with. Its `Display` output is what the
/// invoker sees.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// A data-parallel operation over the chunks of a set of columns. The fields
/// of the submitted task are the starting state of every `map` call.
pub trait MRTask:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The name the task is registered under on every node
    const NAME: &'static str;

    /// Processes the chunks of every input column at one chunk index,
    /// appending one value per row to each of the `out` chunks if the task
    /// has output columns.
    fn map(
        &mut self,
        chunks: &ChunkSet,
        out: &mut [NewChunk],
    ) -> Result<(), TaskError>;

    /// Folds the result of another `map` or `reduce` into this one
    fn reduce(&mut self, other: Self);

    /// Called once on every node running the task, before any `map`. An
    /// error fails the task like a failed `map` does.
    fn setup_local(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Called once on every node on its reduced result, before it is sent
    /// back to the invoker
    fn close_local(&mut self) {}

    /// Called once on the invoking node after the last `reduce`
    fn post_global(&mut self) {}
}

/// A column produced by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub name: String,
    pub col_type: ColumnType,
    /// The labels of the codes of a categorical column
    pub domain: Option<Vec<String>>,
}

impl OutputColumn {
    pub fn new(name: &str, col_type: ColumnType) -> Self {
        OutputColumn {
            name: name.to_string(),
            col_type,
            domain: None,
        }
    }

    /// A categorical column whose codes index into `domain`
    pub fn categorical(name: &str, domain: Vec<String>) -> Self {
        OutputColumn {
            name: name.to_string(),
            col_type: ColumnType::Categorical,
            domain: Some(domain),
        }
    }
}

/// The chunks at one chunk index of every input column of a task, in the
/// order the columns were given.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    cidx: usize,
    start: usize,
    len: usize,
    chunks: Vec<Arc<Chunk>>,
}

impl ChunkSet {
    pub(crate) fn new(
        cidx: usize,
        start: usize,
        len: usize,
        chunks: Vec<Arc<Chunk>>,
    ) -> Self {
        ChunkSet {
            cidx,
            start,
            len,
            chunks,
        }
    }

    /// The chunk index
    pub fn cidx(&self) -> usize {
        self.cidx
    }

    /// The global row index of the first row
    pub fn start(&self) -> usize {
        self.start
    }

    /// The number of rows in every chunk of this set
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn n_cols(&self) -> usize {
        self.chunks.len()
    }

    /// The chunk of the input column at `idx`
    pub fn column(&self, idx: usize) -> Result<&Chunk, LiquidError> {
        self.chunks
            .get(idx)
            .map(|c| c.as_ref())
            .ok_or(LiquidError::ColIndexOutOfBounds)
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }
}

/// Messages exchanged between the invoker of a task and the nodes running it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskMessage {
    /// Run the task registered as `name` over the chunks at `chunks`
    Run {
        task_id: usize,
        name: String,
        payload: Vec<u8>,
        /// The keys of the input columns
        inputs: Vec<Key>,
        layout: Layout,
        /// The key, type and domain size of each output column
        outputs: Vec<(Key, ColumnType, Option<usize>)>,
        chunks: Vec<usize>,
    },
    /// The reply to a `Run`
    Done {
        task_id: usize,
        outcome: TaskOutcome,
    },
    /// Stop running the task
    Cancel { task_id: usize },
}

/// How a `Run` ended on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// The serialized reduced task, `None` if the node mapped no chunks
    Done(Option<Vec<u8>>),
    Failed { node: usize, message: String },
    Cancelled,
}

impl TaskOutcome {
    /// The outcome of a run on node `node`. Errors other than a failed `map`
    /// are reported as failures of that node.
    pub(crate) fn new(
        node: usize,
        result: Result<Option<Vec<u8>>, LiquidError>,
    ) -> Self {
        match result {
            Ok(partial) => TaskOutcome::Done(partial),
            Err(LiquidError::Cancelled) => TaskOutcome::Cancelled,
            Err(LiquidError::TaskFailed { node, message }) => {
                TaskOutcome::Failed { node, message }
            }
            Err(e) => TaskOutcome::Failed {
                node,
                message: e.to_string(),
            },
        }
    }
}

/// A handle on a task started with
/// [`Node::submit`](crate::node::Node::submit)
#[derive(Debug)]
pub struct TaskHandle<T> {
    pub(crate) node: usize,
    pub(crate) cancel: CancelToken,
    pub(crate) handle: JoinHandle<Result<(T, Option<Frame>), LiquidError>>,
}

impl<T> TaskHandle<T> {
    /// Asks every node running the task to stop. The task then fails with
    /// `LiquidError::Cancelled`, unless it completed first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task, returning the reduced task and the output frame,
    /// if the task has output columns.
    pub async fn join(self) -> Result<(T, Option<Frame>), LiquidError> {
        self.handle.await.map_err(|e| LiquidError::TaskFailed {
            node: self.node,
            message: e.to_string(),
        })?
    }
}
