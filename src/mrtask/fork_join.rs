//! The per-node half of an `MRTask`: a recursive fork-join over the chunks
//! this node owns.
use crate::chunk::{Chunk, NewChunk};
use crate::column::ColumnType;
use crate::error::LiquidError;
use crate::mrtask::{CancelToken, ChunkSet, MRTask};
use crossbeam_utils::thread;
use log::{debug, error};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything the leaves of one run share
#[derive(Debug)]
pub(crate) struct ForkJoin {
    /// The id of the node running the leaves, reported on failure
    pub(crate) node: usize,
    pub(crate) threads: usize,
    pub(crate) min_leaf_chunks: usize,
    /// The type and domain size of each output column
    pub(crate) outputs: Vec<(ColumnType, Option<usize>)>,
    pub(crate) cancel: CancelToken,
    /// Set by the first failing leaf so its siblings stop early
    failed: AtomicBool,
}

/// The result of a subtree: the reduced task, `None` if the subtree held no
/// chunks, and the closed output chunks of each chunk index
pub(crate) struct Partial<T> {
    pub(crate) task: Option<T>,
    pub(crate) outputs: Vec<(usize, Vec<Chunk>)>,
}

impl ForkJoin {
    pub(crate) fn new(
        node: usize,
        threads: usize,
        min_leaf_chunks: usize,
        outputs: Vec<(ColumnType, Option<usize>)>,
        cancel: CancelToken,
    ) -> Self {
        ForkJoin {
            node,
            threads: threads.max(1),
            min_leaf_chunks: min_leaf_chunks.max(1),
            outputs,
            cancel,
            failed: AtomicBool::new(false),
        }
    }

    /// Maps every chunk set with its own clone of `task` and reduces the
    /// clones pairwise, bottom-up.
    pub(crate) fn run<T: MRTask>(
        &self,
        task: &T,
        sets: &[ChunkSet],
    ) -> Result<Partial<T>, LiquidError> {
        debug!(
            "Node {} running {} over {} chunks with {} threads",
            self.node,
            T::NAME,
            sets.len(),
            self.threads
        );
        self.split(task, sets, self.threads)
    }

    fn split<T: MRTask>(
        &self,
        task: &T,
        sets: &[ChunkSet],
        budget: usize,
    ) -> Result<Partial<T>, LiquidError> {
        if sets.len() <= self.min_leaf_chunks || budget <= 1 {
            return self.leaf(task, sets);
        }
        let (left, right) = sets.split_at(sets.len() / 2);
        let joined = thread::scope(|s| {
            let handle = s.spawn(|_| self.split(task, right, budget / 2));
            let l = self.split(task, left, budget - budget / 2);
            let r = handle.join().unwrap_or_else(|p| Err(self.panicked(p)));
            (l, r)
        });
        let (l, r) = joined.map_err(|p| self.panicked(p))?;
        match (l, r) {
            (Ok(mut l), Ok(r)) => {
                l.task = match (l.task, r.task) {
                    (Some(mut a), Some(b)) => {
                        a.reduce(b);
                        Some(a)
                    }
                    (a, b) => a.or(b),
                };
                l.outputs.extend(r.outputs);
                Ok(l)
            }
            (Err(e @ LiquidError::TaskFailed { .. }), _)
            | (_, Err(e @ LiquidError::TaskFailed { .. })) => Err(e),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    fn leaf<T: MRTask>(
        &self,
        task: &T,
        sets: &[ChunkSet],
    ) -> Result<Partial<T>, LiquidError> {
        let mut acc: Option<T> = None;
        let mut outputs = Vec::with_capacity(sets.len());
        for set in sets {
            if self.cancel.is_cancelled() || self.failed.load(Ordering::Acquire) {
                return Err(LiquidError::Cancelled);
            }
            let mut t = task.clone();
            let mut out: Vec<NewChunk> = self
                .outputs
                .iter()
                .map(|(ty, _)| NewChunk::new(*ty, set.cidx(), set.start()))
                .collect();
            let mapped = panic::catch_unwind(AssertUnwindSafe(|| t.map(set, &mut out)));
            match mapped {
                Ok(Ok(())) => (),
                Ok(Err(e)) => return Err(self.fail(e.to_string())),
                Err(p) => return Err(self.panicked(p)),
            }
            if out.iter().any(|nc| nc.len() != set.len()) {
                self.failed.store(true, Ordering::Release);
                return Err(LiquidError::IncompatiblePartitioning);
            }
            for (nc, (_, domain)) in out.iter().zip(&self.outputs) {
                if let (Some(size), Some(code)) = (domain, nc.max_category()) {
                    if code as usize >= *size {
                        return Err(self.fail(format!(
                            "category {} is outside a domain of {}",
                            code, size
                        )));
                    }
                }
            }
            acc = Some(match acc {
                None => t,
                Some(mut a) => {
                    a.reduce(t);
                    a
                }
            });
            outputs.push((set.cidx(), out.into_iter().map(NewChunk::close).collect()));
        }
        Ok(Partial { task: acc, outputs })
    }

    pub(crate) fn fail(&self, message: String) -> LiquidError {
        self.failed.store(true, Ordering::Release);
        error!("Task failed on node {}: {}", self.node, message);
        LiquidError::TaskFailed {
            node: self.node,
            message,
        }
    }

    fn panicked(&self, payload: Box<dyn Any + Send>) -> LiquidError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "map panicked".to_string()
        };
        self.fail(message)
    }
}
