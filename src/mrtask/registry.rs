use crate::chunk::Chunk;
use crate::error::LiquidError;
use crate::mrtask::fork_join::ForkJoin;
use crate::mrtask::{ChunkSet, MRTask};
use bincode::{deserialize, serialize};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What one node sends back to the invoker: the serialized reduced task, and
/// the output chunks it closed, by chunk index
pub(crate) struct LocalResult {
    pub(crate) partial: Option<Vec<u8>>,
    pub(crate) outputs: Vec<(usize, Vec<Chunk>)>,
}

type Runner = Arc<
    dyn Fn(&[u8], &[ChunkSet], &ForkJoin) -> Result<LocalResult, LiquidError>
        + Send
        + Sync,
>;

/// Maps task names to code that can run them, so that a node can execute a
/// task it only received in serialized form.
#[derive(Default)]
pub struct TaskRegistry {
    runners: RwLock<HashMap<&'static str, Runner>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runners = self.runners.read();
        f.debug_set().entries(runners.keys()).finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry::default()
    }

    /// Registers `T` under `T::NAME`. Registering the same task twice is a
    /// no-op.
    pub fn register<T: MRTask>(&self) {
        if self.contains(T::NAME) {
            return;
        }
        let runner: Runner = Arc::new(
            |payload: &[u8],
             sets: &[ChunkSet],
             fork_join: &ForkJoin|
             -> Result<LocalResult, LiquidError> {
                let mut task: T = deserialize(payload)?;
                task.setup_local()
                    .map_err(|e| fork_join.fail(e.to_string()))?;
                let result = fork_join.run(&task, sets)?;
                let partial = match result.task {
                    Some(mut t) => {
                        t.close_local();
                        Some(serialize(&t)?)
                    }
                    None => None,
                };
                Ok(LocalResult {
                    partial,
                    outputs: result.outputs,
                })
            },
        );
        self.runners.write().insert(T::NAME, runner);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.read().contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Result<Runner, LiquidError> {
        self.runners
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LiquidError::NotRegistered(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::NewChunk;
    use crate::column::ColumnType;
    use crate::mrtask::{CancelToken, TaskError};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Count(usize);

    impl MRTask for Count {
        const NAME: &'static str = "registry::Count";

        fn map(&mut self, chunks: &ChunkSet, _: &mut [NewChunk]) -> Result<(), TaskError> {
            self.0 += chunks.len();
            Ok(())
        }

        fn reduce(&mut self, other: Self) {
            self.0 += other.0;
        }
    }

    /// Counts rows scaled by a factor set up once per node
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Scaled {
        factor: usize,
        rows: usize,
        setups: usize,
        closed: bool,
        refuse: bool,
    }

    impl MRTask for Scaled {
        const NAME: &'static str = "registry::Scaled";

        fn setup_local(&mut self) -> Result<(), TaskError> {
            if self.refuse {
                return Err("no setup".into());
            }
            self.factor = 10;
            self.setups += 1;
            Ok(())
        }

        fn map(&mut self, chunks: &ChunkSet, _: &mut [NewChunk]) -> Result<(), TaskError> {
            self.rows += chunks.len() * self.factor;
            Ok(())
        }

        fn reduce(&mut self, other: Self) {
            self.rows += other.rows;
        }

        fn close_local(&mut self) {
            self.closed = true;
        }
    }

    fn chunk_sets(n: usize) -> Vec<ChunkSet> {
        (0..n)
            .map(|cidx| {
                let mut nc = NewChunk::new(ColumnType::Numeric, cidx, cidx * 6);
                (0..6).for_each(|i| nc.append_i64(i).unwrap());
                ChunkSet::new(cidx, cidx * 6, 6, vec![Arc::new(nc.close())])
            })
            .collect()
    }

    #[test]
    fn test_run_by_name() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.get(Count::NAME),
            Err(LiquidError::NotRegistered(_))
        ));
        registry.register::<Count>();
        registry.register::<Count>();
        assert!(registry.contains(Count::NAME));

        let sets = chunk_sets(1);
        let fork_join = ForkJoin::new(1, 1, 1, vec![], CancelToken::new());
        let runner = registry.get(Count::NAME).unwrap();
        let result = runner(&serialize(&Count(0)).unwrap(), &sets, &fork_join).unwrap();
        let count: Count = deserialize(&result.partial.unwrap()).unwrap();
        assert_eq!(count.0, 6);
    }

    #[test]
    fn test_local_setup_and_close_run_once() {
        let registry = TaskRegistry::new();
        registry.register::<Scaled>();
        let runner = registry.get(Scaled::NAME).unwrap();
        let sets = chunk_sets(4);
        let fork_join = ForkJoin::new(1, 4, 1, vec![], CancelToken::new());
        let payload = serialize(&Scaled::default()).unwrap();
        let result = runner(&payload, &sets, &fork_join).unwrap();
        let scaled: Scaled = deserialize(&result.partial.unwrap()).unwrap();
        assert_eq!(scaled.rows, 4 * 6 * 10);
        // every clone inherits the one setup, reduce does not add them up
        assert_eq!(scaled.setups, 1);
        assert!(scaled.closed);

        let refused = Scaled {
            refuse: true,
            ..Scaled::default()
        };
        let fork_join = ForkJoin::new(2, 4, 1, vec![], CancelToken::new());
        match runner(&serialize(&refused).unwrap(), &sets, &fork_join) {
            Err(LiquidError::TaskFailed { node, message }) => {
                assert_eq!(node, 2);
                assert_eq!(message, "no setup");
            }
            other => panic!("expected a failure, got {:?}", other.map(|r| r.partial)),
        }
    }
}
