//! This module defines a `Node`, the highest level component of a
//! `liquid_frame` cluster.
//!
//! A `Node` owns one member's `KVStore` and runs `MRTask`s, both on behalf of
//! callers on this node (the *invoker* side) and for tasks invoked elsewhere
//! that reach chunks this node owns (the *worker* side). All traffic between
//! nodes is one stream of [`NodeMsg`]s per node, processed by a single
//! message loop that hands each message off without blocking on it.
use crate::column::{Column, ColumnType, Layout, RollupTask};
use crate::config::Settings;
use crate::error::LiquidError;
use crate::frame::Frame;
use crate::kv::{FilePersist, KVMessage, KVStore, Key, KeyKind, Value};
use crate::mrtask::fork_join::ForkJoin;
use crate::mrtask::{
    CancelToken, ChunkSet, MRTask, OutputColumn, TaskHandle, TaskMessage,
    TaskOutcome, TaskRegistry,
};
use crate::network::{Client, LocalNetwork, Membership, Message, Network};
use bincode::{deserialize, serialize};
use futures::future::try_join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

/// Everything one node sends another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeMsg {
    Kv(KVMessage),
    Task(TaskMessage),
}

/// The invoker's view of a task
#[derive(Debug)]
struct Plan {
    task_id: usize,
    inputs: Vec<Key>,
    layout: Layout,
    /// The key of each output column, with what the caller asked for
    outputs: Vec<(Key, OutputColumn)>,
}

/// One member of a cluster.
#[derive(Debug)]
pub struct Node {
    /// The id of this node
    pub id: usize,
    /// The `KVStore` holding the data this node owns
    pub kv: Arc<KVStore>,
    network: Arc<Network<NodeMsg>>,
    registry: TaskRegistry,
    settings: Settings,
    /// Cancel tokens of the runs on this node, by invoker and task id
    running: Mutex<HashMap<(usize, usize), CancelToken>>,
    /// Tasks invoked here that are waiting for `Done` replies
    waiting: Mutex<HashMap<usize, UnboundedSender<(usize, TaskOutcome)>>>,
    next_task_id: AtomicUsize,
    /// Notified when this node should shut down
    pub kill_notifier: Arc<Notify>,
}

impl Node {
    /// Creates a `Node` on top of a joined `network` and starts processing
    /// the messages that arrive on `receiver`.
    pub fn new(
        network: Network<NodeMsg>,
        receiver: Receiver<Message<NodeMsg>>,
        settings: Settings,
        kill_notifier: Arc<Notify>,
    ) -> Result<Arc<Self>, LiquidError> {
        let network = Arc::new(network);
        let mut kv = KVStore::new(network.clone(), &settings.cache);
        if let Some(dir) = &settings.cache.spill_dir {
            let dir = dir.join(format!("node-{}", network.id));
            kv = kv.with_persist(Arc::new(FilePersist::new(dir)?));
        }
        let node = Arc::new(Node {
            id: network.id,
            kv: Arc::new(kv),
            network,
            registry: TaskRegistry::new(),
            settings,
            running: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            next_task_id: AtomicUsize::new(0),
            kill_notifier,
        });
        node.registry.register::<RollupTask>();
        tokio::spawn(Node::process_messages(Arc::downgrade(&node), receiver));
        info!("Node {} is up", node.id);
        Ok(node)
    }

    /// Registers with the `Server` at `server_addr` over TCP, listening on
    /// `my_ip`, and creates the `Node`. The node's kill notifier fires when
    /// the `Server` shuts the cluster down.
    pub async fn connect(
        server_addr: &str,
        my_ip: &str,
        settings: Settings,
    ) -> Result<Arc<Self>, LiquidError> {
        let (network, receiver, kill_notifier) =
            Client::join(server_addr, my_ip, &settings.network).await?;
        Node::new(network, receiver, settings, kill_notifier)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn membership(&self) -> Membership {
        self.network.membership()
    }

    /// Waits until at least `n` nodes are members of the cluster
    pub async fn wait_for_members(&self, n: usize) -> Result<(), LiquidError> {
        let mut membership = self.network.watch_membership();
        while membership.borrow_and_update().len() < n {
            membership
                .changed()
                .await
                .map_err(|_| LiquidError::StreamClosed)?;
        }
        Ok(())
    }

    /// Waits until the kill notifier fires
    pub async fn wait_for_kill(&self) {
        self.kill_notifier.notified().await;
    }

    /// Makes a task runnable when another node invokes it. Tasks are
    /// registered automatically on the node that invokes them.
    pub fn register<T: MRTask>(&self) {
        self.registry.register::<T>();
    }

    /// Runs `task` over every column of `frames`, which must share one
    /// layout, and returns the reduced task.
    pub async fn run<T: MRTask>(
        self: &Arc<Self>,
        task: T,
        frames: &[&Frame],
    ) -> Result<T, LiquidError> {
        let (task, _) = self.submit(task, frames, &[])?.join().await?;
        Ok(task)
    }

    /// Runs `task` over every column of `frames` and collects what its `map`
    /// calls append into a new `Frame` with the given columns.
    pub async fn run_with_output<T: MRTask>(
        self: &Arc<Self>,
        task: T,
        frames: &[&Frame],
        outputs: &[OutputColumn],
    ) -> Result<(T, Frame), LiquidError> {
        if outputs.is_empty() {
            return Err(LiquidError::ColIndexOutOfBounds);
        }
        let (task, frame) = self.submit(task, frames, outputs)?.join().await?;
        let frame = frame.ok_or(LiquidError::ColIndexOutOfBounds)?;
        Ok((task, frame))
    }

    /// Starts `task` without waiting for it. The returned handle can cancel
    /// the task or wait for its result.
    pub fn submit<T: MRTask>(
        self: &Arc<Self>,
        task: T,
        frames: &[&Frame],
        outputs: &[OutputColumn],
    ) -> Result<TaskHandle<T>, LiquidError> {
        let columns: Vec<&Column> =
            frames.iter().flat_map(|f| f.columns()).collect();
        self.submit_columns(task, &columns, outputs)
    }

    pub(crate) async fn run_columns<T: MRTask>(
        self: &Arc<Self>,
        task: T,
        columns: &[&Column],
        outputs: &[OutputColumn],
    ) -> Result<(T, Option<Frame>), LiquidError> {
        self.submit_columns(task, columns, outputs)?.join().await
    }

    fn submit_columns<T: MRTask>(
        self: &Arc<Self>,
        task: T,
        columns: &[&Column],
        outputs: &[OutputColumn],
    ) -> Result<TaskHandle<T>, LiquidError> {
        let layout = columns
            .first()
            .ok_or(LiquidError::ColIndexOutOfBounds)?
            .layout()
            .clone();
        if columns.iter().any(|c| c.layout() != &layout) {
            return Err(LiquidError::IncompatiblePartitioning);
        }
        let mut names = HashSet::new();
        if !outputs.iter().all(|o| names.insert(o.name.as_str())) {
            return Err(LiquidError::NameAlreadyExists);
        }
        if outputs
            .iter()
            .any(|o| o.domain.is_some() && o.col_type != ColumnType::Categorical)
        {
            return Err(LiquidError::TypeMismatch);
        }
        self.registry.register::<T>();

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let plan = Plan {
            task_id,
            inputs: columns.iter().map(|c| c.key.clone()).collect(),
            layout,
            outputs: outputs
                .iter()
                .map(|o| (Key::generate(&o.name, KeyKind::Column), o.clone()))
                .collect(),
        };
        let cancel = CancelToken::new();
        let (sender, done) = mpsc::unbounded_channel();
        self.waiting.lock().insert(task_id, sender);
        let handle =
            tokio::spawn(self.clone().invoke(task, plan, cancel.clone(), done));
        Ok(TaskHandle {
            node: self.id,
            cancel,
            handle,
        })
    }

    async fn invoke<T: MRTask>(
        self: Arc<Self>,
        task: T,
        plan: Plan,
        cancel: CancelToken,
        done: UnboundedReceiver<(usize, TaskOutcome)>,
    ) -> Result<(T, Option<Frame>), LiquidError> {
        let result = self.drive(&task, &plan, &cancel, done).await;
        self.waiting.lock().remove(&plan.task_id);
        match result {
            Ok(reduced) => {
                let mut reduced = reduced.unwrap_or(task);
                reduced.post_global();
                let frame = self.publish_outputs(&plan).await?;
                Ok((reduced, frame))
            }
            Err(e) => {
                info!("Task {} {} failed: {}", T::NAME, plan.task_id, e);
                self.remove_outputs(&plan).await;
                Err(e)
            }
        }
    }

    /// Sends the task to every node owning a chunk of the inputs and reduces
    /// their replies in arrival order. On the first error, every node still
    /// running is told to stop, and the error is returned once all of them
    /// have replied or left.
    async fn drive<T: MRTask>(
        &self,
        task: &T,
        plan: &Plan,
        cancel: &CancelToken,
        mut done: UnboundedReceiver<(usize, TaskOutcome)>,
    ) -> Result<Option<T>, LiquidError> {
        let payload = serialize(task)?;
        let mut owned: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for cidx in 0..plan.layout.n_chunks() {
            let home = self.kv.home_of(&plan.inputs[0].chunk(cidx))?;
            owned.entry(home).or_default().push(cidx);
        }
        let outputs: Vec<(Key, ColumnType, Option<usize>)> = plan
            .outputs
            .iter()
            .map(|(key, o)| (key.clone(), o.col_type, o.domain.as_ref().map(Vec::len)))
            .collect();

        let mut pending = HashSet::new();
        let mut error = None;
        for (node, chunks) in owned {
            let run = TaskMessage::Run {
                task_id: plan.task_id,
                name: T::NAME.to_string(),
                payload: payload.clone(),
                inputs: plan.inputs.clone(),
                layout: plan.layout.clone(),
                outputs: outputs.clone(),
                chunks,
            };
            match self.network.send_msg(node, NodeMsg::Task(run)).await {
                Ok(()) => {
                    pending.insert(node);
                }
                Err(e) => {
                    record(&mut error, e);
                    break;
                }
            }
        }
        debug!(
            "Task {} {} sent to nodes {:?}",
            T::NAME,
            plan.task_id,
            pending
        );

        let mut reduced: Option<T> = None;
        let mut membership = self.network.watch_membership();
        let mut membership_open = true;
        let mut cancel_sent = false;
        while !pending.is_empty() {
            if error.is_some() && !cancel_sent {
                cancel_sent = true;
                self.send_cancel(plan.task_id, &pending).await;
            }
            tokio::select! {
                reply = done.recv() => {
                    let (node, outcome) = match reply {
                        Some(reply) => reply,
                        None => break,
                    };
                    pending.remove(&node);
                    match outcome {
                        TaskOutcome::Done(Some(bytes)) if error.is_none() => {
                            match deserialize::<T>(&bytes) {
                                Ok(partial) => {
                                    reduced = Some(match reduced {
                                        None => partial,
                                        Some(mut r) => {
                                            r.reduce(partial);
                                            r
                                        }
                                    });
                                }
                                Err(e) => record(&mut error, e.into()),
                            }
                        }
                        TaskOutcome::Done(_) => (),
                        TaskOutcome::Failed { node, message } => {
                            record(&mut error, LiquidError::TaskFailed { node, message })
                        }
                        TaskOutcome::Cancelled => {
                            record(&mut error, LiquidError::Cancelled)
                        }
                    }
                }
                _ = cancel.cancelled(), if !cancel_sent => {
                    record(&mut error, LiquidError::Cancelled);
                }
                changed = membership.changed(), if membership_open => {
                    if changed.is_err() {
                        membership_open = false;
                        continue;
                    }
                    let current = membership.borrow_and_update().clone();
                    let lost: Vec<usize> = pending
                        .iter()
                        .copied()
                        .filter(|n| !current.contains(*n))
                        .collect();
                    for node in lost {
                        warn!("Node {} left while running task {}", node, plan.task_id);
                        pending.remove(&node);
                        record(&mut error, LiquidError::NodeLost(node));
                    }
                }
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(reduced),
        }
    }

    async fn send_cancel(&self, task_id: usize, nodes: &HashSet<usize>) {
        for node in nodes {
            let cancel = NodeMsg::Task(TaskMessage::Cancel { task_id });
            if let Err(e) = self.network.send_msg(*node, cancel).await {
                debug!("Could not cancel task {} on node {}: {}", task_id, node, e);
            }
        }
    }

    /// Publishes the metadata of the output columns and frame. The chunks
    /// were published by the nodes that made them.
    async fn publish_outputs(
        &self,
        plan: &Plan,
    ) -> Result<Option<Frame>, LiquidError> {
        if plan.outputs.is_empty() {
            return Ok(None);
        }
        let (names, columns) = plan
            .outputs
            .iter()
            .map(|(key, o)| {
                let column = Column::new(
                    key.clone(),
                    o.col_type,
                    o.domain.clone(),
                    plan.layout.clone(),
                );
                (o.name.clone(), column)
            })
            .unzip();
        let frame = Frame::new(names, columns)?;
        frame.publish(&self.kv).await?;
        Ok(Some(frame))
    }

    async fn remove_outputs(&self, plan: &Plan) {
        for (key, _) in &plan.outputs {
            for cidx in 0..plan.layout.n_chunks() {
                if let Err(e) = self.kv.remove(&key.chunk(cidx)).await {
                    warn!("Could not remove output chunk {}: {}", key.chunk(cidx), e);
                }
            }
        }
    }

    async fn process_messages(
        node: Weak<Node>,
        mut receiver: Receiver<Message<NodeMsg>>,
    ) {
        while let Some(msg) = receiver.recv().await {
            let node = match node.upgrade() {
                Some(node) => node,
                None => return,
            };
            match msg.msg {
                NodeMsg::Kv(m) => node.kv.process_message(msg.sender_id, m),
                NodeMsg::Task(m) => node.process_task_message(msg.sender_id, m),
            }
        }
        debug!("Message loop stopped");
    }

    fn process_task_message(self: &Arc<Self>, sender_id: usize, msg: TaskMessage) {
        match msg {
            TaskMessage::Run {
                task_id,
                name,
                payload,
                inputs,
                layout,
                outputs,
                chunks,
            } => {
                // registered before spawning so that a `Cancel` right behind
                // the `Run` finds it
                let cancel = CancelToken::new();
                self.running
                    .lock()
                    .insert((sender_id, task_id), cancel.clone());
                let node = self.clone();
                tokio::spawn(async move {
                    let result = node
                        .execute(&name, payload, &inputs, &layout, &outputs, &chunks, cancel)
                        .await;
                    node.running.lock().remove(&(sender_id, task_id));
                    let outcome = TaskOutcome::new(node.id, result);
                    let reply = NodeMsg::Task(TaskMessage::Done { task_id, outcome });
                    if let Err(e) = node.network.send_msg(sender_id, reply).await {
                        error!("Could not report task {} to node {}: {}", task_id, sender_id, e);
                    }
                });
            }
            TaskMessage::Done { task_id, outcome } => {
                let waiting = self.waiting.lock();
                match waiting.get(&task_id) {
                    Some(sender) => {
                        let _ = sender.send((sender_id, outcome));
                    }
                    None => debug!("Dropped a late reply for task {}", task_id),
                }
            }
            TaskMessage::Cancel { task_id } => {
                if let Some(cancel) = self.running.lock().get(&(sender_id, task_id)) {
                    info!("Cancelling task {} of node {}", task_id, sender_id);
                    cancel.cancel();
                }
            }
        }
    }

    /// Runs the local part of a task: fetches the chunk sets, runs the
    /// fork-join on the blocking pool, and publishes the output chunks.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        name: &str,
        payload: Vec<u8>,
        inputs: &[Key],
        layout: &Layout,
        outputs: &[(Key, ColumnType, Option<usize>)],
        chunks: &[usize],
        cancel: CancelToken,
    ) -> Result<Option<Vec<u8>>, LiquidError> {
        let runner = self.registry.get(name)?;
        let mut sets = Vec::with_capacity(chunks.len());
        for &cidx in chunks {
            let range = layout.chunk_range(cidx)?;
            let values = try_join_all(inputs.iter().map(|col| {
                let key = col.chunk(cidx);
                async move { self.kv.get(&key).await }
            }))
            .await?;
            let input = values
                .into_iter()
                .map(Value::into_chunk)
                .collect::<Result<Vec<_>, _>>()?;
            sets.push(ChunkSet::new(cidx, range.start, range.len(), input));
        }

        let fork_join = ForkJoin::new(
            self.id,
            self.settings.mrtask.thread_count(),
            self.settings.mrtask.min_leaf_chunks,
            outputs.iter().map(|(_, ty, domain)| (*ty, *domain)).collect(),
            cancel,
        );
        let local = tokio::task::spawn_blocking(move || runner(&payload, &sets, &fork_join))
            .await
            .map_err(|e| LiquidError::TaskFailed {
                node: self.id,
                message: e.to_string(),
            })??;

        for (cidx, chunks) in local.outputs {
            for ((key, _, _), chunk) in outputs.iter().zip(chunks) {
                self.kv
                    .put(key.chunk(cidx), Value::Chunk(Arc::new(chunk)))
                    .await?;
            }
        }
        Ok(local.partial)
    }
}

/// Keeps the first error, unless a later one is a failed `map`
fn record(error: &mut Option<LiquidError>, e: LiquidError) {
    let keep = match error {
        Some(current) => is_failure(current) || !is_failure(&e),
        None => false,
    };
    if !keep {
        *error = Some(e);
    }
}

fn is_failure(e: &LiquidError) -> bool {
    matches!(e, LiquidError::TaskFailed { .. })
}

/// A cluster of `Node`s running in this process, connected by a
/// `LocalNetwork`. Node ids start at `1`.
#[derive(Debug)]
pub struct LocalCluster {
    hub: LocalNetwork<NodeMsg>,
    nodes: BTreeMap<usize, Arc<Node>>,
    next_id: usize,
    settings: Settings,
}

impl LocalCluster {
    /// Starts `n` nodes. Must be called from within a `tokio` runtime.
    pub fn start(n: usize, settings: Settings) -> Result<Self, LiquidError> {
        let mut cluster = LocalCluster {
            hub: LocalNetwork::new(settings.network.channel_capacity),
            nodes: BTreeMap::new(),
            next_id: 1,
            settings,
        };
        for _ in 0..n {
            cluster.add_node()?;
        }
        Ok(cluster)
    }

    /// Starts another node and adds it to the membership
    pub fn add_node(&mut self) -> Result<Arc<Node>, LiquidError> {
        let id = self.next_id;
        self.next_id += 1;
        let (network, receiver) = self.hub.join(id)?;
        let node =
            Node::new(network, receiver, self.settings.clone(), Arc::new(Notify::new()))?;
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    /// Removes the node with the given id from the membership. Its data is
    /// lost, and tasks or requests waiting on it fail with `NodeLost`.
    pub fn remove_node(&mut self, id: usize) -> Option<Arc<Node>> {
        self.hub.leave(id);
        let node = self.nodes.remove(&id);
        if let Some(node) = &node {
            node.kill_notifier.notify_one();
        }
        node
    }

    pub fn node(&self, id: usize) -> Option<&Arc<Node>> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.values().cloned().collect()
    }

    pub fn membership(&self) -> Membership {
        self.hub.membership()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_prefers_failures() {
        let mut error = None;
        record(&mut error, LiquidError::Cancelled);
        record(&mut error, LiquidError::NodeLost(3));
        assert!(matches!(error, Some(LiquidError::Cancelled)));
        record(
            &mut error,
            LiquidError::TaskFailed {
                node: 2,
                message: "boom".to_string(),
            },
        );
        record(&mut error, LiquidError::Cancelled);
        assert!(matches!(error, Some(LiquidError::TaskFailed { node: 2, .. })));
    }

    #[tokio::test]
    async fn test_cluster_membership() {
        let mut cluster = LocalCluster::start(3, Settings::default()).unwrap();
        assert_eq!(cluster.membership().nodes, vec![1, 2, 3]);
        let node = cluster.add_node().unwrap();
        assert_eq!(node.id, 4);
        node.wait_for_members(4).await.unwrap();
        assert!(cluster.remove_node(2).is_some());
        assert_eq!(cluster.node(1).unwrap().membership().nodes, vec![1, 3, 4]);
        assert!(cluster.node(2).is_none());
    }
}
