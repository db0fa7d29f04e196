//! A module with methods to communicate with nodes in a distributed system.
//!
//! Every node owns a [`Network`], a handle that can send a [`Message`] to any
//! current member of the cluster (itself included) and that publishes the
//! current [`Membership`] through a `tokio::sync::watch` channel. Messages
//! addressed to a node arrive on the inbound `mpsc` receiver handed out when
//! the node joined.
//!
//! Two transports produce a `Network`:
//! - [`LocalNetwork`]: an in-process hub, used to run a whole cluster inside
//!   one process (for tests and single machine use)
//! - [`Client`] and [`Server`]: TCP, where a registration `Server` assigns
//!   ids and broadcasts the directory of nodes whenever a node joins or
//!   disconnects, and every `Client` opens a connection to every other node.
use crate::error::LiquidError;
use crate::kv::Key;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc::Sender, watch};
use tokio_util::codec::LengthDelimitedCodec;

mod client;
pub use client::Client;

mod local;
pub use local::LocalNetwork;

mod message;

mod server;
pub use server::Server;

/// A message for communication between nodes
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message<T> {
    /// The id of this message
    pub msg_id: usize,
    /// The id of the sender
    pub sender_id: usize,
    /// The id of the node this message is being sent to
    pub target_id: usize,
    /// The body of the message
    pub msg: T,
}

/// Control messages exchanged with the registration `Server` and used to
/// introduce `Client`s to each other
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMsg {
    /// Sent by a `Client` to the `Server` when registering, and to every
    /// other `Client` it connects to
    Introduction { address: SocketAddr },
    /// Sent by the `Server` to every `Client` whenever a node joins or
    /// disconnects. `target_id` of the enclosing message is the id of the
    /// recipient.
    Directory {
        epoch: u64,
        dir: Vec<(usize, SocketAddr)>,
    },
    /// Tells a `Client` to shut down
    Kill,
}

/// Encodes and decodes length delimited, `bincode` serialized `Message<T>`s
#[derive(Debug)]
pub struct MessageCodec<T> {
    phantom: std::marker::PhantomData<T>,
    pub(crate) codec: LengthDelimitedCodec,
}

/// The live members of a cluster. `nodes` is kept sorted so that every node
/// resolves the home of a `Key` to the same member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Membership {
    /// Incremented on every change
    pub epoch: u64,
    pub nodes: Vec<usize>,
}

impl Membership {
    pub fn new(epoch: u64, mut nodes: Vec<usize>) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        Membership { epoch, nodes }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.nodes.binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The id of the node that owns `key`, `None` when there are no members
    pub fn home_of(&self, key: &Key) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        Some(self.nodes[key.home_index(self.nodes.len())])
    }
}

/// One node's handle on the cluster, generic over the type `T` of messages
/// that are sent between nodes.
#[derive(Debug)]
pub struct Network<T> {
    /// The `id` of this node
    pub id: usize,
    msg_id: AtomicUsize,
    /// Outbound queues to every member, including this node
    peers: Arc<RwLock<HashMap<usize, Sender<Message<T>>>>>,
    membership: watch::Receiver<Membership>,
}

impl<T: Send + 'static> Network<T> {
    pub(crate) fn new(
        id: usize,
        peers: Arc<RwLock<HashMap<usize, Sender<Message<T>>>>>,
        membership: watch::Receiver<Membership>,
    ) -> Self {
        Network {
            id,
            msg_id: AtomicUsize::new(0),
            peers,
            membership,
        }
    }

    /// A snapshot of the current membership
    pub fn membership(&self) -> Membership {
        self.membership.borrow().clone()
    }

    /// A receiver that is notified on every membership change
    pub fn watch_membership(&self) -> watch::Receiver<Membership> {
        self.membership.clone()
    }

    /// Sends `msg` to the node with the given `target_id`. Fails with
    /// `NodeLost` if that node is not (or is no longer) connected.
    pub async fn send_msg(
        &self,
        target_id: usize,
        msg: T,
    ) -> Result<(), LiquidError> {
        let sender = { self.peers.read().get(&target_id).cloned() };
        let sender = sender.ok_or(LiquidError::NodeLost(target_id))?;
        let msg_id = self.msg_id.fetch_add(1, Ordering::Relaxed);
        sender
            .send(Message {
                msg_id,
                sender_id: self.id,
                target_id,
                msg,
            })
            .await
            .map_err(|_| LiquidError::NodeLost(target_id))?;
        log::trace!("Sent message {} to node {}", msg_id, target_id);
        Ok(())
    }

    /// Sends `msg` to every member other than this node
    pub async fn broadcast(&self, msg: T) -> Result<(), LiquidError>
    where
        T: Clone,
    {
        let targets: Vec<usize> = self
            .membership()
            .nodes
            .into_iter()
            .filter(|id| *id != self.id)
            .collect();
        for target in targets {
            self.send_msg(target, msg.clone()).await?;
        }
        Ok(())
    }
}
