//! An in-process transport: every node of the cluster runs in this process
//! and messages are handed over through `mpsc` channels.
use crate::error::LiquidError;
use crate::network::{Membership, Message, Network};
use log::info;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{self, Receiver, Sender},
    watch,
};

/// A hub that nodes join and leave. Cloning a `LocalNetwork` gives another
/// handle on the same hub.
#[derive(Debug, Clone)]
pub struct LocalNetwork<T> {
    inner: Arc<Mutex<Hub<T>>>,
}

#[derive(Debug)]
struct Hub<T> {
    /// The inbound queue of every member, shared with each member's `Network`
    peers: Arc<RwLock<HashMap<usize, Sender<Message<T>>>>>,
    membership: watch::Sender<Membership>,
    capacity: usize,
}

impl<T: Send + 'static> LocalNetwork<T> {
    /// Creates an empty hub whose inbound queues hold `capacity` messages
    pub fn new(capacity: usize) -> Self {
        let (membership, _) = watch::channel(Membership::default());
        LocalNetwork {
            inner: Arc::new(Mutex::new(Hub {
                peers: Arc::new(RwLock::new(HashMap::new())),
                membership,
                capacity,
            })),
        }
    }

    /// Adds a node with the given `id`, returning its `Network` and the
    /// receiver its inbound messages arrive on.
    pub fn join(
        &self,
        id: usize,
    ) -> Result<(Network<T>, Receiver<Message<T>>), LiquidError> {
        let hub = self.inner.lock();
        let (sender, receiver) = mpsc::channel(hub.capacity);
        {
            let mut peers = hub.peers.write();
            if peers.contains_key(&id) {
                return Err(LiquidError::UnexpectedMessage);
            }
            peers.insert(id, sender);
        }
        let current = hub.membership.borrow().clone();
        let mut nodes = current.nodes;
        nodes.push(id);
        hub.membership
            .send_replace(Membership::new(current.epoch + 1, nodes));
        info!("Node {} joined the local network", id);
        let network =
            Network::new(id, hub.peers.clone(), hub.membership.subscribe());
        Ok((network, receiver))
    }

    /// Removes the node with the given `id`. Its inbound receiver is closed
    /// and every other member sees a new `Membership`.
    pub fn leave(&self, id: usize) {
        let hub = self.inner.lock();
        hub.peers.write().remove(&id);
        let current = hub.membership.borrow().clone();
        let nodes = current.nodes.into_iter().filter(|n| *n != id).collect();
        hub.membership
            .send_replace(Membership::new(current.epoch + 1, nodes));
        info!("Node {} left the local network", id);
    }

    /// The current membership of the hub
    pub fn membership(&self) -> Membership {
        self.inner.lock().membership.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_between_members() {
        let hub = LocalNetwork::<String>::new(8);
        let (n1, mut r1) = hub.join(1).unwrap();
        let (n2, mut r2) = hub.join(2).unwrap();
        assert_eq!(hub.membership().nodes, vec![1, 2]);
        assert_eq!(n1.membership().epoch, 2);

        n1.send_msg(2, "hello".to_string()).await.unwrap();
        let msg = r2.recv().await.unwrap();
        assert_eq!(msg.sender_id, 1);
        assert_eq!(msg.target_id, 2);
        assert_eq!(msg.msg, "hello");

        n2.send_msg(2, "self".to_string()).await.unwrap();
        assert_eq!(r2.recv().await.unwrap().msg, "self");

        n2.broadcast("all".to_string()).await.unwrap();
        assert_eq!(r1.recv().await.unwrap().msg, "all");
    }

    #[tokio::test]
    async fn test_leave() {
        let hub = LocalNetwork::<u8>::new(8);
        let (n1, _r1) = hub.join(1).unwrap();
        let (_n2, mut r2) = hub.join(2).unwrap();
        assert!(hub.join(2).is_err());
        let mut watch = n1.watch_membership();
        hub.leave(2);
        watch.changed().await.unwrap();
        assert!(!watch.borrow().contains(2));
        assert!(matches!(
            n1.send_msg(2, 0).await,
            Err(LiquidError::NodeLost(2))
        ));
        assert!(r2.recv().await.is_none());
    }
}
