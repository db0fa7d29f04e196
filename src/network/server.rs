//! Represents a registration server that assigns ids to nodes and keeps every
//! node informed of the current directory of nodes.
use crate::error::LiquidError;
use crate::network::{message, ControlMsg, Message, MessageCodec};
use futures::SinkExt;
use log::{error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{self, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

type FramedSink = FramedWrite<WriteHalf<TcpStream>, MessageCodec<ControlMsg>>;

/// A registered node: where it listens and how to reach it
#[derive(Debug)]
struct Registration {
    address: SocketAddr,
    sink: FramedSink,
}

/// Represents a registration `Server` in a distributed system.
#[derive(Debug)]
pub struct Server {
    /// The `address` of this `Server`
    pub address: SocketAddr,
    /// The id of the current message
    msg_id: usize,
    /// The next id to hand out, ids start at `1`
    next_id: usize,
    /// Incremented whenever the directory changes
    epoch: u64,
    /// A map of node id to the registration of that node
    directory: HashMap<usize, Registration>,
    /// A `TcpListener` which listens for connections from new `Client`s
    listener: TcpListener,
    /// Notified to shut down the server and every registered node
    kill_notifier: Arc<Notify>,
    max_frame_bytes: usize,
}

impl Server {
    /// Create a new `Server` running on the given `address` in the format of
    /// `IP:Port`
    pub async fn new(
        address: &str,
        max_frame_bytes: usize,
    ) -> Result<Self, LiquidError> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        info!("Registration server listening on {}", address);
        Ok(Server {
            address,
            msg_id: 0,
            next_id: 1,
            epoch: 0,
            directory: HashMap::new(),
            listener,
            kill_notifier: Arc::new(Notify::new()),
            max_frame_bytes,
        })
    }

    /// A handle that, once notified, makes `accept_new_connections` send a
    /// `Kill` message to every node and return
    pub fn kill_notifier(&self) -> Arc<Notify> {
        self.kill_notifier.clone()
    }

    /// Accepts registrations until the kill notifier fires. Every time a node
    /// registers or its connection closes, the new directory is broadcast to
    /// all registered nodes.
    pub async fn accept_new_connections(&mut self) -> Result<(), LiquidError> {
        let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel();
        let kill_notifier = self.kill_notifier.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, _) = accepted?;
                    match self.register(socket, disconnect_tx.clone()).await {
                        Ok(id) => info!("Registered node {}", id),
                        Err(e) => warn!("Failed to register a node: {}", e),
                    }
                    self.broadcast_directory().await;
                }
                Some(id) = disconnect_rx.recv() => {
                    if self.directory.remove(&id).is_some() {
                        info!("Node {} disconnected", id);
                        self.epoch += 1;
                        self.broadcast_directory().await;
                    }
                }
                _ = kill_notifier.notified() => {
                    info!("Shutting down all nodes");
                    let ids: Vec<usize> = self.directory.keys().copied().collect();
                    let sent = self.kill_all(&ids).await;
                    info!("Sent Kill to {} of {} nodes", sent, ids.len());
                    return Ok(());
                }
            }
        }
    }

    async fn register(
        &mut self,
        socket: TcpStream,
        disconnected: mpsc::UnboundedSender<usize>,
    ) -> Result<usize, LiquidError> {
        let (reader, writer) = io::split(socket);
        let mut stream = FramedRead::new(
            reader,
            MessageCodec::<ControlMsg>::new(self.max_frame_bytes),
        );
        let sink =
            FramedWrite::new(writer, MessageCodec::new(self.max_frame_bytes));
        let intro = message::read_msg(&mut stream).await?;
        let address = match intro.msg {
            ControlMsg::Introduction { address } => address,
            _ => return Err(LiquidError::UnexpectedMessage),
        };
        let id = self.next_id;
        self.next_id += 1;
        self.epoch += 1;
        self.directory.insert(id, Registration { address, sink });

        // the connection closing is how we learn the node has left
        tokio::spawn(async move {
            while let Some(Ok(_)) = futures::StreamExt::next(&mut stream).await
            {
            }
            let _ = disconnected.send(id);
        });
        Ok(id)
    }

    async fn broadcast_directory(&mut self) {
        let mut dir: Vec<(usize, SocketAddr)> = self
            .directory
            .iter()
            .map(|(id, r)| (*id, r.address))
            .collect();
        dir.sort_unstable();
        let ids: Vec<usize> = dir.iter().map(|(id, _)| *id).collect();
        for id in ids {
            let msg = ControlMsg::Directory {
                epoch: self.epoch,
                dir: dir.clone(),
            };
            if let Err(e) = self.send_msg(id, msg).await {
                warn!("Could not send the directory to node {}: {}", id, e);
            }
        }
    }

    /// Sends `Kill` to each of `ids` and returns how many sends succeeded
    async fn kill_all(&mut self, ids: &[usize]) -> usize {
        let mut sent = 0;
        for &id in ids {
            match self.send_msg(id, ControlMsg::Kill).await {
                Ok(()) => sent += 1,
                Err(e) => error!("Could not send Kill to node {}: {}", id, e),
            }
        }
        sent
    }

    /// Send a message to a client with the given `target_id`.
    async fn send_msg(
        &mut self,
        target_id: usize,
        msg: ControlMsg,
    ) -> Result<(), LiquidError> {
        match self.directory.get_mut(&target_id) {
            None => Err(LiquidError::UnknownId),
            Some(reg) => {
                let m = Message::new(self.msg_id, 0, target_id, msg);
                reg.sink.send(m).await?;
                self.msg_id += 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kill_continues_past_a_failed_send() {
        let mut server = Server::new("127.0.0.1:0", 1024).await.unwrap();
        let socket = TcpStream::connect(server.address).await.unwrap();
        let (accepted, _) = server.listener.accept().await.unwrap();
        let (reader, writer) = io::split(socket);
        let mut sink = FramedWrite::new(writer, MessageCodec::<ControlMsg>::new(1024));
        let mut stream = FramedRead::new(reader, MessageCodec::<ControlMsg>::new(1024));
        let intro = ControlMsg::Introduction {
            address: "127.0.0.1:9001".parse().unwrap(),
        };
        sink.send(Message::new(0, 0, 0, intro)).await.unwrap();
        let (disconnected, _rx) = mpsc::unbounded_channel();
        let id = server.register(accepted, disconnected).await.unwrap();

        // the first id is unknown, the registered node still gets its Kill
        assert_eq!(server.kill_all(&[id + 1, id]).await, 1);
        let msg = message::read_msg(&mut stream).await.unwrap();
        assert_eq!(msg.msg, ControlMsg::Kill);
    }
}
