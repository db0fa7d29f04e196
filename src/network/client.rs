//! Represents a client node in a distributed system that talks to the other
//! nodes over TCP.
use crate::config::NetworkConfig;
use crate::error::LiquidError;
use crate::network::{
    message, ControlMsg, Membership, Message, MessageCodec, Network,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{self, ReadHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{
    mpsc::{self, Receiver, Sender},
    watch, Notify,
};
use tokio_util::codec::{FramedRead, FramedWrite};

type ControlStream = FramedRead<ReadHalf<TcpStream>, MessageCodec<ControlMsg>>;

/// Represents a `Client` node in a distributed system that is generic for
/// type `T`, where `T` is the types of messages that can be sent between
/// `Client`s.
///
/// The `Client` owns the connections of one node: it listens for inbound
/// connections from other nodes, opens an outbound connection to every node
/// in the directory sent by the registration [`Server`](super::Server), and
/// keeps both in sync with the directory as nodes come and go.
#[derive(Debug)]
pub struct Client<T> {
    /// The `id` of this `Client`, assigned by the `Server` in the order
    /// nodes register
    pub id: usize,
    /// The `address` this `Client` listens on
    pub address: SocketAddr,
    /// Outbound queues to every other node and the inbound queue of this one
    peers: Arc<RwLock<HashMap<usize, Sender<Message<T>>>>>,
    membership: watch::Sender<Membership>,
    config: NetworkConfig,
}

impl<T: Send + Sync + Serialize + DeserializeOwned + 'static> Client<T> {
    /// Registers with the `Server` at `server_addr` and connects to every
    /// node it already knows about. Returns this node's `Network`, the
    /// receiver that messages from other nodes arrive on, and a notifier that
    /// fires when the `Server` sends a `Kill` message.
    ///
    /// `my_ip` is the IP to listen on; the port is picked by the OS.
    pub async fn join(
        server_addr: &str,
        my_ip: &str,
        config: &NetworkConfig,
    ) -> Result<(Network<T>, Receiver<Message<T>>, Arc<Notify>), LiquidError>
    {
        let listener = TcpListener::bind(format!("{}:0", my_ip)).await?;
        let address = listener.local_addr()?;

        // Register with the server, it responds with our id and everyone
        // that is currently connected
        let server_stream = TcpStream::connect(server_addr).await?;
        let (reader, writer) = io::split(server_stream);
        let mut stream =
            FramedRead::new(reader, MessageCodec::new(config.max_frame_bytes));
        let mut sink =
            FramedWrite::new(writer, MessageCodec::new(config.max_frame_bytes));
        sink.send(Message::new(0, 0, 0, ControlMsg::Introduction { address }))
            .await?;
        let dir_msg = message::read_msg(&mut stream).await?;
        let id = dir_msg.target_id;
        let (epoch, dir) = match dir_msg.msg {
            ControlMsg::Directory { epoch, dir } => (epoch, dir),
            _ => return Err(LiquidError::UnexpectedMessage),
        };
        info!("Client got id {} running at address {}", id, address);

        let (inbound, receiver) = mpsc::channel(config.channel_capacity);
        let mut peers = HashMap::new();
        peers.insert(id, inbound.clone());
        let (membership, membership_rx) = watch::channel(Membership::default());
        let client = Client {
            id,
            address,
            peers: Arc::new(RwLock::new(peers)),
            membership,
            config: config.clone(),
        };

        client.accept_new_connections(listener, inbound);
        client.update_directory(epoch, dir).await;

        let network = Network::new(id, client.peers.clone(), membership_rx);
        let kill_notifier = Arc::new(Notify::new());
        // the server connection stays open for as long as we are a member
        tokio::spawn(client.recv_server_msg(stream, sink, kill_notifier.clone()));
        Ok((network, receiver, kill_notifier))
    }

    /// Spawns a task that accepts connections from other `Client`s, reads
    /// their introduction, and forwards every further message onto `inbound`
    fn accept_new_connections(
        &self,
        listener: TcpListener,
        inbound: Sender<Message<T>>,
    ) {
        let max_frame_bytes = self.config.max_frame_bytes;
        tokio::spawn(async move {
            loop {
                let socket = match listener.accept().await {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        error!("Stopped accepting connections: {}", e);
                        return;
                    }
                };
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    let (reader, _) = io::split(socket);
                    let mut stream = FramedRead::new(
                        reader,
                        MessageCodec::<ControlMsg>::new(max_frame_bytes),
                    );
                    let intro = match message::read_msg(&mut stream).await {
                        Ok(intro) => intro,
                        Err(e) => {
                            warn!("Bad introduction from a peer: {}", e);
                            return;
                        }
                    };
                    info!("Accepted a connection from node {}", intro.sender_id);
                    let mut stream = stream.map_decoder(MessageCodec::retype::<T>);
                    while let Some(msg) = stream.next().await {
                        match msg {
                            Ok(msg) => {
                                if inbound.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!("Connection to node {} failed: {}", intro.sender_id, e);
                                return;
                            }
                        }
                    }
                    debug!("Node {} closed its connection", intro.sender_id);
                });
            }
        });
    }

    /// Opens an outbound connection to the `Client` with the given `id` at
    /// `addr`, returning the queue that feeds it.
    async fn connect(
        &self,
        id: usize,
        addr: SocketAddr,
    ) -> Result<Sender<Message<T>>, LiquidError> {
        let stream = TcpStream::connect(addr).await?;
        let (_, writer) = io::split(stream);
        let mut sink = FramedWrite::new(
            writer,
            MessageCodec::<ControlMsg>::new(self.config.max_frame_bytes),
        );
        sink.send(Message::new(
            0,
            self.id,
            id,
            ControlMsg::Introduction {
                address: self.address,
            },
        ))
        .await?;
        let mut sink = sink.map_encoder(MessageCodec::retype::<T>);
        let (sender, mut receiver) =
            mpsc::channel::<Message<T>>(self.config.channel_capacity);
        tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                if let Err(e) = sink.send(msg).await {
                    error!("Failed to send to node {}: {}", id, e);
                    return;
                }
            }
        });
        info!("Connected to id: {} at address: {}", id, addr);
        Ok(sender)
    }

    /// Connects to nodes that are new in `dir`, drops the ones that left, and
    /// then publishes the new `Membership`
    async fn update_directory(&self, epoch: u64, dir: Vec<(usize, SocketAddr)>) {
        let mut nodes = vec![self.id];
        for (id, addr) in &dir {
            if *id == self.id {
                continue;
            }
            let known = { self.peers.read().contains_key(id) };
            if known {
                nodes.push(*id);
                continue;
            }
            match self.connect(*id, *addr).await {
                Ok(sender) => {
                    self.peers.write().insert(*id, sender);
                    nodes.push(*id);
                }
                Err(e) => warn!("Could not connect to node {}: {}", id, e),
            }
        }
        let live: Vec<usize> = dir.iter().map(|(id, _)| *id).collect();
        self.peers
            .write()
            .retain(|id, _| *id == self.id || live.contains(id));
        self.membership.send_replace(Membership::new(epoch, nodes));
    }

    /// Processes directory updates and `Kill` messages from the `Server`
    /// until the connection to it closes
    async fn recv_server_msg(
        self,
        mut stream: ControlStream,
        // held so the server sees this node as connected
        _sink: FramedWrite<io::WriteHalf<TcpStream>, MessageCodec<ControlMsg>>,
        kill_notifier: Arc<Notify>,
    ) {
        loop {
            match message::read_msg(&mut stream).await {
                Ok(Message {
                    msg: ControlMsg::Directory { epoch, dir },
                    ..
                }) => self.update_directory(epoch, dir).await,
                Ok(Message {
                    msg: ControlMsg::Kill,
                    ..
                }) => {
                    info!("Node {} received a kill message", self.id);
                    kill_notifier.notify_one();
                    return;
                }
                Ok(_) => warn!("Unexpected message from the server"),
                Err(e) => {
                    warn!("Lost the connection to the server: {}", e);
                    kill_notifier.notify_one();
                    return;
                }
            }
        }
    }
}
