use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Level};
use crate::buffers::buffer_pool::{Buffer, BufferPool};
use crate::config::Profile;
use crate::connection::Connection;
use crate::datagram_socket::{bind_udp, recv_from_into, DatagramSocket, ListenerSocket};
use crate::instrument::Instrument;
use crate::wire_message::{peek_message_type, MessageType};

/// Accepts connections on a single UDP socket that is shared by all of them.
///
/// A demultiplexing task receives every datagram and queues it for the connection of the address
///  it came from. A HELLO from an unknown address starts a new handshake, and the connection is
///  queued for [Listener::accept] once the handshake completes. A peer is forgotten when its
///  handshake fails or its connection reaches its terminal state. Dropping the listener stops the
///  demultiplexing, which ends all connections accepted through it.
pub struct Listener {
    local_addr: SocketAddr,
    accepted: Mutex<mpsc::Receiver<Connection>>,
    num_peers: Arc<AtomicUsize>,
    demux: JoinHandle<()>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, profile: Arc<Profile>, pool: Arc<BufferPool>, instrument: Arc<dyn Instrument>) -> anyhow::Result<Listener> {
        profile.validate()?;
        let socket = Arc::new(bind_udp(addr, &profile)?);
        let local_addr = socket.local_addr()?;
        info!("listening on {:?}", local_addr);

        let (accept_queue, accepted) = mpsc::channel(profile.accept_queue_len);
        let (gone, gone_rx) = mpsc::unbounded_channel();
        let num_peers = Arc::new(AtomicUsize::new(0));
        let demux = Demux {
            socket,
            local_addr,
            profile,
            pool,
            instrument,
            accept_queue,
            gone,
            peers: FxHashMap::default(),
            next_peer_id: 0,
            num_peers: num_peers.clone(),
        };

        Ok(Listener {
            local_addr,
            accepted: Mutex::new(accepted),
            num_peers,
            demux: tokio::spawn(demux.run(gone_rx)),
        })
    }

    /// Waits for the next connection that completed its handshake
    pub async fn accept(&self) -> anyhow::Result<Connection> {
        self.accepted.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("listener on {:?} stopped", self.local_addr))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// number of peers with a handshake or a connection in progress
    pub fn num_peers(&self) -> usize {
        self.num_peers.load(Ordering::Relaxed)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// A peer's inbound queue. The id tells it apart from an earlier peer with the same address.
struct Peer {
    id: u64,
    queue: mpsc::Sender<Buffer>,
}

/// reports the address and id of a peer whose handshake failed or whose connection ended
type GonePeers = mpsc::UnboundedSender<(SocketAddr, u64)>;

struct Demux {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    profile: Arc<Profile>,
    pool: Arc<BufferPool>,
    instrument: Arc<dyn Instrument>,
    accept_queue: mpsc::Sender<Connection>,
    gone: GonePeers,
    peers: FxHashMap<SocketAddr, Peer>,
    next_peer_id: u64,
    num_peers: Arc<AtomicUsize>,
}

impl Demux {
    async fn run(mut self, mut gone: mpsc::UnboundedReceiver<(SocketAddr, u64)>) {
        info!("starting receive loop on {:?}", self.local_addr);

        loop {
            select! {
                received = recv_from_into(&self.socket, &self.pool) => {
                    let (buffer, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };

                    let span = span!(Level::TRACE, "datagram_received", ?from);
                    let _entered = span.enter();
                    trace!("received {} bytes", buffer.len());

                    self.dispatch(from, buffer);
                }
                Some((addr, id)) = gone.recv() => {
                    self.forget(addr, id);
                }
            }
            self.num_peers.store(self.peers.len(), Ordering::Relaxed);
        }
    }

    fn forget(&mut self, addr: SocketAddr, id: u64) {
        if self.peers.get(&addr).map_or(false, |peer| peer.id == id) {
            debug!("forgetting peer {:?}", addr);
            self.peers.remove(&addr);
        }
    }

    fn dispatch(&mut self, from: SocketAddr, buffer: Buffer) {
        let buffer = match self.peers.get(&from) {
            Some(peer) => match peer.queue.try_send(buffer) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    debug!("inbound queue is full - dropping datagram");
                    return;
                }
                Err(TrySendError::Closed(buffer)) => {
                    debug!("connection is gone - forgetting the peer");
                    buffer
                }
            },
            None => buffer,
        };
        self.peers.remove(&from);

        if peek_message_type(buffer.as_ref()) != Some(MessageType::Hello) {
            debug!("unknown peer and no HELLO - dropping datagram");
            return;
        }

        debug!("HELLO from new peer");
        let (queue, inbound) = mpsc::channel(self.profile.listener_rx_queue_len);
        if queue.try_send(buffer).is_err() {
            warn!("inbound queue can not hold the HELLO - dropping it");
            return;
        }
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.insert(from, Peer { id, queue });

        let socket = Arc::new(ListenerSocket::new(self.socket.clone(), self.local_addr, from, inbound));
        tokio::spawn(accept_peer(socket, id, self.profile.clone(), self.pool.clone(), self.instrument.clone(), self.accept_queue.clone(), self.gone.clone()));
    }
}

async fn accept_peer(
    socket: Arc<ListenerSocket>,
    id: u64,
    profile: Arc<Profile>,
    pool: Arc<BufferPool>,
    instrument: Arc<dyn Instrument>,
    accept_queue: mpsc::Sender<Connection>,
    gone: GonePeers,
) {
    let peer_addr = socket.peer_addr();
    match Connection::accept_over(socket, profile, pool, instrument).await {
        Ok(connection) => {
            info!("accepted connection from {:?}", peer_addr);
            let on_close = gone.clone();
            connection.on_close(move || {
                let _ = on_close.send((peer_addr, id));
            });
            if accept_queue.send(connection).await.is_err() {
                debug!("listener stopped - dropping connection from {:?}", peer_addr);
                let _ = gone.send((peer_addr, id));
            }
        }
        Err(e) => {
            warn!("handshake with {:?} failed: {}", peer_addr, e);
            let _ = gone.send((peer_addr, id));
        }
    }
}
