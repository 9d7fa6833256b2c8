use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};
use crate::buffers::buffer_pool::{Buffer, BufferPool};
use crate::config::Profile;

/// A datagram socket bound to a single peer. This is the abstraction the protocol engine is
///  written against, introduced to share the engine between dialed and accepted connections and
///  to facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// sends a single datagram to the peer
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// receives the next datagram from the peer into a buffer from the pool
    async fn recv(&self, pool: &Arc<BufferPool>) -> io::Result<Buffer>;

    fn peer_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> SocketAddr;
}

/// Creates a non-blocking UDP socket with the profile's OS buffer sizes
pub fn bind_udp(addr: SocketAddr, profile: &Profile) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(profile.rx_buffer_size) {
        warn!("could not set UDP receive buffer size to {}: {}", profile.rx_buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(profile.tx_buffer_size) {
        warn!("could not set UDP send buffer size to {}: {}", profile.tx_buffer_size, e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Receives a single datagram from any address into a pooled buffer
pub async fn recv_from_into(socket: &UdpSocket, pool: &Arc<BufferPool>) -> io::Result<(Buffer, SocketAddr)> {
    let mut buffer = pool.get();
    let data = buffer.data_mut()
        .ok_or_else(|| io::Error::other("freshly acquired buffer is shared"))?;
    let (_, from) = socket.recv_buf_from(data).await?;
    Ok((buffer, from))
}

/// A UDP socket connected to the peer, owned by a dialed connection
pub struct ConnectedSocket {
    socket: UdpSocket,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl ConnectedSocket {
    pub async fn connect(peer_addr: SocketAddr, profile: &Profile) -> io::Result<ConnectedSocket> {
        let bind_addr: SocketAddr = if peer_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        }
        else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = bind_udp(bind_addr, profile)?;
        socket.connect(peer_addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(ConnectedSocket {
            socket,
            peer_addr,
            local_addr,
        })
    }
}

#[async_trait]
impl DatagramSocket for ConnectedSocket {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), self.peer_addr);
        self.socket.send(datagram).await?;
        Ok(())
    }

    async fn recv(&self, pool: &Arc<BufferPool>) -> io::Result<Buffer> {
        let mut buffer = pool.get();
        let data = buffer.data_mut()
            .ok_or_else(|| io::Error::other("freshly acquired buffer is shared"))?;
        self.socket.recv_buf(data).await?;
        Ok(buffer)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// One peer's view of a listener's shared UDP socket: sending goes directly to the socket, while
///  received datagrams are demultiplexed by the listener and queued for the connection
pub struct ListenerSocket {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    inbound: Mutex<mpsc::Receiver<Buffer>>,
}

impl ListenerSocket {
    pub fn new(socket: Arc<UdpSocket>, local_addr: SocketAddr, peer_addr: SocketAddr, inbound: mpsc::Receiver<Buffer>) -> ListenerSocket {
        ListenerSocket {
            socket,
            peer_addr,
            local_addr,
            inbound: Mutex::new(inbound),
        }
    }
}

#[async_trait]
impl DatagramSocket for ListenerSocket {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), self.peer_addr);
        self.socket.send_to(datagram, self.peer_addr).await?;
        Ok(())
    }

    async fn recv(&self, _pool: &Arc<BufferPool>) -> io::Result<Buffer> {
        self.inbound.lock().await
            .recv().await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "listener was closed"))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
