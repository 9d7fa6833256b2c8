use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;
use crate::buffers::buffer_pool::{Buffer, BufferPool};
use crate::datagram_socket::DatagramSocket;
use crate::wire_message::{peek_message_type, MessageType};

/// Deterministic faults applied to the datagrams sent through one end of a [memory_link]. A
///  value of 0 disables the respective fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkFaults {
    /// every n-th DATA datagram is lost
    pub drop_every_nth_data: u64,
    /// the n-th datagram of any type is lost, counting from 1
    pub drop_nth_datagram: u64,
    /// every n-th datagram is delivered twice
    pub duplicate_every_nth: u64,
    /// every n-th datagram is held back and delivered after the datagram following it
    pub swap_every_nth: u64,
}

impl LinkFaults {
    pub fn drop_every_nth_data(n: u64) -> LinkFaults {
        LinkFaults {
            drop_every_nth_data: n,
            ..LinkFaults::default()
        }
    }
}

fn is_nth(count: u64, n: u64) -> bool {
    n > 0 && count % n == 0
}

#[derive(Debug, Default)]
pub struct LinkStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
    pub duplicated: AtomicU64,
    pub swapped: AtomicU64,
}

impl LinkStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

struct Outbound {
    peer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    faults: LinkFaults,
    num_datagrams: u64,
    num_data: u64,
    held_back: Option<Vec<u8>>,
}

/// One end of an in-memory datagram link. Datagrams are never reordered or lost unless
///  [LinkFaults] say so.
pub struct MemorySocket {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    outbound: Mutex<Outbound>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    stats: Arc<LinkStats>,
}

/// Creates a connected pair of in-memory sockets, with `faults_a` applied to datagrams sent by
///  `a` and `faults_b` to datagrams sent by `b`
pub fn memory_link(addr_a: SocketAddr, addr_b: SocketAddr, faults_a: LinkFaults, faults_b: LinkFaults) -> (MemorySocket, MemorySocket) {
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();
    (
        MemorySocket::new(addr_a, addr_b, to_b, from_b, faults_a),
        MemorySocket::new(addr_b, addr_a, to_a, from_a, faults_b),
    )
}

impl MemorySocket {
    fn new(local_addr: SocketAddr, peer_addr: SocketAddr, peer: mpsc::UnboundedSender<Vec<u8>>, inbound: mpsc::UnboundedReceiver<Vec<u8>>, faults: LinkFaults) -> MemorySocket {
        MemorySocket {
            local_addr,
            peer_addr,
            outbound: Mutex::new(Outbound {
                peer: Some(peer),
                faults,
                num_datagrams: 0,
                num_data: 0,
                held_back: None,
            }),
            inbound: tokio::sync::Mutex::new(inbound),
            stats: Default::default(),
        }
    }

    fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// statistics for the datagrams sent through this end
    pub fn stats(&self) -> Arc<LinkStats> {
        self.stats.clone()
    }

    pub fn set_faults(&self, faults: LinkFaults) {
        self.outbound().faults = faults;
    }

    /// Breaks the link: sending through this end fails from now on, and the peer's receive fails
    ///  once it consumed the datagrams already in transit
    pub fn sever(&self) {
        let mut outbound = self.outbound();
        outbound.peer = None;
        outbound.held_back = None;
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let mut outbound = self.outbound();
        let Some(peer) = outbound.peer.clone() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link was severed"));
        };
        self.stats.sent.fetch_add(1, Ordering::Relaxed);

        outbound.num_datagrams += 1;
        let num_datagrams = outbound.num_datagrams;

        if num_datagrams == outbound.faults.drop_nth_datagram {
            trace!("{:?}: dropping datagram #{}", self.local_addr, num_datagrams);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if peek_message_type(datagram) == Some(MessageType::Data) {
            outbound.num_data += 1;
            if is_nth(outbound.num_data, outbound.faults.drop_every_nth_data) {
                trace!("{:?}: dropping DATA datagram", self.local_addr);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let mut deliver = vec![datagram.to_vec()];
        if is_nth(num_datagrams, outbound.faults.duplicate_every_nth) {
            self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
            deliver.push(datagram.to_vec());
        }

        if let Some(held_back) = outbound.held_back.take() {
            deliver.push(held_back);
        }
        else if is_nth(num_datagrams, outbound.faults.swap_every_nth) {
            self.stats.swapped.fetch_add(1, Ordering::Relaxed);
            outbound.held_back = deliver.pop();
        }

        for d in deliver {
            // a receiver that is gone behaves like a peer that does not listen
            let _ = peer.send(d);
        }
        Ok(())
    }

    async fn recv(&self, pool: &Arc<BufferPool>) -> io::Result<Buffer> {
        let datagram = self.inbound.lock().await
            .recv().await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "link was severed"))?;

        let mut buffer = pool.get();
        buffer.data_mut()
            .ok_or_else(|| io::Error::other("freshly acquired buffer is shared"))?
            .extend_from_slice(&datagram);
        Ok(buffer)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_addr_from_number;
    use crate::wire_message::WireMessage;

    fn pair(faults: LinkFaults) -> (MemorySocket, MemorySocket) {
        memory_link(test_addr_from_number(1), test_addr_from_number(2), faults, LinkFaults::default())
    }

    async fn received(socket: &MemorySocket, pool: &Arc<BufferPool>, n: usize) -> Vec<Vec<u8>> {
        let mut result = vec![];
        for _ in 0..n {
            result.push(socket.recv(pool).await.unwrap().as_ref().to_vec());
        }
        result
    }

    #[tokio::test]
    async fn test_plain_link() {
        let pool = BufferPool::new(128, 4);
        let (a, b) = pair(LinkFaults::default());
        assert_eq!(a.peer_addr(), b.local_addr());

        a.send(b"one").await.unwrap();
        b.send(b"two").await.unwrap();
        a.send(b"three").await.unwrap();

        assert_eq!(received(&b, &pool, 2).await, vec![b"one".to_vec(), b"three".to_vec()]);
        assert_eq!(received(&a, &pool, 1).await, vec![b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_drop_every_nth_data() {
        let pool = BufferPool::new(128, 4);
        let (a, b) = pair(LinkFaults::drop_every_nth_data(2));

        for seq in 0..4 {
            let data = WireMessage::new_data(seq, None, b"x", &pool).unwrap();
            a.send(data.as_bytes()).await.unwrap();
            a.send(WireMessage::new_close(100 + seq, &pool).unwrap().as_bytes()).await.unwrap();
        }
        drop(a);

        let mut seqs = vec![];
        while let Ok(buffer) = b.recv(&pool).await {
            seqs.push(WireMessage::decode(buffer).unwrap().seq);
        }
        assert_eq!(seqs, vec![0, 100, 101, 2, 102, 103]);
    }

    #[tokio::test]
    async fn test_duplicate_and_swap() {
        let pool = BufferPool::new(128, 4);
        let (a, b) = pair(LinkFaults {
            duplicate_every_nth: 3,
            swap_every_nth: 2,
            ..LinkFaults::default()
        });

        for d in [b"1", b"2", b"3", b"4", b"5"] {
            a.send(d).await.unwrap();
        }
        let stats = a.stats();
        assert_eq!(LinkStats::get(&stats.duplicated), 1);
        assert_eq!(LinkStats::get(&stats.swapped), 2);

        assert_eq!(received(&b, &pool, 5).await, vec![
            b"1".to_vec(),
            b"3".to_vec(), b"3".to_vec(), b"2".to_vec(),
            b"5".to_vec(),
        ]);
    }

    #[tokio::test]
    async fn test_sever() {
        let pool = BufferPool::new(128, 4);
        let (a, b) = pair(LinkFaults::default());

        a.send(b"in transit").await.unwrap();
        a.sever();
        assert_eq!(a.send(b"late").await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);

        assert_eq!(b.recv(&pool).await.unwrap().as_ref(), b"in transit");
        assert_eq!(b.recv(&pool).await.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }
}
