use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;
use crate::wire_message::MessageType;

/// Observability hooks, called synchronously from the protocol's hot paths. Implementations
///  must not block; all methods default to doing nothing.
pub trait Instrument: Send + Sync + 'static {
    fn connected(&self, _peer: SocketAddr) {}
    fn closed(&self, _peer: SocketAddr) {}

    fn wire_message_tx(&self, _peer: SocketAddr, _message_type: MessageType, _seq: i32, _len: usize) {}
    fn wire_message_rx(&self, _peer: SocketAddr, _message_type: MessageType, _seq: i32, _len: usize) {}
    fn wire_message_retx(&self, _peer: SocketAddr, _seq: i32) {}

    fn duplicate_rx(&self, _peer: SocketAddr, _seq: i32) {}
    fn duplicate_ack(&self, _peer: SocketAddr, _seq: i32) {}

    fn new_window(&self, _peer: SocketAddr, _window_size: usize) {}
    fn new_retx(&self, _peer: SocketAddr, _rtt: Duration, _retx: Duration) {}
}

pub struct NoopInstrument;
impl Instrument for NoopInstrument {}

/// Keeps counters for all events and logs window and RTT changes at trace level
#[derive(Default)]
pub struct CountingInstrument {
    pub connected: AtomicU64,
    pub closed: AtomicU64,
    pub tx: AtomicU64,
    pub rx: AtomicU64,
    pub retx: AtomicU64,
    pub duplicate_rx: AtomicU64,
    pub duplicate_ack: AtomicU64,
    pub window_size: AtomicUsize,
}

impl CountingInstrument {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

impl Instrument for CountingInstrument {
    fn connected(&self, _peer: SocketAddr) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self, _peer: SocketAddr) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn wire_message_tx(&self, _peer: SocketAddr, _message_type: MessageType, _seq: i32, _len: usize) {
        self.tx.fetch_add(1, Ordering::Relaxed);
    }

    fn wire_message_rx(&self, _peer: SocketAddr, _message_type: MessageType, _seq: i32, _len: usize) {
        self.rx.fetch_add(1, Ordering::Relaxed);
    }

    fn wire_message_retx(&self, _peer: SocketAddr, _seq: i32) {
        self.retx.fetch_add(1, Ordering::Relaxed);
    }

    fn duplicate_rx(&self, _peer: SocketAddr, _seq: i32) {
        self.duplicate_rx.fetch_add(1, Ordering::Relaxed);
    }

    fn duplicate_ack(&self, _peer: SocketAddr, _seq: i32) {
        self.duplicate_ack.fetch_add(1, Ordering::Relaxed);
    }

    fn new_window(&self, peer: SocketAddr, window_size: usize) {
        trace!("{}: window size {}", peer, window_size);
        self.window_size.store(window_size, Ordering::Relaxed);
    }

    fn new_retx(&self, peer: SocketAddr, rtt: Duration, retx: Duration) {
        trace!("{}: rtt {:?}, retransmission after {:?}", peer, rtt, retx);
    }
}
