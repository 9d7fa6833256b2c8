use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::acks::Ack;
use crate::buffers::buffer_pool::BufferPool;
use crate::closer::CloseEvent;
use crate::config::Profile;
use crate::datagram_socket::DatagramSocket;
use crate::error::{ConnectionError, WireError};
use crate::instrument::Instrument;
use crate::read_buffer::Sink;
use crate::safe_converter::SaturatingCast;
use crate::sequence::{is_ahead, next_seq};
use crate::wire_message::{MessageType, WireMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxStats {
    pub accepted: i32,
    pub buffered: usize,
    pub buffered_messages: usize,
    pub duplicates: u64,
    pub delivered_bytes: u64,
    pub closed: bool,
}

struct RxState {
    /// highest sequence number delivered to the sink
    accepted: i32,
    /// messages received ahead of `accepted`
    tree: BTreeMap<i32, WireMessage>,
    /// payload bytes in `tree`
    buffered: usize,
    close_seq: Option<i32>,
    closed: bool,
    torn_down: bool,

    duplicates: u64,
    delivered_bytes: u64,
}

/// The receiving half of a connection. It acknowledges every sequenced message it receives,
///  buffers messages that arrive ahead of a gap, and delivers the stream to the sink strictly in
///  sequence order, each sequence number exactly once.
pub struct RxPortal {
    profile: Arc<Profile>,
    pool: Arc<BufferPool>,
    socket: Arc<dyn DatagramSocket>,
    instrument: Arc<dyn Instrument>,
    sink: Arc<dyn Sink>,
    close_events: mpsc::UnboundedSender<CloseEvent>,
    state: Mutex<RxState>,
    /// kept outside `state` so that it can be read while a drain waits for the sink
    last_delivery: StdMutex<Option<Instant>>,
}

impl RxPortal {
    /// `accepted` is the peer's handshake sequence number: the first DATA is expected to follow it
    pub fn new(
        profile: Arc<Profile>,
        pool: Arc<BufferPool>,
        socket: Arc<dyn DatagramSocket>,
        instrument: Arc<dyn Instrument>,
        sink: Arc<dyn Sink>,
        accepted: i32,
        close_events: mpsc::UnboundedSender<CloseEvent>,
    ) -> RxPortal {
        RxPortal {
            profile,
            pool,
            socket,
            instrument,
            sink,
            close_events,
            state: Mutex::new(RxState {
                accepted,
                tree: BTreeMap::new(),
                buffered: 0,
                close_seq: None,
                closed: false,
                torn_down: false,
                duplicates: 0,
                delivered_bytes: 0,
            }),
            last_delivery: StdMutex::new(None),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.socket.peer_addr()
    }

    /// receive-side byte threshold below which a drain announces itself with a KEEPALIVE
    fn pacing_threshold(&self) -> usize {
        (self.profile.pool_buffer_size as f64 * self.profile.rx_portal_pacing_threshold) as usize
    }

    /// Handles a received DATA or CLOSE message
    pub async fn rx(&self, message: WireMessage) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if state.torn_down {
            trace!("{:?}: ignoring {:?} #{} after teardown", self.peer_addr(), message.message_type, message.seq);
            return Ok(());
        }

        let seq = message.seq;
        let message_type = message.message_type;
        if seq < 0 {
            return Err(WireError::Decoding(format!("{:?} with negative sequence number {}", message_type, seq)).into());
        }
        let (size, rtt) = match message_type {
            MessageType::Data => {
                let data = message.as_data()?;
                (data.payload.len(), data.rtt)
            }
            MessageType::Close => (0, None),
            other => return Err(WireError::Decoding(format!("{:?} is not a sequenced message", other)).into()),
        };
        self.instrument.wire_message_rx(self.peer_addr(), message_type, seq, message.len());

        let mut first_close = false;
        if is_ahead(seq, state.accepted) && !state.tree.contains_key(&seq) {
            trace!("{:?}: received {:?} #{}", self.peer_addr(), message_type, seq);
            if message_type == MessageType::Close && state.close_seq.is_none() {
                state.close_seq = Some(seq);
                first_close = true;
            }
            state.buffered += size;
            state.tree.insert(seq, message);
        }
        else {
            debug!("{:?}: duplicate {:?} #{} (accepted up to #{})", self.peer_addr(), message_type, seq, state.accepted);
            state.duplicates += 1;
            self.instrument.duplicate_rx(self.peer_addr(), seq);
            drop(message);
        }

        let buffered_before_drain = state.buffered;
        self.drain(&mut state).await?;

        self.send_ack(seq, state.buffered, rtt).await?;
        if first_close {
            debug!("{:?}: peer sent CLOSE #{}", self.peer_addr(), seq);
            let _ = self.close_events.send(CloseEvent::PeerClose(seq));
        }

        let threshold = self.pacing_threshold();
        if buffered_before_drain >= threshold && state.buffered < threshold {
            self.send_keepalive(state.buffered).await?;
        }
        Ok(())
    }

    async fn drain(&self, state: &mut RxState) -> Result<(), ConnectionError> {
        loop {
            let next = next_seq(state.accepted);
            let Some(message) = state.tree.remove(&next) else {
                return Ok(());
            };
            state.accepted = next;

            match message.message_type {
                MessageType::Data => {
                    let payload = message.as_data()?.payload;
                    state.buffered -= payload.len();
                    state.delivered_bytes += payload.len() as u64;
                    if let Err(e) = self.sink.accept(payload).await {
                        debug!("{:?}: discarding #{} - {}", self.peer_addr(), next, e);
                    }
                    *self.last_delivery.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                }
                _ => {
                    debug!("{:?}: end of stream at #{}", self.peer_addr(), next);
                    state.closed = true;
                    self.sink.close().await;
                    let _ = self.close_events.send(CloseEvent::RxCloseSeq(next));
                }
            }
        }
    }

    async fn send_ack(&self, seq: i32, buffered: usize, rtt: Option<u16>) -> Result<(), ConnectionError> {
        let ack = WireMessage::new_ack(&[Ack::single(seq)], buffered.saturating_cast(), rtt, &self.pool)?;
        self.socket.send(ack.as_bytes()).await?;
        self.instrument.wire_message_tx(self.peer_addr(), MessageType::Ack, seq, ack.len());
        Ok(())
    }

    async fn send_keepalive(&self, buffered: usize) -> Result<(), ConnectionError> {
        trace!("{:?}: buffered bytes dropped to {} - sending KEEPALIVE", self.peer_addr(), buffered);
        let keepalive = WireMessage::new_keepalive(buffered.saturating_cast(), &self.pool)?;
        self.socket.send(keepalive.as_bytes()).await?;
        self.instrument.wire_message_tx(self.peer_addr(), MessageType::KeepAlive, keepalive.seq, keepalive.len());
        Ok(())
    }

    /// Acknowledges the peer's handshake HELLO again, for a peer that did not see the first ack
    pub async fn ack_hello(&self, seq: i32) -> Result<(), ConnectionError> {
        let state = self.state.lock().await;
        if state.torn_down {
            return Ok(());
        }
        debug!("{:?}: repeated HELLO #{} - acknowledging again", self.peer_addr(), seq);
        self.send_ack(seq, state.buffered, None).await
    }

    /// Discards everything buffered and ends the stream. Messages received afterwards are ignored.
    pub async fn shutdown(&self) {
        // closing the sink first releases a drain that is blocked on a full sink
        self.sink.close().await;

        let mut state = self.state.lock().await;
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        state.tree.clear();
        state.buffered = 0;
    }

    /// time at which the most recent DATA was delivered to the sink
    pub fn last_delivery(&self) -> Option<Instant> {
        *self.last_delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn stats(&self) -> RxStats {
        let state = self.state.lock().await;
        RxStats {
            accepted: state.accepted,
            buffered: state.buffered,
            buffered_messages: state.tree.len(),
            duplicates: state.duplicates,
            delivered_bytes: state.delivered_bytes,
            closed: state.closed,
        }
    }
}
