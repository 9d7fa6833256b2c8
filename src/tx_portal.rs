use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use crate::acks::Ack;
use crate::buffers::buffer_pool::BufferPool;
use crate::closer::CloseEvent;
use crate::config::Profile;
use crate::datagram_socket::DatagramSocket;
use crate::error::ConnectionError;
use crate::instrument::Instrument;
use crate::retx_monitor::{Retransmitter, RetxMonitor};
use crate::sequence::Sequence;
use crate::util::rolling_average::RollingAverage;
use crate::waitlist::new_waitlist;
use crate::wire_message::{WireMessage, HEADER_LEN, RTT_LEN};

/// Snapshot of a sender's state, for observability and tests
#[derive(Debug, Clone, PartialEq)]
pub struct TxStats {
    pub window_size: usize,
    pub in_flight: usize,
    pub in_flight_bytes: usize,
    pub rx_portal_size: usize,
    pub retx_interval: Duration,
    pub acked: u64,
    pub retransmissions: u64,
    pub duplicate_acks: u64,
}

struct TxState {
    sequence: Sequence,
    window_size: usize,
    in_flight: BTreeMap<i32, WireMessage>,
    in_flight_bytes: usize,
    /// bytes the peer reports as buffered but not yet delivered
    rx_portal_size: usize,

    success_count: u32,
    dup_ack_count: u32,
    retx_count: u32,

    rtt: RollingAverage,
    retx_interval: Duration,
    last_rtt_probe: Option<Instant>,
    /// timestamps of probes that are in flight and were never retransmitted, by sequence number
    rtt_probes: FxHashMap<i32, u16>,
    last_progress: Instant,

    close_seq: Option<i32>,
    close_acked: bool,
    failure: Option<ConnectionError>,

    acked: u64,
    retransmissions: u64,
    duplicate_acks: u64,
}

impl TxState {
    fn available(&self) -> usize {
        // the peer can only buffer messages behind a gap, and a gap means something is in flight
        let rx_portal_size = if self.in_flight.is_empty() { 0 } else { self.rx_portal_size };
        self.window_size.saturating_sub(self.in_flight_bytes + rx_portal_size)
    }

    fn resize(&mut self, new_size: f64, profile: &Profile) -> Option<usize> {
        let new_size = (new_size.max(0.0) as usize)
            .clamp(profile.tx_portal_min_size, profile.tx_portal_max_size);
        if new_size == self.window_size {
            return None;
        }
        self.window_size = new_size;
        Some(new_size)
    }

    fn on_success(&mut self, size: usize, profile: &Profile) -> Option<usize> {
        self.success_count += 1;
        if self.success_count < profile.tx_portal_increase_threshold {
            return None;
        }
        self.success_count = 0;

        if self.rx_portal_size * 2 > self.window_size {
            trace!("peer buffers {} bytes: not growing the window", self.rx_portal_size);
            return None;
        }
        self.resize(self.window_size as f64 + size as f64 * profile.tx_portal_increase_scale, profile)
    }

    fn on_duplicate_acks(&mut self, num_duplicates: u64, profile: &Profile) -> Option<usize> {
        self.success_count = 0;
        self.duplicate_acks += num_duplicates;

        let threshold = profile.tx_portal_dup_ack_threshold as u64;
        let total = self.dup_ack_count as u64 + num_duplicates;
        self.dup_ack_count = (total % threshold) as u32;
        match total / threshold {
            0 => None,
            n => self.resize(self.window_size as f64 * profile.tx_portal_dup_ack_scale.powi(n.min(64) as i32), profile),
        }
    }

    fn on_retransmission(&mut self, profile: &Profile) -> Option<usize> {
        self.success_count = 0;
        self.retransmissions += 1;

        self.retx_count += 1;
        if self.retx_count < profile.tx_portal_retx_threshold {
            return None;
        }
        self.retx_count = 0;
        self.resize(self.window_size as f64 * profile.tx_portal_retx_scale, profile)
    }
}

/// The sending half of a connection. It segments outgoing data into DATA messages, keeps them in
///  flight until they are acknowledged, and limits the bytes in flight to a window that adapts to
///  acks, duplicate acks and retransmissions.
///
/// All state changes and all socket writes happen while holding the state lock, so an
///  acknowledged message is never retransmitted afterwards.
pub struct TxPortal {
    profile: Arc<Profile>,
    pool: Arc<BufferPool>,
    socket: Arc<dyn DatagramSocket>,
    instrument: Arc<dyn Instrument>,
    close_events: mpsc::UnboundedSender<CloseEvent>,
    monitor: RetxMonitor,
    /// origin of the 16 bit millisecond timestamps used for RTT probes
    epoch: Instant,
    state: Mutex<TxState>,
    /// signalled whenever capacity may have become available or the portal closed
    ready: Notify,
}

impl TxPortal {
    pub fn new(
        profile: Arc<Profile>,
        pool: Arc<BufferPool>,
        socket: Arc<dyn DatagramSocket>,
        instrument: Arc<dyn Instrument>,
        sequence: Sequence,
        close_events: mpsc::UnboundedSender<CloseEvent>,
    ) -> TxPortal {
        let now = Instant::now();
        let window_size = profile.tx_portal_start_size
            .clamp(profile.tx_portal_min_size, profile.tx_portal_max_size);
        let expected_in_flight = profile.tx_portal_max_size / profile.max_data_message_len().max(1);

        TxPortal {
            monitor: RetxMonitor::new(new_waitlist(expected_in_flight, profile.tree_len)),
            state: Mutex::new(TxState {
                sequence,
                window_size,
                in_flight: BTreeMap::new(),
                in_flight_bytes: 0,
                rx_portal_size: 0,
                success_count: 0,
                dup_ack_count: 0,
                retx_count: 0,
                rtt: RollingAverage::new(profile.rtt_probe_avg),
                retx_interval: profile.retx_start,
                last_rtt_probe: None,
                rtt_probes: FxHashMap::default(),
                last_progress: now,
                close_seq: None,
                close_acked: false,
                failure: None,
                acked: 0,
                retransmissions: 0,
                duplicate_acks: 0,
            }),
            profile,
            pool,
            socket,
            instrument,
            close_events,
            epoch: now,
            ready: Notify::new(),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.socket.peer_addr()
    }

    /// Drives retransmissions until `shutdown` changes
    pub async fn run_monitor<T: Send + Sync>(self: Arc<Self>, shutdown: watch::Receiver<T>) {
        let retransmitter: Arc<dyn Retransmitter> = self.clone();
        self.monitor.run(retransmitter, shutdown).await;
    }

    /// Sends `data`, blocking while the window has no room for the next segment. Returns the
    ///  number of bytes sent. That is all of `data` unless the connection fails after some
    ///  segments were sent, in which case the next call reports the failure.
    pub async fn tx(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        let mut sent = 0;
        for segment in data.chunks(self.profile.max_segment_size) {
            match self.tx_segment(segment).await {
                Ok(()) => sent += segment.len(),
                Err(e) if sent == 0 => return Err(e),
                Err(e) => {
                    debug!("{:?}: sending stopped after {} bytes: {}", self.peer_addr(), sent, e);
                    break;
                }
            }
        }
        Ok(sent)
    }

    async fn tx_segment(&self, segment: &[u8]) -> Result<(), ConnectionError> {
        let mut state = self.wait_for_capacity(HEADER_LEN + RTT_LEN + segment.len()).await?;

        let now = Instant::now();
        let seq = state.sequence.peek();
        let rtt = self.rtt_probe(&mut state, seq, now);
        let message = WireMessage::new_data(seq, rtt, segment, &self.pool)?;
        state.sequence.next();

        self.send_sequenced(&mut state, message, now).await
    }

    async fn wait_for_capacity(&self, size: usize) -> Result<MutexGuard<'_, TxState>, ConnectionError> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state.lock().await;
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            if state.close_seq.is_some() {
                return Err(ConnectionError::Closed);
            }
            if state.available() >= size {
                return Ok(state);
            }
            trace!("{:?}: window full ({} of {} bytes in flight, peer buffers {}) - waiting", self.peer_addr(), state.in_flight_bytes, state.window_size, state.rx_portal_size);
            drop(state);

            notified.await;
        }
    }

    fn rtt_probe(&self, state: &mut TxState, seq: i32, now: Instant) -> Option<u16> {
        let due = match state.last_rtt_probe {
            None => true,
            Some(last) => now.duration_since(last) >= self.profile.rtt_probe_interval,
        };
        if !due {
            return None;
        }

        let stamp = self.rtt_stamp(now);
        state.last_rtt_probe = Some(now);
        state.rtt_probes.insert(seq, stamp);
        Some(stamp)
    }

    fn rtt_stamp(&self, now: Instant) -> u16 {
        (now.duration_since(self.epoch).as_millis() & 0xffff) as u16
    }

    /// puts a sequenced message in flight, schedules its retransmission and writes it
    async fn send_sequenced(&self, state: &mut TxState, message: WireMessage, now: Instant) -> Result<(), ConnectionError> {
        let seq = message.seq;
        let len = message.len();
        let message_type = message.message_type;
        let datagram = message.buffer().retain();

        if state.in_flight.is_empty() {
            state.last_progress = now;
        }
        state.in_flight_bytes += len;
        state.in_flight.insert(seq, message);
        self.monitor.add(seq, now + state.retx_interval);

        trace!("{:?}: sending {:?} #{} ({} bytes)", self.peer_addr(), message_type, seq, len);
        if let Err(e) = self.socket.send(&datagram.as_ref()[..len]).await {
            let err = ConnectionError::from(e);
            self.fail(state, err.clone());
            return Err(err);
        }
        self.instrument.wire_message_tx(self.peer_addr(), message_type, seq, len);
        Ok(())
    }

    fn fail(&self, state: &mut TxState, err: ConnectionError) {
        if state.failure.is_none() {
            error!("{:?}: connection failed: {}", self.peer_addr(), err);
            state.failure = Some(err.clone());
            let _ = self.close_events.send(CloseEvent::EmergencyStop(err));
        }
        self.ready.notify_waiters();
    }

    /// Applies the peer's acknowledgments: acknowledged messages leave the in-flight set and the
    ///  window, acks for messages that are not in flight count as duplicates
    pub async fn ack(&self, acks: &[Ack]) {
        let mut state = self.state.lock().await;
        if state.failure.is_some() {
            return;
        }

        let now = Instant::now();
        for ack in acks {
            let seqs = in_flight_in_range(&state.in_flight, ack);
            let num_acked = seqs.len() as u64;

            for seq in seqs {
                if let Some(message) = state.in_flight.remove(&seq) {
                    self.monitor.remove(seq);
                    state.rtt_probes.remove(&seq);
                    let len = message.len();
                    trace!("{:?}: #{} acknowledged", self.peer_addr(), seq);

                    state.in_flight_bytes -= len;
                    state.acked += 1;
                    state.last_progress = now;
                    if let Some(window_size) = state.on_success(len, &self.profile) {
                        debug!("{:?}: window grows to {} bytes", self.peer_addr(), window_size);
                        self.instrument.new_window(self.peer_addr(), window_size);
                    }
                }
            }

            let num_duplicates = ack.len() - num_acked;
            if num_duplicates > 0 {
                debug!("{:?}: {} duplicate acks in {:?}", self.peer_addr(), num_duplicates, ack);
                self.instrument.duplicate_ack(self.peer_addr(), ack.start);
                if let Some(window_size) = state.on_duplicate_acks(num_duplicates, &self.profile) {
                    debug!("{:?}: duplicate acks - window shrinks to {} bytes", self.peer_addr(), window_size);
                    self.instrument.new_window(self.peer_addr(), window_size);
                }
            }
        }

        if let Some(close_seq) = state.close_seq {
            if !state.close_acked && state.in_flight.is_empty() {
                debug!("{:?}: CLOSE #{} acknowledged and nothing in flight", self.peer_addr(), close_seq);
                state.close_acked = true;
                let _ = self.close_events.send(CloseEvent::TxCloseSeq(close_seq));
            }
        }

        drop(state);
        self.ready.notify_waiters();
    }

    /// Records the number of bytes the peer has buffered without delivering them yet
    pub async fn update_rx_portal_size(&self, rx_portal_size: i32) {
        let mut state = self.state.lock().await;
        state.rx_portal_size = rx_portal_size.max(0) as usize;
        drop(state);
        self.ready.notify_waiters();
    }

    /// Processes an RTT timestamp echoed by the peer. Only echoes of probes that are still in
    ///  flight and were never retransmitted produce a sample, each of them once.
    pub async fn rtt(&self, echo: u16) {
        let mut state = self.state.lock().await;
        let probe_seq = state.rtt_probes.iter()
            .find(|(_, stamp)| **stamp == echo)
            .map(|(seq, _)| *seq);
        match probe_seq {
            Some(seq) => {
                state.rtt_probes.remove(&seq);
            }
            None => {
                trace!("{:?}: ignoring stale RTT echo {}", self.peer_addr(), echo);
                return;
            }
        }

        let sample = self.rtt_stamp(Instant::now()).wrapping_sub(echo);
        state.rtt.add_value(sample as f64);
        let avg = state.rtt.mean().unwrap_or(0.0);
        let retx = Duration::from_micros((avg * self.profile.retx_scale * 1000.0).round() as u64) + self.profile.retx_add;
        state.retx_interval = retx.max(Duration::from_millis(1));

        trace!("{:?}: RTT sample {} ms, retransmission interval {:?}", self.peer_addr(), sample, state.retx_interval);
        self.instrument.new_retx(self.peer_addr(), Duration::from_millis(sample as u64), state.retx_interval);
    }

    /// Sends a sequenced CLOSE after all data sent so far. Calling this more than once has no
    ///  further effect. Sending fails with [ConnectionError::Closed] afterwards.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if state.close_seq.is_some() {
            return Ok(());
        }
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }

        let now = Instant::now();
        let seq = state.sequence.peek();
        let message = WireMessage::new_close(seq, &self.pool)?;
        state.sequence.next();
        state.close_seq = Some(seq);

        debug!("{:?}: sending CLOSE #{}", self.peer_addr(), seq);
        let result = self.send_sequenced(&mut state, message, now).await;
        drop(state);
        self.ready.notify_waiters();

        result?;
        let _ = self.close_events.send(CloseEvent::TxCloseSent(seq));
        Ok(())
    }

    /// Releases everything in flight and fails all current and future senders with `reason`
    pub async fn shutdown(&self, reason: ConnectionError) {
        let mut state = self.state.lock().await;
        if state.failure.is_none() {
            state.failure = Some(reason);
        }
        state.in_flight.clear();
        state.in_flight_bytes = 0;
        state.rtt_probes.clear();
        drop(state);

        self.monitor.clear();
        self.ready.notify_waiters();
    }

    /// time of the most recent acknowledgment progress, or of the send that started the current
    ///  in-flight period
    pub async fn last_progress(&self) -> Instant {
        self.state.lock().await.last_progress
    }

    pub async fn stats(&self) -> TxStats {
        let state = self.state.lock().await;
        TxStats {
            window_size: state.window_size,
            in_flight: state.in_flight.len(),
            in_flight_bytes: state.in_flight_bytes,
            rx_portal_size: state.rx_portal_size,
            retx_interval: state.retx_interval,
            acked: state.acked,
            retransmissions: state.retransmissions,
            duplicate_acks: state.duplicate_acks,
        }
    }
}

#[async_trait]
impl Retransmitter for TxPortal {
    async fn retransmit(&self, seq: i32) -> Option<Duration> {
        let mut state = self.state.lock().await;
        if state.failure.is_some() {
            return None;
        }
        let message = state.in_flight.get(&seq)?;
        let len = message.len();
        let datagram = message.buffer().retain();

        let now = Instant::now();
        let stalled = now.duration_since(state.last_progress);
        if stalled >= self.profile.connection_timeout {
            warn!("{:?}: no acknowledgment for {:?} - giving up", self.peer_addr(), stalled);
            self.fail(&mut state, ConnectionError::Timeout(self.profile.connection_timeout));
            return None;
        }

        debug!("{:?}: retransmitting #{}", self.peer_addr(), seq);
        if let Err(e) = self.socket.send(&datagram.as_ref()[..len]).await {
            self.fail(&mut state, e.into());
            return None;
        }
        self.instrument.wire_message_retx(self.peer_addr(), seq);

        // an echo could belong to either transmission
        state.rtt_probes.remove(&seq);
        if let Some(window_size) = state.on_retransmission(&self.profile) {
            debug!("{:?}: retransmissions - window shrinks to {} bytes", self.peer_addr(), window_size);
            self.instrument.new_window(self.peer_addr(), window_size);
        }
        Some(state.retx_interval)
    }
}

fn in_flight_in_range(in_flight: &BTreeMap<i32, WireMessage>, ack: &Ack) -> Vec<i32> {
    if ack.start <= ack.end {
        in_flight.range(ack.start..=ack.end)
            .map(|(seq, _)| *seq)
            .collect()
    }
    else {
        in_flight.range(ack.start..)
            .chain(in_flight.range(..=ack.end))
            .map(|(seq, _)| *seq)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram_socket::MockDatagramSocket;
    use crate::instrument::NoopInstrument;
    use crate::wire_message::MessageType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn profile() -> Profile {
        Profile {
            max_segment_size: 10,
            pool_buffer_size: 64,
            tx_portal_min_size: 38,
            tx_portal_start_size: 57,
            tx_portal_max_size: 1000,
            tx_portal_increase_threshold: 2,
            tx_portal_increase_scale: 1.0,
            tx_portal_dup_ack_threshold: 2,
            tx_portal_dup_ack_scale: 0.5,
            tx_portal_retx_threshold: 2,
            tx_portal_retx_scale: 0.5,
            retx_start: Duration::from_millis(200),
            retx_scale: 2.0,
            retx_add: Duration::from_millis(10),
            ..Profile::default()
        }
    }

    type Sent = Arc<StdMutex<Vec<Vec<u8>>>>;

    fn recording_socket() -> (MockDatagramSocket, Sent) {
        let sent: Sent = Default::default();
        let mut socket = MockDatagramSocket::new();
        socket.expect_peer_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 5)));
        socket.expect_send()
            .returning({
                let sent = sent.clone();
                move |datagram| {
                    sent.lock().unwrap().push(datagram.to_vec());
                    Ok(())
                }
            });
        (socket, sent)
    }

    fn portal_with(profile: Profile, socket: MockDatagramSocket) -> (Arc<TxPortal>, UnboundedReceiver<CloseEvent>) {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let portal = TxPortal::new(
            Arc::new(profile),
            BufferPool::new(64, 16),
            Arc::new(socket),
            Arc::new(NoopInstrument),
            Sequence::starting_at(0),
            close_tx,
        );
        (Arc::new(portal), close_rx)
    }

    fn headers(sent: &Sent) -> Vec<(MessageType, i32, usize)> {
        sent.lock().unwrap().iter()
            .map(|d| {
                let seq = i32::from_le_bytes([d[0], d[1], d[2], d[3]]);
                let message_type = MessageType::try_from(d[4] & 7).unwrap();
                (message_type, seq, d.len())
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_segments_and_acks() {
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        assert_eq!(portal.tx(b"0123456789abcde").await, Ok(15));
        assert_eq!(headers(&sent), vec![
            (MessageType::Data, 0, 19),
            (MessageType::Data, 1, 12),
        ]);
        let stats = portal.stats().await;
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.in_flight_bytes, 31);

        portal.ack(&[Ack::range(0, 1)]).await;
        let stats = portal.stats().await;
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.in_flight_bytes, 0);
        assert_eq!(stats.acked, 2);
        assert_eq!(stats.duplicate_acks, 0);
        assert!(portal.monitor.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_blocks_until_capacity() {
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 30]).await.unwrap();
        assert_eq!(portal.stats().await.in_flight_bytes, 19 + 17 + 17);

        assert!(timeout(Duration::from_secs(1), portal.tx(&[2u8; 10])).await.is_err());

        let blocked = tokio::spawn({
            let portal = portal.clone();
            async move { portal.tx(&[2u8; 10]).await }
        });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        portal.ack(&[Ack::single(0)]).await;
        assert_eq!(blocked.await.unwrap(), Ok(10));
        assert_eq!(headers(&sent).last(), Some(&(MessageType::Data, 3, 19)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_buffer_limits_capacity() {
        let (socket, _sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.update_rx_portal_size(50).await;
        assert_eq!(portal.tx(&[1u8; 10]).await, Ok(10));
        assert!(timeout(Duration::from_secs(1), portal.tx(&[1u8; 10])).await.is_err());

        portal.update_rx_portal_size(0).await;
        assert_eq!(portal.tx(&[1u8; 10]).await, Ok(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_peer_buffer_is_ignored_when_nothing_is_in_flight() {
        let (socket, _sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 10]).await.unwrap();
        portal.ack(&[Ack::single(0)]).await;
        portal.update_rx_portal_size(1000).await;

        assert_eq!(portal.tx(&[1u8; 10]).await, Ok(10));
        assert!(timeout(Duration::from_secs(1), portal.tx(&[1u8; 10])).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_acks_shrink_window() {
        let (socket, _sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 10]).await.unwrap();
        portal.ack(&[Ack::single(0)]).await;
        portal.ack(&[Ack::single(0)]).await;
        portal.ack(&[Ack::single(0)]).await;

        let stats = portal.stats().await;
        assert_eq!(stats.duplicate_acks, 2);
        assert_eq!(stats.window_size, 38);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_message_is_not_retransmitted() {
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 5]).await.unwrap();
        assert_eq!(portal.retransmit(0).await, Some(Duration::from_millis(200)));
        assert_eq!(sent.lock().unwrap().len(), 2);

        portal.ack(&[Ack::single(0)]).await;
        assert_eq!(portal.retransmit(0).await, None);
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(portal.stats().await.retransmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ack_and_retransmission() {
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 5]).await.unwrap();

        let retx = tokio::spawn({
            let portal = portal.clone();
            async move { portal.retransmit(0).await }
        });
        let ack = tokio::spawn({
            let portal = portal.clone();
            async move { portal.ack(&[Ack::single(0)]).await }
        });
        let retx_result = retx.await.unwrap();
        ack.await.unwrap();

        let num_sent = sent.lock().unwrap().len();
        match retx_result {
            Some(_) => assert_eq!(num_sent, 2),
            None => assert_eq!(num_sent, 1),
        }
        assert_eq!(portal.retransmit(0).await, None);
        assert_eq!(sent.lock().unwrap().len(), num_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_retransmits_until_acked() {
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let monitor = tokio::spawn(portal.clone().run_monitor(shutdown_rx));

        portal.tx(&[1u8; 5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(sent.lock().unwrap().len(), 4);

        portal.ack(&[Ack::single(0)]).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sent.lock().unwrap().len(), 4);

        shutdown_tx.send(()).unwrap();
        monitor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_updates_retransmission_interval() {
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 5]).await.unwrap();
        let stamp = {
            let sent = sent.lock().unwrap();
            u16::from_le_bytes([sent[0][7], sent[0][8]])
        };

        tokio::time::sleep(Duration::from_millis(40)).await;
        portal.rtt(stamp).await;
        assert_eq!(portal.stats().await.retx_interval, Duration::from_millis(40 * 2 + 10));

        portal.rtt(stamp).await;
        assert_eq!(portal.stats().await.retx_interval, Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmitted_probe_is_ignored() {
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 5]).await.unwrap();
        let stamp = {
            let sent = sent.lock().unwrap();
            u16::from_le_bytes([sent[0][7], sent[0][8]])
        };
        portal.retransmit(0).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        portal.rtt(stamp).await;
        assert_eq!(portal.stats().await.retx_interval, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_longer_than_sampling_interval() {
        let profile = Profile {
            tx_portal_start_size: 1000,
            ..profile()
        };
        let (socket, sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile, socket);

        // the peer echoes and acknowledges every message 120ms after it was sent
        let mut replies = VecDeque::new();
        for seq in 0..30 {
            portal.tx(&[1u8; 5]).await.unwrap();
            let datagram = sent.lock().unwrap().last().unwrap().clone();
            let echo = (datagram[4] & 0x08 != 0).then(|| u16::from_le_bytes([datagram[7], datagram[8]]));
            replies.push_back((Instant::now() + Duration::from_millis(120), seq, echo));

            tokio::time::sleep(Duration::from_millis(20)).await;
            while replies.front().map_or(false, |(due, _, _)| *due <= Instant::now()) {
                let (_, seq, echo) = replies.pop_front().unwrap();
                if let Some(echo) = echo {
                    portal.rtt(echo).await;
                }
                portal.ack(&[Ack::single(seq)]).await;
            }
        }

        assert_eq!(portal.stats().await.retx_interval, Duration::from_millis(120 * 2 + 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tx_reports_bytes_sent_before_failure() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_peer_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 5)));
        let mut num_sends = 0;
        socket.expect_send()
            .returning(move |_| {
                num_sends += 1;
                if num_sends == 1 {
                    Ok(())
                }
                else {
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
                }
            });
        let (portal, _close_rx) = portal_with(profile(), socket);

        assert_eq!(portal.tx(&[1u8; 25]).await, Ok(10));
        assert!(matches!(portal.tx(&[1u8; 5]).await, Err(ConnectionError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_error_surfaces() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_peer_addr()
            .return_const(SocketAddr::from(([1, 2, 3, 4], 5)));
        socket.expect_send()
            .returning(|_| Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));
        let (portal, mut close_rx) = portal_with(profile(), socket);

        let result = portal.tx(&[1u8; 5]).await;
        assert!(matches!(result, Err(ConnectionError::Io(_))));
        assert!(matches!(close_rx.try_recv(), Ok(CloseEvent::EmergencyStop(ConnectionError::Io(_)))));

        assert!(matches!(portal.tx(&[1u8; 5]).await, Err(ConnectionError::Io(_))));
        assert!(close_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_progress_times_out() {
        let (socket, _sent) = recording_socket();
        let (portal, mut close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 5]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(portal.retransmit(0).await.is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(portal.retransmit(0).await, None);
        assert!(matches!(close_rx.try_recv(), Ok(CloseEvent::EmergencyStop(ConnectionError::Timeout(_)))));
        assert!(matches!(portal.tx(&[1u8; 5]).await, Err(ConnectionError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let (socket, sent) = recording_socket();
        let (portal, mut close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 5]).await.unwrap();
        portal.close().await.unwrap();
        portal.close().await.unwrap();

        assert_eq!(headers(&sent), vec![
            (MessageType::Data, 0, 14),
            (MessageType::Close, 1, 7),
        ]);
        assert!(matches!(close_rx.try_recv(), Ok(CloseEvent::TxCloseSent(1))));
        assert!(close_rx.try_recv().is_err());
        assert_eq!(portal.tx(&[1u8; 5]).await, Err(ConnectionError::Closed));

        portal.ack(&[Ack::single(1)]).await;
        assert!(close_rx.try_recv().is_err());

        portal.ack(&[Ack::single(0)]).await;
        assert!(matches!(close_rx.try_recv(), Ok(CloseEvent::TxCloseSeq(1))));

        portal.ack(&[Ack::range(0, 1)]).await;
        assert!(close_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_blocked_sender() {
        let (socket, _sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 30]).await.unwrap();
        let blocked = tokio::spawn({
            let portal = portal.clone();
            async move { portal.tx(&[2u8; 10]).await }
        });
        tokio::task::yield_now().await;

        portal.close().await.unwrap();
        assert_eq!(blocked.await.unwrap(), Err(ConnectionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_in_flight() {
        let (socket, _sent) = recording_socket();
        let (portal, _close_rx) = portal_with(profile(), socket);

        portal.tx(&[1u8; 25]).await.unwrap();
        portal.shutdown(ConnectionError::Closed).await;

        let stats = portal.stats().await;
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.in_flight_bytes, 0);
        assert!(portal.monitor.is_empty());
        assert_eq!(portal.pool.pooled(), 3);
        assert_eq!(portal.tx(&[1u8; 5]).await, Err(ConnectionError::Closed));
    }

    #[rstest]
    #[case::seed_1(1)]
    #[case::seed_2(2)]
    #[case::seed_3(3)]
    fn test_window_stays_within_bounds(#[case] seed: u64) {
        let profile = Profile {
            tx_portal_increase_scale: 3.0,
            tx_portal_dup_ack_scale: 0.3,
            ..profile()
        };
        let (socket, _) = recording_socket();
        let (portal, _close_rx) = portal_with(profile.clone(), socket);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut state = portal.state.try_lock().unwrap();
        for _ in 0..10_000 {
            match rng.gen_range(0..4) {
                0 | 1 => { state.on_success(rng.gen_range(1..500), &profile); }
                2 => { state.on_duplicate_acks(rng.gen_range(1..5), &profile); }
                _ => { state.on_retransmission(&profile); }
            }
            assert!(state.window_size >= profile.tx_portal_min_size);
            assert!(state.window_size <= profile.tx_portal_max_size);
        }
    }
}
