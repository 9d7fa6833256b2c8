use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};
use crate::acks::Ack;
use crate::buffers::buffer_pool::BufferPool;
use crate::closer::{CloseEvent, CloseHooks, CloseOutcome, Closer};
use crate::config::Profile;
use crate::datagram_socket::{ConnectedSocket, DatagramSocket};
use crate::error::{ConnectionError, HandshakeError};
use crate::handshake;
use crate::instrument::Instrument;
use crate::read_buffer::ReadBuffer;
use crate::rx_portal::{RxPortal, RxStats};
use crate::sequence::Sequence;
use crate::tx_portal::{TxPortal, TxStats};
use crate::wire_message::{MessageType, WireMessage};

/// A reliable, ordered byte stream to a single peer.
///
/// Each connection runs three tasks: a reader that dispatches received datagrams to the sending
///  and receiving halves, the retransmission monitor, and the closer. All of them end when the
///  connection reaches its terminal state, see [Connection::join]. Dropping a connection aborts
///  them without a close handshake.
pub struct Connection {
    profile: Arc<Profile>,
    socket: Arc<dyn DatagramSocket>,
    tx_portal: Arc<TxPortal>,
    rx_portal: Arc<RxPortal>,
    read_buffer: Arc<ReadBuffer>,
    terminal: watch::Receiver<Option<CloseOutcome>>,
    hooks: CloseHooks,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Dials `peer` from an ephemeral UDP socket
    pub async fn dial(peer: SocketAddr, profile: Arc<Profile>, pool: Arc<BufferPool>, instrument: Arc<dyn Instrument>) -> anyhow::Result<Connection> {
        profile.validate()?;
        let socket = ConnectedSocket::connect(peer, &profile).await?;
        info!("dialing {:?} from {:?}", peer, socket.local_addr());
        Ok(Self::dial_over(Arc::new(socket), profile, pool, instrument).await?)
    }

    /// Runs the dialer's handshake over an existing socket
    pub async fn dial_over(socket: Arc<dyn DatagramSocket>, profile: Arc<Profile>, pool: Arc<BufferPool>, instrument: Arc<dyn Instrument>) -> Result<Connection, HandshakeError> {
        let mut sequence = Sequence::new(profile.randomize_seq);
        let hello_seq = sequence.next();
        let peer_hello_seq = handshake::dial(socket.as_ref(), &profile, &pool, hello_seq).await?;
        Ok(Self::establish(socket, sequence, hello_seq, peer_hello_seq, None, profile, pool, instrument))
    }

    /// Waits for a dialer's HELLO on `socket` and runs the listener's handshake
    pub async fn accept_over(socket: Arc<dyn DatagramSocket>, profile: Arc<Profile>, pool: Arc<BufferPool>, instrument: Arc<dyn Instrument>) -> Result<Connection, HandshakeError> {
        let peer_hello = timeout(profile.listener_hello_timeout, handshake::await_hello(socket.as_ref(), &pool)).await
            .map_err(|_| HandshakeError::Timeout { attempts: 0 })??;

        let mut sequence = Sequence::new(profile.randomize_seq);
        let hello_seq = sequence.next();
        let accepted = handshake::listen(socket.as_ref(), &profile, &pool, hello_seq, &peer_hello).await?;
        Ok(Self::establish(socket, sequence, hello_seq, accepted.peer_seq, accepted.first_message, profile, pool, instrument))
    }

    /// `sequence` continues after our own HELLO. The peer's sequenced messages start after
    ///  `peer_hello_seq`.
    #[allow(clippy::too_many_arguments)]
    fn establish(
        socket: Arc<dyn DatagramSocket>,
        sequence: Sequence,
        hello_seq: i32,
        peer_hello_seq: i32,
        first_message: Option<WireMessage>,
        profile: Arc<Profile>,
        pool: Arc<BufferPool>,
        instrument: Arc<dyn Instrument>,
    ) -> Connection {
        let peer_addr = socket.peer_addr();
        let (close_events, close_events_rx) = mpsc::unbounded_channel();
        let (terminal_tx, terminal) = watch::channel(None);
        let hooks = CloseHooks::default();

        let read_buffer = Arc::new(ReadBuffer::new(profile.reads_queue_len));
        let tx_portal = Arc::new(TxPortal::new(profile.clone(), pool.clone(), socket.clone(), instrument.clone(), sequence, close_events.clone()));
        let rx_portal = Arc::new(RxPortal::new(profile.clone(), pool.clone(), socket.clone(), instrument.clone(), read_buffer.clone(), peer_hello_seq, close_events.clone()));
        let closer = Closer::new(profile.clone(), peer_addr, tx_portal.clone(), rx_portal.clone(), close_events_rx, terminal_tx, hooks.clone());

        let reader = Reader {
            socket: socket.clone(),
            pool,
            tx_portal: tx_portal.clone(),
            rx_portal: rx_portal.clone(),
            hello_seq,
            close_events,
        };

        instrument.connected(peer_addr);
        let tasks = vec![
            tokio::spawn(tx_portal.clone().run_monitor(terminal.clone())),
            tokio::spawn(reader.run(first_message, terminal.clone())),
            tokio::spawn(async move {
                let outcome = closer.run().await;
                debug!("{:?}: connection terminated: {:?}", peer_addr, outcome);
                instrument.closed(peer_addr);
            }),
        ];

        Connection {
            profile,
            socket,
            tx_portal,
            rx_portal,
            read_buffer,
            terminal,
            hooks,
            tasks: Mutex::new(tasks),
        }
    }

    /// Sends `data`, waiting for window capacity as necessary. Fewer bytes than `data` holds are
    ///  sent only if the connection fails part way, and the next write reports the failure.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.tx_portal.tx(data).await
    }

    /// Reads the next bytes of the peer's stream into `buf`, waiting until some are available.
    ///  Returns 0 once the peer's CLOSE was delivered, and an error if the connection ended
    ///  before that.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let n = self.read_buffer.read(buf).await;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        if self.rx_portal.stats().await.closed {
            return Ok(0);
        }
        match self.closed().await {
            CloseOutcome::Failed(e) => Err(e),
            CloseOutcome::TimedOut => Err(ConnectionError::Timeout(self.profile.close_wait)),
            CloseOutcome::Graceful => Ok(0),
        }
    }

    /// Starts closing the connection: a CLOSE is sent after all data written so far. Writing
    ///  fails afterwards, while the peer's stream can still be read to its end as long as it makes
    ///  progress within the profile's close wait.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.tx_portal.close().await
    }

    /// Waits for the connection's terminal state
    pub async fn closed(&self) -> CloseOutcome {
        let mut terminal = self.terminal.clone();
        let outcome = match terminal.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(CloseOutcome::Failed(ConnectionError::Closed))
    }

    pub fn is_closed(&self) -> bool {
        self.terminal.borrow().is_some()
    }

    /// Registers a hook that runs exactly once when the connection reaches its terminal state,
    ///  or right away if it already has
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.register(Box::new(hook), &self.terminal);
    }

    pub async fn tx_stats(&self) -> TxStats {
        self.tx_portal.stats().await
    }

    pub async fn rx_stats(&self) -> RxStats {
        self.rx_portal.stats().await
    }

    /// Waits for all of the connection's tasks to finish
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                debug!("{:?}: connection task ended abnormally: {}", self.peer_addr(), e);
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.socket.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

/// Receives datagrams and dispatches them to the portals
struct Reader {
    socket: Arc<dyn DatagramSocket>,
    pool: Arc<BufferPool>,
    tx_portal: Arc<TxPortal>,
    rx_portal: Arc<RxPortal>,
    hello_seq: i32,
    close_events: mpsc::UnboundedSender<CloseEvent>,
}

impl Reader {
    async fn run(self, first_message: Option<WireMessage>, mut terminal: watch::Receiver<Option<CloseOutcome>>) {
        if let Some(message) = first_message {
            self.dispatch(message).await;
        }

        loop {
            select! {
                _ = terminal.changed() => break,
                received = self.socket.recv(&self.pool) => match received {
                    Ok(buffer) => match WireMessage::decode(buffer) {
                        Ok(message) => self.dispatch(message).await,
                        Err(e) => debug!("{:?}: dropping undecodable datagram: {}", self.socket.peer_addr(), e),
                    },
                    Err(e) => {
                        error!("{:?}: socket error: {}", self.socket.peer_addr(), e);
                        let _ = self.close_events.send(CloseEvent::EmergencyStop(e.into()));
                        break;
                    }
                }
            }
        }
        trace!("{:?}: reader loop terminated", self.socket.peer_addr());
    }

    async fn dispatch(&self, message: WireMessage) {
        let peer_addr = self.socket.peer_addr();
        match message.message_type {
            MessageType::Data | MessageType::Close => {
                if let Err(e) = self.rx_portal.rx(message).await {
                    self.on_error(e);
                }
            }
            MessageType::Ack => match message.as_ack() {
                Ok(body) => {
                    if let Some(echo) = body.rtt {
                        self.tx_portal.rtt(echo).await;
                    }
                    self.tx_portal.update_rx_portal_size(body.rx_portal_size).await;

                    // a repeated ack of our HELLO is not about data in flight
                    let acks = body.acks.into_iter()
                        .filter(|ack| *ack != Ack::single(self.hello_seq))
                        .collect::<Vec<_>>();
                    self.tx_portal.ack(&acks).await;
                }
                Err(e) => debug!("{:?}: dropping malformed ACK: {}", peer_addr, e),
            },
            MessageType::KeepAlive => match message.as_keepalive() {
                Ok(rx_portal_size) => self.tx_portal.update_rx_portal_size(rx_portal_size).await,
                Err(e) => debug!("{:?}: dropping malformed KEEPALIVE: {}", peer_addr, e),
            },
            MessageType::Hello => match message.as_hello() {
                Ok(hello) if hello.ack.map_or(false, |ack| ack.contains(self.hello_seq)) => {
                    if let Err(e) = self.rx_portal.ack_hello(message.seq).await {
                        self.on_error(e);
                    }
                }
                Ok(_) => debug!("{:?}: ignoring HELLO #{} on an established connection", peer_addr, message.seq),
                Err(e) => debug!("{:?}: dropping malformed HELLO: {}", peer_addr, e),
            },
        }
    }

    fn on_error(&self, err: ConnectionError) {
        match err {
            ConnectionError::Wire(e) => debug!("{:?}: dropping datagram: {}", self.socket.peer_addr(), e),
            err => {
                let _ = self.close_events.send(CloseEvent::EmergencyStop(err));
            }
        }
    }
}
