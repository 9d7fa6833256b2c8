use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use crate::config::Profile;
use crate::error::ConnectionError;
use crate::rx_portal::RxPortal;
use crate::tx_portal::TxPortal;

/// Events reported to the closer by the portals
#[derive(Debug, Clone, PartialEq)]
pub enum CloseEvent {
    /// our CLOSE with this sequence number was written
    TxCloseSent(i32),
    /// our CLOSE was acknowledged and nothing else is in flight
    TxCloseSeq(i32),
    /// the peer's CLOSE arrived for the first time
    PeerClose(i32),
    /// the peer's CLOSE was delivered in order, i.e. the peer's stream is complete
    RxCloseSeq(i32),
    /// unrecoverable failure, tear down immediately
    EmergencyStop(ConnectionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// both directions were closed and acknowledged
    Graceful,
    /// the close did not complete within the close wait
    TimedOut,
    Failed(ConnectionError),
}

pub type CloseHook = Box<dyn FnOnce() + Send>;

/// Hooks to run when the connection reaches its terminal state, shared between the closer and
///  the connection's API
#[derive(Clone, Default)]
pub struct CloseHooks {
    hooks: Arc<Mutex<Vec<CloseHook>>>,
}

impl CloseHooks {
    /// Registers `hook`, or runs it right away if `terminal` already holds an outcome
    pub fn register(&self, hook: CloseHook, terminal: &watch::Receiver<Option<CloseOutcome>>) {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if terminal.borrow().is_some() {
            drop(hooks);
            hook();
        }
        else {
            hooks.push(hook);
        }
    }

    fn run_all(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook();
        }
    }
}

/// Drives the shutdown of a connection. The connection is done when both directions completed
///  their close, when a started close saw neither a close event nor data progress for
///  `close_wait`, or on an emergency stop. Teardown
///  happens exactly once: both portals are shut down, the terminal state is published and the
///  close hooks run.
pub struct Closer {
    profile: Arc<Profile>,
    peer_addr: SocketAddr,
    tx_portal: Arc<TxPortal>,
    rx_portal: Arc<RxPortal>,
    events: mpsc::UnboundedReceiver<CloseEvent>,
    terminal: watch::Sender<Option<CloseOutcome>>,
    hooks: CloseHooks,

    rx_close_seq: Option<i32>,
    tx_close_seq: Option<i32>,
    last_event: Option<Instant>,
}

impl Closer {
    pub fn new(
        profile: Arc<Profile>,
        peer_addr: SocketAddr,
        tx_portal: Arc<TxPortal>,
        rx_portal: Arc<RxPortal>,
        events: mpsc::UnboundedReceiver<CloseEvent>,
        terminal: watch::Sender<Option<CloseOutcome>>,
        hooks: CloseHooks,
    ) -> Closer {
        Closer {
            profile,
            peer_addr,
            tx_portal,
            rx_portal,
            events,
            terminal,
            hooks,
            rx_close_seq: None,
            tx_close_seq: None,
            last_event: None,
        }
    }

    pub async fn run(mut self) -> CloseOutcome {
        let mut check_interval = interval(self.profile.close_check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            if self.rx_close_seq.is_some() && self.tx_close_seq.is_some() {
                info!("{:?}: connection closed", self.peer_addr);
                break CloseOutcome::Graceful;
            }

            select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(outcome) = self.on_event(event).await {
                            break outcome;
                        }
                    }
                    None => break CloseOutcome::Failed(ConnectionError::Closed),
                },
                _ = check_interval.tick() => {
                    if let Some(last_event) = self.last_event {
                        if self.last_activity(last_event).await.elapsed() >= self.profile.close_wait {
                            warn!("{:?}: close made no progress within {:?} - forcing it", self.peer_addr, self.profile.close_wait);
                            break CloseOutcome::TimedOut;
                        }
                    }
                }
            }
        };

        self.teardown(outcome.clone()).await;
        outcome
    }

    /// Data that is still acknowledged or delivered keeps a close in progress alive
    async fn last_activity(&self, last_event: Instant) -> Instant {
        let last = last_event.max(self.tx_portal.last_progress().await);
        match self.rx_portal.last_delivery() {
            Some(delivery) => last.max(delivery),
            None => last,
        }
    }

    async fn on_event(&mut self, event: CloseEvent) -> Option<CloseOutcome> {
        trace!("{:?}: close event {:?}", self.peer_addr, event);
        self.last_event = Some(Instant::now());

        match event {
            CloseEvent::TxCloseSent(_) => {}
            CloseEvent::TxCloseSeq(seq) => self.tx_close_seq = Some(seq),
            CloseEvent::PeerClose(_) => {
                if let Err(e) = self.tx_portal.close().await {
                    debug!("{:?}: could not close in response to the peer's CLOSE: {}", self.peer_addr, e);
                }
            }
            CloseEvent::RxCloseSeq(seq) => self.rx_close_seq = Some(seq),
            CloseEvent::EmergencyStop(err) => {
                warn!("{:?}: emergency stop: {}", self.peer_addr, err);
                return Some(CloseOutcome::Failed(err));
            }
        }
        None
    }

    async fn teardown(&mut self, outcome: CloseOutcome) {
        let reason = match &outcome {
            CloseOutcome::Failed(err) => err.clone(),
            _ => ConnectionError::Closed,
        };
        self.tx_portal.shutdown(reason).await;
        self.rx_portal.shutdown().await;

        {
            let _hooks = self.hooks.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            self.terminal.send_replace(Some(outcome));
        }
        self.hooks.run_all();
    }
}
