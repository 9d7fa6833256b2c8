use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::select;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::trace;
use crate::waitlist::Waitlist;

/// The sending side's hook for retransmitting a message when its deadline expires
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Retransmitter: Send + Sync + 'static {
    /// Retransmits the message with the given sequence number if it is still in flight, returning
    ///  the interval after which it should be retransmitted again. `None` means the message needs
    ///  no further monitoring.
    async fn retransmit(&self, seq: i32) -> Option<Duration>;
}

/// Keeps track of retransmission deadlines for all messages in flight. A single task per
///  connection ([RetxMonitor::run]) sleeps until the earliest deadline and fires the
///  retransmitter for every message that is due.
pub struct RetxMonitor {
    waitlist: Mutex<Box<dyn Waitlist>>,
    changed: Notify,
}

impl RetxMonitor {
    pub fn new(waitlist: Box<dyn Waitlist>) -> RetxMonitor {
        RetxMonitor {
            waitlist: Mutex::new(waitlist),
            changed: Notify::new(),
        }
    }

    fn waitlist(&self) -> MutexGuard<'_, Box<dyn Waitlist>> {
        self.waitlist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, seq: i32, deadline: Instant) {
        let is_earliest = {
            let mut waitlist = self.waitlist();
            waitlist.add(seq, deadline);
            waitlist.next_deadline() == Some(deadline)
        };
        if is_earliest {
            self.changed.notify_one();
        }
    }

    pub fn remove(&self, seq: i32) {
        self.waitlist().remove(seq);
    }

    pub fn clear(&self) {
        self.waitlist().clear();
        self.changed.notify_one();
    }

    pub fn len(&self) -> usize {
        self.waitlist().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs until the shutdown channel changes or its sender is dropped
    pub async fn run<T: Send + Sync>(&self, retransmitter: Arc<dyn Retransmitter>, mut shutdown: watch::Receiver<T>) {
        loop {
            let next_deadline = self.waitlist().next_deadline();
            let expired = async move {
                match next_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            select! {
                _ = shutdown.changed() => {
                    trace!("retransmission monitor shutting down");
                    break;
                }
                _ = self.changed.notified() => {}
                _ = expired => {
                    self.retransmit_due(retransmitter.as_ref()).await;
                }
            }
        }
    }

    async fn retransmit_due(&self, retransmitter: &dyn Retransmitter) {
        let now = Instant::now();
        loop {
            let seq = self.waitlist().pop_due(now);
            let Some(seq) = seq else {
                break;
            };

            trace!("retransmission deadline for #{} expired", seq);
            if let Some(interval) = retransmitter.retransmit(seq).await {
                self.waitlist().add(seq, Instant::now() + interval);
            }
        }
    }
}
