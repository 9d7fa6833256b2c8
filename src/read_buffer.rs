use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
#[cfg(test)] use mockall::automock;
use std::sync::{Mutex, PoisonError};
use tokio::select;
use tokio::sync::{mpsc, watch};

/// Consumer of the in-order byte stream assembled by the receiving side
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// accepts the next chunk of the stream, blocking if the consumer is not keeping up
    async fn accept(&self, data: &[u8]) -> anyhow::Result<()>;

    /// signals the end of the stream
    async fn close(&self);
}

struct ReadState {
    queue: mpsc::Receiver<Bytes>,
    leftover: Bytes,
}

/// The default [Sink]: a bounded queue of delivered segments, drained by the application's reads
pub struct ReadBuffer {
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// releases an `accept` that is waiting for room when the buffer is closed
    closed: watch::Sender<bool>,
    state: tokio::sync::Mutex<ReadState>,
}

impl ReadBuffer {
    pub fn new(queue_len: usize) -> ReadBuffer {
        let (sender, queue) = mpsc::channel(queue_len.max(1));
        ReadBuffer {
            sender: Mutex::new(Some(sender)),
            closed: watch::Sender::new(false),
            state: tokio::sync::Mutex::new(ReadState {
                queue,
                leftover: Bytes::new(),
            }),
        }
    }

    /// Copies the next bytes of the stream into `buf`, waiting for data if none is available.
    ///  Returns 0 once the stream is closed and fully read.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock().await;
        if state.leftover.is_empty() {
            match state.queue.recv().await {
                Some(data) => state.leftover = data,
                None => return 0,
            }
        }

        let n = buf.len().min(state.leftover.len());
        buf[..n].copy_from_slice(&state.leftover[..n]);
        state.leftover.advance(n);
        n
    }
}

#[async_trait]
impl Sink for ReadBuffer {
    async fn accept(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut closed = self.closed.subscribe();
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(sender) = sender else {
            return Err(anyhow!("read buffer is closed"));
        };

        select! {
            result = sender.send(Bytes::copy_from_slice(data)) => result
                .map_err(|_| anyhow!("read buffer was dropped")),
            _ = closed.wait_for(|closed| *closed) => Err(anyhow!("read buffer was closed while waiting for room")),
        }
    }

    async fn close(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.closed.send_replace(true);
    }
}
