use bytes::BytesMut;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Fixed-size byte buffers shared by all connections. Buffers are handed out as reference-counted
///  [Buffer] handles and go back to the pool when the last handle is released.
pub struct BufferPool {
    buf_size: usize,
    max_pooled: usize,
    buffers: Mutex<Vec<BytesMut>>,
    allocations: AtomicU64,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pooled: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            buf_size,
            max_pooled,
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            allocations: AtomicU64::new(0),
        })
    }

    /// capacity of every buffer handed out by this pool
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// number of buffers allocated by this pool since it was created
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// number of free buffers currently held by the pool
    pub fn pooled(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns an empty buffer with a reference count of 1
    pub fn get(self: &Arc<Self>) -> Buffer {
        let pooled = self.buffers.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let data = match pooled {
            Some(data) => {
                trace!("returning buffer from pool");
                data
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                self.allocations.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buf_size)
            }
        };

        Buffer {
            data: Some(Arc::new(data)),
            pool: self.clone(),
        }
    }

    fn put(&self, mut data: BytesMut) {
        if data.capacity() < self.buf_size {
            debug!("returned buffer lost part of its capacity: discarding it");
            return;
        }
        data.clear();

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pooled {
            trace!("returning buffer to pool");
            buffers.push(data);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// A reference-counted handle on a pooled buffer. [Buffer::retain] hands out an additional
///  handle, and the underlying storage goes back to the pool when the last handle is released
///  (explicitly through [Buffer::release] or by dropping it).
///
/// The buffer's content can only be modified through a unique handle, so data that was handed to
///  more than one owner is immutable.
pub struct Buffer {
    data: Option<Arc<BytesMut>>,
    pool: Arc<BufferPool>,
}

impl Buffer {
    /// increments the reference count, returning the new handle
    pub fn retain(&self) -> Buffer {
        Buffer {
            data: self.data.clone(),
            pool: self.pool.clone(),
        }
    }

    /// decrements the reference count, returning the storage to the pool if this was the last
    ///  handle
    pub fn release(self) {
        drop(self);
    }

    pub fn ref_count(&self) -> usize {
        self.data.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    /// `None` while the buffer is shared with another handle
    pub fn data_mut(&mut self) -> Option<&mut BytesMut> {
        self.data.as_mut().and_then(Arc::get_mut)
    }

    /// the capacity every writer must stay within
    pub fn capacity(&self) -> usize {
        self.pool.buf_size
    }

    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        match &self.data {
            Some(data) => data.as_ref(),
            None => &[],
        }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer{{len:{}, refs:{}}}", self.len(), self.ref_count())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(data) = Arc::into_inner(data) {
                self.pool.put(data);
            }
        }
    }
}
