//! Pooled response buffers.
//!
//! Tracker responses are small and bursty: under HTTP/2 a single announce
//! tick can put hundreds of transfers in flight, each needing a scratch
//! buffer. Buffers are recycled through three size buckets instead of
//! allocated per request.

use std::sync::Arc;

use parking_lot::Mutex;

/// A response body under construction, together with the hard size cap the
/// write callback enforces.
#[derive(Debug, Default)]
pub(crate) struct ResponseBuf {
    pub(crate) data: Vec<u8>,
    pub(crate) limit: usize,
}

/// Shared ownership of a response buffer.
///
/// The transfer context and the write handler both reference the buffer;
/// the transport holds it only while the transfer is registered, and the
/// completion path moves the bytes out before the buffer goes back to the
/// pool.
pub(crate) type SharedBuffer = Arc<Mutex<ResponseBuf>>;

const SMALL_BUFFER_SIZE: usize = 2 * 1024;
const MEDIUM_BUFFER_SIZE: usize = 8 * 1024;
const LARGE_BUFFER_SIZE: usize = 64 * 1024;

// Sized for HTTP/2 worst case: ~1000 concurrent streams split roughly
// 90/8/2 across the buckets.
const MAX_SMALL_POOL: usize = 900;
const MAX_MEDIUM_POOL: usize = 80;
const MAX_LARGE_POOL: usize = 20;

/// Size-bucketed free list of response buffers.
///
/// Each bucket is its own LIFO under its own lock, so the reactor-side
/// `acquire` and the worker-side `release` rarely contend.
pub(crate) struct BufferPool {
    small: Mutex<Vec<SharedBuffer>>,
    medium: Mutex<Vec<SharedBuffer>>,
    large: Mutex<Vec<SharedBuffer>>,
}

impl BufferPool {
    pub(crate) fn new() -> BufferPool {
        BufferPool {
            small: Mutex::new(Vec::new()),
            medium: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
        }
    }

    /// Takes a cleared buffer whose bucket accommodates `expected_size`,
    /// with its write cap set to `expected_size`.
    pub(crate) fn acquire(&self, expected_size: usize) -> SharedBuffer {
        let (bucket, reserve) = if expected_size <= SMALL_BUFFER_SIZE {
            (&self.small, SMALL_BUFFER_SIZE)
        } else if expected_size <= MEDIUM_BUFFER_SIZE {
            (&self.medium, MEDIUM_BUFFER_SIZE)
        } else {
            (&self.large, LARGE_BUFFER_SIZE)
        };

        if let Some(buf) = bucket.lock().pop() {
            let mut inner = buf.lock();
            inner.data.clear();
            inner.limit = expected_size;
            drop(inner);
            return buf;
        }

        Arc::new(Mutex::new(ResponseBuf {
            data: Vec::with_capacity(reserve),
            limit: expected_size,
        }))
    }

    /// Returns a buffer to the bucket matching its capacity. Buffers that
    /// grew past the large bucket are dropped rather than pooled.
    pub(crate) fn release(&self, buf: SharedBuffer) {
        let capacity = buf.lock().capacity();

        let (bucket, cap) = if capacity <= SMALL_BUFFER_SIZE {
            (&self.small, MAX_SMALL_POOL)
        } else if capacity <= MEDIUM_BUFFER_SIZE {
            (&self.medium, MAX_MEDIUM_POOL)
        } else if capacity <= LARGE_BUFFER_SIZE {
            (&self.large, MAX_LARGE_POOL)
        } else {
            return;
        };

        let mut pool = bucket.lock();
        if pool.len() < cap {
            buf.lock().data.clear();
            pool.push(buf);
        }
    }
}

impl ResponseBuf {
    fn capacity(&self) -> usize {
        self.data.capacity()
    }
}
