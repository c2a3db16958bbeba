//! Pooled easy handles.
//!
//! Creating and configuring an easy handle is ~30 option writes plus TLS
//! backend setup; reusing one is 5-7 writes. The pool keeps released handles
//! with their session-level options (TLS version, cipher list, HTTP version,
//! share attachment, keep-alive) intact, so a reused handle only needs its
//! request-scoped options refreshed. Handles are deliberately never reset:
//! `curl_easy_reset` would throw the session configuration away and with it
//! the whole point of pooling.

use std::{collections::VecDeque, time::Duration, time::Instant};

use curl::easy::{Easy2, Handler, WriteError};

use crate::buffer::SharedBuffer;

/// Write handler for tracker transfers.
///
/// Appends received bytes to the attached response buffer, refusing writes
/// that would exceed the buffer's size cap. Refusal surfaces as a write
/// error on the transfer, which the worker maps to an HTTP error.
pub(crate) struct Collector {
    buf: Option<SharedBuffer>,
}

impl Collector {
    pub(crate) fn new() -> Collector {
        Collector { buf: None }
    }

    /// Points this handle's writes at `buf` for the next transfer.
    pub(crate) fn attach_buffer(&mut self, buf: SharedBuffer) {
        self.buf = Some(buf);
    }

    /// Detaches the response buffer. Must be called before the handle goes
    /// back to the pool so a pooled handle never references a request's
    /// buffer.
    pub(crate) fn take_buffer(&mut self) -> Option<SharedBuffer> {
        self.buf.take()
    }
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let Some(buf) = self.buf.as_ref() else {
            return Ok(0);
        };
        let mut buf = buf.lock();
        if buf.data.len() + data.len() > buf.limit {
            return Ok(0);
        }
        buf.data.extend_from_slice(data);
        Ok(data.len())
    }
}

/// A handle checked out of the pool.
pub(crate) struct PooledEasy {
    pub(crate) easy: Easy2<Collector>,
    /// True when session-level options must be (re)applied: the handle is
    /// brand new, or the pool's settings version moved since the handle was
    /// last configured.
    pub(crate) needs_full_config: bool,
}

struct Idle {
    easy: Easy2<Collector>,
    last_used: Instant,
    settings_version: u32,
}

const MAX_POOL_SIZE: usize = 20;
const MAX_IDLE_TIME: Duration = Duration::from_secs(5 * 60);

/// LIFO pool of easy handles with preserved session settings.
///
/// Only the worker thread touches the pool, so it carries no lock. Handles
/// are released to the back and acquired from the back (warmest first,
/// keeping its connection and TLS state most likely to still be valid);
/// idle expiry walks from the front, where the oldest handles sit.
pub(crate) struct HandlePool {
    idle: VecDeque<Idle>,
    settings_version: u32,
}

impl HandlePool {
    pub(crate) fn new() -> HandlePool {
        HandlePool {
            idle: VecDeque::new(),
            settings_version: 0,
        }
    }

    /// Pops the most recently used handle, or creates a fresh one.
    pub(crate) fn acquire(&mut self) -> PooledEasy {
        if let Some(entry) = self.idle.pop_back() {
            return PooledEasy {
                needs_full_config: entry.settings_version != self.settings_version,
                easy: entry.easy,
            };
        }
        PooledEasy {
            easy: Easy2::new(Collector::new()),
            needs_full_config: true,
        }
    }

    /// Returns a handle to the pool, stamping it with the current settings
    /// version. Dropped instead if the pool is full.
    pub(crate) fn release(&mut self, easy: Easy2<Collector>, now: Instant) {
        debug_assert!(easy.get_ref().buf.is_none(), "pooled handle still references a buffer");
        if self.idle.len() >= MAX_POOL_SIZE {
            return;
        }
        self.idle.push_back(Idle {
            easy,
            last_used: now,
            settings_version: self.settings_version,
        });
    }

    /// Marks every pooled handle's session configuration stale.
    pub(crate) fn invalidate_settings(&mut self) {
        self.settings_version = self.settings_version.wrapping_add(1);
    }

    /// Drops handles that have sat idle for five minutes or more, oldest
    /// first, stopping at the first fresh one.
    pub(crate) fn cleanup_idle(&mut self, now: Instant) {
        while let Some(front) = self.idle.front() {
            if now.duration_since(front.last_used) >= MAX_IDLE_TIME {
                self.idle.pop_front();
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_id(p: &PooledEasy) -> usize {
        p.easy.raw() as usize
    }

    #[test]
    fn reacquire_returns_same_handle_without_full_config() {
        let mut pool = HandlePool::new();

        let first = pool.acquire();
        assert!(first.needs_full_config);
        let id = raw_id(&first);

        pool.release(first.easy, Instant::now());
        let second = pool.acquire();
        assert_eq!(raw_id(&second), id);
        assert!(!second.needs_full_config);
    }

    #[test]
    fn lifo_hands_back_warmest_handle() {
        let mut pool = HandlePool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        let (id_a, id_b) = (raw_id(&a), raw_id(&b));
        assert_ne!(id_a, id_b);

        let now = Instant::now();
        pool.release(a.easy, now);
        pool.release(b.easy, now);

        // b went in last, so it comes out first.
        assert_eq!(raw_id(&pool.acquire()), id_b);
        assert_eq!(raw_id(&pool.acquire()), id_a);
    }

    #[test]
    fn invalidate_settings_forces_reconfiguration() {
        let mut pool = HandlePool::new();
        let handle = pool.acquire();
        pool.release(handle.easy, Instant::now());

        pool.invalidate_settings();
        assert!(pool.acquire().needs_full_config);
    }

    #[test]
    fn pool_capacity_is_bounded() {
        let mut pool = HandlePool::new();
        let handles: Vec<_> = (0..MAX_POOL_SIZE + 5).map(|_| pool.acquire()).collect();
        let now = Instant::now();
        for h in handles {
            pool.release(h.easy, now);
        }
        assert_eq!(pool.available(), MAX_POOL_SIZE);
    }

    #[test]
    fn cleanup_drops_only_stale_handles() {
        let mut pool = HandlePool::new();
        let old = pool.acquire();
        let fresh = pool.acquire();

        let start = Instant::now();
        pool.release(old.easy, start);
        pool.release(fresh.easy, start + Duration::from_secs(200));

        pool.cleanup_idle(start + MAX_IDLE_TIME + Duration::from_secs(1));
        assert_eq!(pool.available(), 1);

        // Well before the horizon nothing is dropped.
        pool.cleanup_idle(start + Duration::from_secs(210));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn collector_enforces_size_cap() {
        use crate::buffer::BufferPool;

        let buffers = BufferPool::new();
        let buf = buffers.acquire(8);
        let mut collector = Collector::new();
        collector.attach_buffer(buf.clone());

        assert_eq!(collector.write(b"12345678").unwrap(), 8);
        // One more byte would exceed the cap: refused outright.
        assert_eq!(collector.write(b"9").unwrap(), 0);
        assert_eq!(buf.lock().data.as_slice(), b"12345678");

        // Detached collectors accept nothing.
        collector.take_buffer();
        assert_eq!(collector.write(b"x").unwrap(), 0);
    }
}
