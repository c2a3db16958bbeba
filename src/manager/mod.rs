//! The tracker request manager.
//!
//! A [`Manager`] owns one background worker thread that drives every HTTP(S)
//! tracker transfer for the session over a single libcurl multi handle.
//! Reactor-side callers enqueue requests; enqueues are batched behind a 5 ms
//! timer so a burst of announces wakes the worker once, not once per
//! request. Completions are posted back to the reactor — user code never
//! runs on the worker thread.

mod configure;
mod worker;

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::{
    Error,
    buffer::{BufferPool, SharedBuffer},
    error,
    hosts::{self, HostCounter},
    reactor::Reactor,
    settings::Settings,
};

/// Completion callback for a tracker request: receives the raw response
/// body, or the error the transfer ended with. Invoked exactly once, on the
/// reactor.
pub type Completion = Box<dyn FnOnce(Result<Vec<u8>, Error>) + Send + 'static>;

/// Point-in-time counters for monitoring, readable from the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Distinct tracker hostnames currently registered.
    pub unique_hosts: usize,
    /// Total-connection cap currently applied to the transport.
    pub connection_limit: usize,
    /// Transfers currently in flight on the worker.
    pub active_requests: usize,
    /// Requests enqueued but not yet picked up by the worker.
    pub queued_requests: usize,
}

/// How long enqueues are coalesced before the worker is woken.
const WAKEUP_DELAY: Duration = Duration::from_millis(5);
/// How long the constructor waits for the worker to come up before letting
/// initialization finish asynchronously.
const INIT_WAIT: Duration = Duration::from_millis(100);

const DEFAULT_MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A queued tracker request, from `add_request` until its completion fires.
pub(crate) struct Request {
    pub(crate) url: String,
    pub(crate) completion: Completion,
    /// Absolute deadline, fixed at creation. Retries never extend it.
    pub(crate) deadline: Instant,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    /// Backoff to apply before the next retry attempt; doubles after use.
    pub(crate) retry_delay: Duration,
    pub(crate) buffer: SharedBuffer,
}

pub(crate) struct Counters {
    pub(crate) total: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retried: AtomicU64,
}

/// State shared between the reactor side and the worker thread.
///
/// The worker holds its own `Arc<Shared>` (never the `Manager`), so the
/// manager can join the thread in `shutdown` without a reference cycle.
pub(crate) struct Shared {
    pub(crate) settings: Settings,
    pub(crate) reactor: Arc<dyn Reactor>,
    pub(crate) queue: Mutex<VecDeque<Request>>,
    pub(crate) buffers: BufferPool,
    pub(crate) hosts: HostCounter,

    /// The worker's multi handle, published for `curl_multi_wakeup`. Nulled
    /// by the worker before the handle is destroyed.
    multi: AtomicPtr<curl_sys::CURLM>,
    pub(crate) shutting_down: AtomicBool,

    /// Set by producers; cleared when the batch window closes.
    notify_pending: AtomicBool,
    /// Whether the 5 ms batch timer is currently armed. Reactor thread only.
    batch_timer_armed: AtomicBool,

    pub(crate) init: InitGate,

    /// Connection cap currently applied (worker-maintained, reactor-read).
    pub(crate) connection_limit: AtomicUsize,
    /// Target cap computed on tracker add/remove; applied by the worker.
    pub(crate) pending_connection_limit: AtomicUsize,
    pub(crate) pool_needs_update: AtomicBool,

    /// In-flight transfer count (worker-maintained, reactor-read).
    pub(crate) active_requests: AtomicUsize,
    pub(crate) counters: Counters,
}

/// Manages the worker thread multiplexing all HTTP(S) tracker requests.
///
/// Cheap to share behind its `Arc`; the manager must outlive every
/// [`HttpTracker`](crate::HttpTracker) built on it and is shut down (worker
/// joined, pending requests failed with `SessionClosing`) on drop at the
/// latest.
pub struct Manager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Starts the worker thread and waits briefly for it to initialize.
    ///
    /// Fails if libcurl is too old (7.66.0 introduced the poll primitive the
    /// worker relies on), lacks an asynchronous DNS resolver, or if worker
    /// initialization reports an error within the startup window. A worker
    /// that is merely slow to start is not an error; initialization then
    /// completes in the background.
    pub fn new(reactor: Arc<dyn Reactor>, settings: Settings) -> crate::Result<Arc<Manager>> {
        curl::init();

        let version = curl::Version::get();
        if version.version_num() < 0x07_42_00 {
            return Err(Error::builder_msg(format!(
                "libcurl 7.66.0+ required for multi poll, found {}",
                version.version()
            )));
        }
        if !version.feature_async_dns() {
            return Err(Error::builder_msg(
                "libcurl must be built with an asynchronous DNS resolver".to_string(),
            ));
        }

        let initial_limit =
            hosts::connection_target(0, settings.connections_limit);

        let shared = Arc::new(Shared {
            settings,
            reactor,
            queue: Mutex::new(VecDeque::new()),
            buffers: BufferPool::new(),
            hosts: HostCounter::new(),
            multi: AtomicPtr::new(std::ptr::null_mut()),
            shutting_down: AtomicBool::new(false),
            notify_pending: AtomicBool::new(false),
            batch_timer_armed: AtomicBool::new(false),
            init: InitGate::new(),
            connection_limit: AtomicUsize::new(initial_limit),
            pending_connection_limit: AtomicUsize::new(initial_limit),
            pool_needs_update: AtomicBool::new(false),
            active_requests: AtomicUsize::new(0),
            counters: Counters {
                total: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
            },
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tracker-curl".into())
            .spawn(move || worker::run(worker_shared))
            .map_err(|e| Error::builder_msg(format!("failed to spawn tracker worker: {e}")))?;

        if let Some(msg) = shared.init.wait_failed(INIT_WAIT) {
            let _ = handle.join();
            return Err(Error::builder_msg(msg));
        }

        Ok(Arc::new(Manager {
            shared,
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// Enqueues a GET of `url`, to complete (successfully or not) within
    /// `timeout`. The completion is posted on the reactor exactly once, even
    /// if the manager shuts down first.
    pub fn add_request<F>(&self, url: impl Into<String>, timeout: Duration, completion: F)
    where
        F: FnOnce(Result<Vec<u8>, Error>) + Send + 'static,
    {
        let completion: Completion = Box::new(completion);
        if self.shared.shutting_down.load(Ordering::Acquire) {
            self.shared.post(completion, Err(error::session_closing()));
            return;
        }

        let url = url.into();
        trace!(%url, ?timeout, "queueing tracker request");

        let cap = self.shared.settings.response_size_cap();
        let request = Request {
            url,
            completion,
            deadline: Instant::now() + timeout,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: INITIAL_RETRY_DELAY,
            buffer: self.shared.buffers.acquire(cap),
        };

        self.shared.queue.lock().push_back(request);
        self.shared.counters.total.fetch_add(1, Ordering::Relaxed);

        // First enqueue since the last batch flush kicks the reactor-side
        // batcher; later ones ride the already-pending notification.
        if self
            .shared
            .notify_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = Arc::clone(&self.shared);
            self.shared
                .reactor
                .post(Box::new(move || process_queue_notification(shared)));
        }
    }

    /// Registers a tracker URL; the connection pool is rescaled to the new
    /// population of distinct hosts on the worker's next iteration.
    pub fn tracker_added(&self, url: &str) {
        self.shared.hosts.add(url);
        self.shared.publish_connection_target();
    }

    /// Unregisters a tracker URL previously passed to
    /// [`tracker_added`](Manager::tracker_added).
    pub fn tracker_removed(&self, url: &str) {
        self.shared.hosts.remove(url);
        self.shared.publish_connection_target();
    }

    /// Stops the worker and fails everything still pending with
    /// [`SessionClosing`](crate::ErrorKind::SessionClosing). Idempotent;
    /// also run on drop.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        // The worker may be parked in its poll; wake it so it observes the
        // flag. Safe during shutdown, see Shared::wakeup.
        self.shared.wakeup();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            debug!("joining tracker worker");
            let _ = handle.join();
        }

        // The worker cancelled its active and retrying requests before
        // exiting; whatever is left in the submit queue never reached it.
        let stranded: Vec<Request> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).collect()
        };
        for request in stranded {
            self.shared.complete(request, Err(error::session_closing()));
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Snapshot of the manager's load, callable from the reactor. Only the
    /// queued count takes a lock (the queue mutex).
    pub fn stats(&self) -> Stats {
        Stats {
            unique_hosts: self.shared.hosts.unique_count(),
            connection_limit: self.shared.connection_limit.load(Ordering::Acquire),
            active_requests: self.shared.active_requests.load(Ordering::Acquire),
            queued_requests: self.shared.queue.lock().len(),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Posts a completion to the reactor.
    pub(crate) fn post(&self, completion: Completion, result: Result<Vec<u8>, Error>) {
        self.reactor.post(Box::new(move || completion(result)));
    }

    /// Finishes a request: counts it, posts its completion, and returns its
    /// buffer to the pool. On success the body must already have been moved
    /// out of the buffer.
    pub(crate) fn complete(&self, request: Request, result: Result<Vec<u8>, Error>) {
        match result {
            Ok(_) => self.counters.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.failed.fetch_add(1, Ordering::Relaxed),
        };
        let Request {
            completion, buffer, ..
        } = request;
        self.post(completion, result);
        self.buffers.release(buffer);
    }

    /// Interrupts the worker's poll.
    ///
    /// `curl_multi_wakeup` is the one libcurl entry point documented as
    /// callable from any thread, including while the worker is inside
    /// `curl_multi_poll`, and it tolerates being called during shutdown.
    pub(crate) fn wakeup(&self) {
        let multi = self.multi.load(Ordering::Acquire);
        if !multi.is_null() {
            // SAFETY: the pointer was published by the worker and is nulled
            // before the multi handle is dropped; shutdown wakes before
            // joining, so no wakeup call can outlive the handle.
            unsafe {
                curl_sys::curl_multi_wakeup(multi);
            }
        }
    }

    pub(crate) fn publish_multi(&self, multi: *mut curl_sys::CURLM) {
        self.multi.store(multi, Ordering::Release);
    }

    /// Recomputes the connection cap for the current host population and
    /// flags the worker to apply it.
    fn publish_connection_target(&self) {
        let target = hosts::connection_target(
            self.hosts.unique_count(),
            self.settings.connections_limit,
        );
        self.pending_connection_limit.store(target, Ordering::Release);
        self.pool_needs_update.store(true, Ordering::Release);
        self.wakeup();
    }
}

/// Reactor-side batching: runs when the first request of a burst lands.
/// Arms the batch timer unless one is already ticking.
fn process_queue_notification(shared: Arc<Shared>) {
    if shared.shutting_down.load(Ordering::Acquire) {
        return;
    }
    if shared.batch_timer_armed.swap(true, Ordering::AcqRel) {
        // A timer is already covering this window; it will pick the new
        // requests up when it fires.
        return;
    }
    arm_batch_timer(shared);
}

fn arm_batch_timer(shared: Arc<Shared>) {
    let reactor = Arc::clone(&shared.reactor);
    reactor.post_after(WAKEUP_DELAY, Box::new(move || on_batch_timer(shared)));
}

/// The batch window closed: wake the worker once for everything queued in
/// it. If more requests arrived while the window was open, open the next
/// one.
fn on_batch_timer(shared: Arc<Shared>) {
    shared.batch_timer_armed.store(false, Ordering::Release);
    if shared.shutting_down.load(Ordering::Acquire) {
        return;
    }

    let observed = shared.notify_pending.swap(false, Ordering::AcqRel);
    shared.wakeup();

    if observed && !shared.batch_timer_armed.swap(true, Ordering::AcqRel) {
        arm_batch_timer(shared);
    }
}

/// One-shot gate the constructor waits on while the worker starts.
pub(crate) struct InitGate {
    state: Mutex<InitState>,
    cond: Condvar,
}

enum InitState {
    Pending,
    Ready,
    Failed(String),
}

impl InitGate {
    fn new() -> InitGate {
        InitGate {
            state: Mutex::new(InitState::Pending),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set_ready(&self) {
        let mut state = self.state.lock();
        if matches!(*state, InitState::Pending) {
            *state = InitState::Ready;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Records a startup failure. Ignored once the gate is already open:
    /// late worker errors are not initialization errors.
    pub(crate) fn set_failed(&self, msg: String) {
        let mut state = self.state.lock();
        if matches!(*state, InitState::Pending) {
            *state = InitState::Failed(msg);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Waits up to `timeout` for the worker. Returns the failure message if
    /// initialization failed; `None` means ready or still pending (the
    /// latter is fine, the worker finishes coming up on its own).
    fn wait_failed(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match &*state {
                InitState::Ready => return None,
                InitState::Failed(msg) => return Some(msg.clone()),
                InitState::Pending => {}
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    InitState::Failed(msg) => Some(msg.clone()),
                    _ => None,
                };
            }
        }
    }
}
