//! The worker thread: drives the multi handle, harvests completions, and
//! schedules retries.
//!
//! Everything here runs on the one thread spawned by `Manager::new`. The
//! multi handle, the share handle, the easy-handle pool, the active-transfer
//! map, and the retry set are owned by this thread alone; the only state it
//! shares with the reactor side lives in `Shared`.

use std::{
    collections::{BTreeMap, HashMap},
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant},
};

use curl::{
    easy::Easy2,
    multi::{Easy2Handle, Multi},
};
use tracing::{debug, trace, warn};

use crate::{
    Error, ErrorKind, error,
    handle::{Collector, HandlePool, PooledEasy},
    hosts,
    share::ShareHandle,
};

use super::{Request, Shared, configure};

/// Idle-handle sweep interval, applied only while nothing is in flight.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
/// Backoff ceiling for retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Poll timeout fallback while transfers are active but libcurl offers no
/// estimate of its own.
const ACTIVE_POLL_FALLBACK: Duration = Duration::from_millis(100);
/// Poll timeout while fully idle; a wakeup interrupts it early.
const IDLE_POLL: Duration = Duration::from_secs(60);
/// Poll ceiling while shutting down with transfers still live.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub(super) fn run(shared: Arc<Shared>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| run_inner(&shared)));
    if result.is_err() {
        warn!("tracker worker thread panicked");
        // If the panic hit during startup the constructor is still waiting.
        shared.init.set_failed("tracker worker thread panicked".into());
        shared.publish_multi(std::ptr::null_mut());
    }
}

fn run_inner(shared: &Arc<Shared>) {
    let mut worker = match Worker::init(Arc::clone(shared)) {
        Ok(worker) => {
            shared.init.set_ready();
            worker
        }
        Err(msg) => {
            warn!(%msg, "tracker worker failed to initialize");
            shared.init.set_failed(msg);
            return;
        }
    };
    worker.run_loop();
}

struct Worker {
    // Field order is drop order: registered handles and the pool hold easy
    // handles attached to the share, and the multi must outlive registered
    // transfers, so the share goes last.
    //
    // `active` and `handles` are keyed by the same transfer token. They are
    // kept as separate maps so a completion whose transfer context has gone
    // missing can still detach its handle from the multi.
    active: HashMap<usize, Request>,
    handles: HashMap<usize, Easy2Handle<Collector>>,
    pool: HandlePool,
    multi: Multi,
    share: ShareHandle,

    shared: Arc<Shared>,
    /// Retries ordered by due time; the sequence number keeps equal
    /// instants distinct and FIFO.
    retries: BTreeMap<(Instant, u64), Request>,
    retry_seq: u64,
    next_token: usize,
    last_cleanup: Instant,
    connection_limit: usize,
}

impl Worker {
    fn init(shared: Arc<Shared>) -> Result<Worker, String> {
        let share = ShareHandle::new().map_err(|e| e.to_string())?;

        let mut multi = Multi::new();
        // Two connections per host, the HTTP/1.1 convention; with HTTP/2
        // those two connections multiplex all concurrent announces.
        multi
            .set_max_host_connections(2)
            .map_err(|e| format!("setting per-host connection cap: {e}"))?;

        if shared.settings.enable_http2 {
            multi
                .pipelining(false, true)
                .map_err(|e| format!("enabling multiplexing: {e}"))?;
        } else {
            multi
                .pipelining(true, false)
                .map_err(|e| format!("enabling pipelining: {e}"))?;
        }

        let target = hosts::connection_target(
            shared.hosts.unique_count(),
            shared.settings.connections_limit,
        );
        multi
            .set_max_total_connections(target)
            .map_err(|e| format!("setting total connection cap: {e}"))?;
        shared.connection_limit.store(target, Ordering::Release);

        // From here on the reactor side can wake us.
        shared.publish_multi(multi.raw());
        debug!(connection_limit = target, "tracker worker initialized");

        Ok(Worker {
            active: HashMap::new(),
            handles: HashMap::new(),
            pool: HandlePool::new(),
            multi,
            share,
            shared,
            retries: BTreeMap::new(),
            retry_seq: 0,
            next_token: 1,
            last_cleanup: Instant::now(),
            connection_limit: target,
        })
    }

    fn run_loop(&mut self) {
        loop {
            self.drain_queue();
            self.drain_due_retries();

            let running = self.drive_transfers();

            if self.shared.shutting_down.load(Ordering::Acquire) {
                debug!(
                    active = self.active.len(),
                    retrying = self.retries.len(),
                    "shutting down; cancelling outstanding requests"
                );
                self.cancel_all();
                return;
            }

            if running == 0 && self.active.is_empty() {
                let now = Instant::now();
                if now.duration_since(self.last_cleanup) > CLEANUP_INTERVAL {
                    self.pool.cleanup_idle(now);
                    self.last_cleanup = now;
                }
            }

            let timeout = self.wait_timeout(running);
            if let Err(e) = self.multi.poll(&mut [], timeout) {
                warn!(error = %e, "multi poll failed");
                // Avoid spinning on a persistent poll error.
                thread::sleep(Duration::from_millis(50));
            }

            self.apply_connection_limit();
        }
    }

    /// Moves everything the reactor queued into the transport.
    fn drain_queue(&mut self) {
        let pending: Vec<Request> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).collect()
        };
        for request in pending {
            self.submit(request);
        }
    }

    /// Resubmits retries whose backoff has elapsed, failing those whose
    /// deadline passed while they waited.
    fn drain_due_retries(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.retries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let request = entry.remove();
            if now >= request.deadline {
                let err = error::timed_out().with_url(request.url.clone());
                self.shared.complete(request, Err(err));
                continue;
            }
            trace!(url = %request.url, attempt = request.retry_count, "retrying");
            self.submit(request);
        }
    }

    /// Configures a pooled handle for `request` and registers it with the
    /// multi handle.
    fn submit(&mut self, request: Request) {
        let PooledEasy {
            mut easy,
            needs_full_config,
        } = self.pool.acquire();

        if needs_full_config {
            if let Err(e) = configure::session(&mut easy, &self.share, &self.shared.settings) {
                self.fail_submit(easy, request, e);
                return;
            }
        }
        if let Err(e) = configure::request(&mut easy, &request, &self.shared.settings) {
            self.fail_submit(easy, request, e);
            return;
        }

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        let mut handle = match self.multi.add2(easy) {
            Ok(handle) => handle,
            Err(e) => {
                // The handle is gone either way; fail the request.
                warn!(error = %e, url = %request.url, "adding transfer failed");
                let err = error::no_memory().with_url(request.url.clone()).with_source(e);
                self.shared.complete(request, Err(err));
                return;
            }
        };
        if let Err(e) = handle.set_token(token) {
            warn!(error = %e, "tagging transfer failed");
            let err = error::no_memory().with_url(request.url.clone()).with_source(e);
            if let Ok(mut easy) = self.multi.remove2(handle) {
                easy.get_mut().take_buffer();
            }
            self.shared.complete(request, Err(err));
            return;
        }

        trace!(token, url = %request.url, "transfer started");
        self.active.insert(token, request);
        self.handles.insert(token, handle);
        self.shared
            .active_requests
            .store(self.active.len(), Ordering::Release);
    }

    /// A handle that failed configuration is dropped, not pooled: it may
    /// carry a half-applied session state.
    fn fail_submit(&self, mut easy: Easy2<Collector>, request: Request, e: curl::Error) {
        warn!(error = %e, url = %request.url, "configuring transfer failed");
        easy.get_mut().take_buffer();
        drop(easy);
        let err = Error::new(error_kind(&e))
            .with_url(request.url.clone())
            .with_source(e);
        self.shared.complete(request, Err(err));
    }

    /// Runs the multi state machine, harvesting completions until it goes
    /// quiescent. Returns the number of still-running transfers.
    fn drive_transfers(&mut self) -> usize {
        loop {
            let running = match self.multi.perform() {
                Ok(n) => n as usize,
                Err(e) => {
                    warn!(error = %e, "multi perform failed");
                    0
                }
            };
            // Completions free connection slots; going around again lets
            // queued transfers start on them immediately.
            if self.harvest_completions() == 0 {
                return running;
            }
        }
    }

    /// Drains libcurl's per-transfer completion messages.
    fn harvest_completions(&mut self) -> usize {
        let mut done: Vec<(usize, Result<(), curl::Error>)> = Vec::new();
        {
            let handles = &self.handles;
            self.multi.messages(|msg| {
                let Ok(token) = msg.token() else { return };
                let Some(handle) = handles.get(&token) else {
                    // Tokens are assigned at submit and cleared only when a
                    // handle is detached, so a done message always finds
                    // its handle here.
                    debug!(token, "completion message without a registered handle");
                    return;
                };
                if let Some(result) = msg.result_for2(handle) {
                    done.push((token, result));
                }
            });
        }

        let completed = done.len();
        for (token, result) in done {
            let Some(handle) = self.handles.remove(&token) else {
                continue;
            };
            // Detach from the multi and pool the handle before anything
            // else, whether or not a transfer context is still attached to
            // the token.
            let status = match self.multi.remove2(handle) {
                Ok(mut easy) => {
                    let status = easy.response_code().unwrap_or(0);
                    // The handle must not reference the request's buffer
                    // once pooled.
                    easy.get_mut().take_buffer();
                    self.pool.release(easy, Instant::now());
                    status
                }
                Err(e) => {
                    // The handle is stuck in the multi; drop it from the
                    // pool's perspective but still settle the request.
                    warn!(error = %e, "detaching completed transfer failed");
                    0
                }
            };

            let Some(request) = self.active.remove(&token) else {
                // Transfer context gone: the handle above has still been
                // removed from the multi.
                debug!(token, "completion message for unknown transfer");
                continue;
            };
            self.shared
                .active_requests
                .store(self.active.len(), Ordering::Release);

            self.finish(request, result, status);
        }
        completed
    }

    /// Maps a finished transfer to success, retry, or a terminal error.
    fn finish(&mut self, mut request: Request, result: Result<(), curl::Error>, status: u32) {
        match result {
            Ok(()) => {
                if status >= 400 {
                    trace!(status, url = %request.url, "tracker returned HTTP error");
                    // Server-side errors may be transient; client errors
                    // are not going to improve on a retry.
                    if status >= 500 && request.retry_count < request.max_retries {
                        self.schedule_retry(request);
                        return;
                    }
                    let err = Error::new(ErrorKind::HttpError)
                        .with_url(request.url.clone())
                        .with_source(format!("HTTP status {status}"));
                    self.shared.complete(request, Err(err));
                    return;
                }

                let body = mem::take(&mut request.buffer.lock().data);
                trace!(status, bytes = body.len(), url = %request.url, "tracker request done");
                self.shared.complete(request, Ok(body));
            }
            Err(e) => {
                if is_retryable(&e)
                    && request.retry_count < request.max_retries
                    && Instant::now() < request.deadline
                {
                    debug!(error = %e, url = %request.url, "transient failure; scheduling retry");
                    self.schedule_retry(request);
                    return;
                }
                let err = Error::new(error_kind(&e))
                    .with_url(request.url.clone())
                    .with_source(e);
                self.shared.complete(request, Err(err));
            }
        }
    }

    /// Queues `request` for another attempt after its current backoff,
    /// unless that would overrun the deadline — then it times out now.
    fn schedule_retry(&mut self, mut request: Request) {
        request.retry_count += 1;
        let delay = request.retry_delay;
        request.retry_delay = (delay * 2).min(MAX_RETRY_DELAY);
        request.buffer.lock().data.clear();

        let due = Instant::now() + delay;
        if due >= request.deadline {
            let err = error::timed_out().with_url(request.url.clone());
            self.shared.complete(request, Err(err));
            return;
        }

        self.retry_seq += 1;
        self.retries.insert((due, self.retry_seq), request);
        self.shared.counters.retried.fetch_add(1, Ordering::Relaxed);
        // No wakeup needed: the wait-timeout computation accounts for the
        // earliest retry.
    }

    /// Fails every active and retrying request with `SessionClosing`.
    fn cancel_all(&mut self) {
        for (_, handle) in mem::take(&mut self.handles) {
            if let Ok(mut easy) = self.multi.remove2(handle) {
                easy.get_mut().take_buffer();
            }
        }
        for (_, request) in mem::take(&mut self.active) {
            let err = error::session_closing().with_url(request.url.clone());
            self.shared.complete(request, Err(err));
        }
        self.shared.active_requests.store(0, Ordering::Release);

        for (_, request) in mem::take(&mut self.retries) {
            let err = error::session_closing().with_url(request.url.clone());
            self.shared.complete(request, Err(err));
        }
    }

    /// How long the poll may sleep without missing anything.
    fn wait_timeout(&self, running: usize) -> Duration {
        let curl_timeout = self.multi.get_timeout().ok().flatten();

        let next_retry = self
            .retries
            .keys()
            .next()
            .map(|(due, _)| due.saturating_duration_since(Instant::now()));

        let timeout = if !self.active.is_empty() {
            let base = curl_timeout.unwrap_or(ACTIVE_POLL_FALLBACK);
            match next_retry {
                Some(retry) => base.min(retry),
                None => base,
            }
        } else if let Some(retry) = next_retry {
            retry
        } else {
            // Fully idle: sleep long, a wakeup interrupts the poll.
            IDLE_POLL
        };

        if self.shared.shutting_down.load(Ordering::Acquire) && running > 0 {
            timeout.min(SHUTDOWN_POLL)
        } else {
            timeout
        }
    }

    /// Applies a connection-cap change published by tracker add/remove.
    fn apply_connection_limit(&mut self) {
        if !self.shared.pool_needs_update.swap(false, Ordering::AcqRel) {
            return;
        }
        let target = self
            .shared
            .pending_connection_limit
            .load(Ordering::Acquire);
        if target == self.connection_limit {
            return;
        }
        match self.multi.set_max_total_connections(target) {
            Ok(()) => {
                debug!(from = self.connection_limit, to = target, "resized connection pool");
                self.connection_limit = target;
                self.shared
                    .connection_limit
                    .store(target, Ordering::Release);
            }
            Err(e) => warn!(error = %e, "resizing connection pool failed"),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Unpublish before the multi handle is destroyed so no wakeup call
        // can race with its teardown.
        self.shared.publish_multi(std::ptr::null_mut());
    }
}

/// Classifies a transport error into the kinds completions report.
fn error_kind(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        ErrorKind::TimedOut
    } else if e.is_couldnt_resolve_host() || e.is_couldnt_resolve_proxy() {
        ErrorKind::InvalidHostname
    } else if e.is_ssl_connect_error() || e.is_ssl_certproblem() || e.is_peer_failed_verification()
    {
        ErrorKind::InvalidSslCert
    } else if e.is_out_of_memory() {
        ErrorKind::NoMemory
    } else if e.is_unsupported_protocol() {
        ErrorKind::UnsupportedUrlProtocol
    } else {
        // Write errors, exceeded size caps, connect failures and the rest
        // of the transport failures all surface as the generic HTTP error.
        ErrorKind::HttpError
    }
}

/// Transient transport failures are retried; failures that will not improve
/// within a request's lifetime (DNS, refused connections, local interface
/// problems, oversized or malformed responses) are not.
fn is_retryable(e: &curl::Error) -> bool {
    if e.is_write_error()
        || e.is_filesize_exceeded()
        || e.is_unsupported_protocol()
        || e.is_couldnt_resolve_proxy()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_connect()
        || e.is_interface_failed()
    {
        return false;
    }
    matches!(
        error_kind(e),
        ErrorKind::TimedOut | ErrorKind::HttpError | ErrorKind::InvalidHostname
    )
}
