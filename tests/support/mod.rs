//! Test fixtures: a single-threaded reactor and a loopback HTTP server.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, VecDeque},
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use curl_tracker::{Reactor, Task};
use parking_lot::{Condvar, Mutex};

/// A real single-threaded event loop: tasks run in order on one dedicated
/// thread, delayed tasks fire from a timer heap on the same thread.
pub struct TestReactor {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    thread_id: Mutex<Option<ThreadId>>,
}

struct State {
    ready: VecDeque<Task>,
    delayed: BinaryHeap<Delayed>,
    seq: u64,
    shutdown: bool,
}

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest due time
        // on top, FIFO for ties.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TestReactor {
    pub fn start() -> Arc<TestReactor> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            thread_id: Mutex::new(None),
        });

        let run_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("test-reactor".into())
            .spawn(move || {
                *run_inner.thread_id.lock() = Some(thread::current().id());
                run_loop(&run_inner);
            })
            .expect("spawning test reactor");

        Arc::new(TestReactor {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The id of the thread all posted tasks run on.
    pub fn thread_id(&self) -> ThreadId {
        loop {
            if let Some(id) = *self.inner.thread_id.lock() {
                return id;
            }
            thread::yield_now();
        }
    }
}

fn run_loop(inner: &Inner) {
    let mut state = inner.state.lock();
    loop {
        let now = Instant::now();
        while state.delayed.peek().is_some_and(|d| d.due <= now) {
            let delayed = state.delayed.pop().expect("peeked entry");
            state.ready.push_back(delayed.task);
        }

        if let Some(task) = state.ready.pop_front() {
            drop(state);
            task();
            state = inner.state.lock();
            continue;
        }

        if state.shutdown {
            return;
        }

        match state.delayed.peek().map(|d| d.due) {
            Some(due) => {
                let _ = inner.cond.wait_until(&mut state, due);
            }
            None => inner.cond.wait(&mut state),
        }
    }
}

impl Reactor for TestReactor {
    fn post(&self, task: Task) {
        let mut state = self.inner.state.lock();
        state.ready.push_back(task);
        drop(state);
        self.inner.cond.notify_one();
    }

    fn post_after(&self, delay: Duration, task: Task) {
        let mut state = self.inner.state.lock();
        let seq = state.seq;
        state.seq += 1;
        state.delayed.push(Delayed {
            due: Instant::now() + delay,
            seq,
            task,
        });
        drop(state);
        self.inner.cond.notify_one();
    }
}

impl Drop for TestReactor {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cond.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

enum Mode {
    Respond { status: u16, body: Vec<u8> },
    /// Accept connections and read requests, but never answer.
    Silent,
}

/// Minimal loopback HTTP/1.1 server, one response shape for all requests.
pub struct TestServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    last_target: Arc<Mutex<Option<String>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn respond_with(status: u16, body: &[u8]) -> TestServer {
        TestServer::start(Mode::Respond {
            status,
            body: body.to_vec(),
        })
    }

    pub fn silent() -> TestServer {
        TestServer::start(Mode::Silent)
    }

    fn start(mode: Mode) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding test server");
        let addr = listener.local_addr().expect("test server address");
        let hits = Arc::new(AtomicUsize::new(0));
        let last_target = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let hits = Arc::clone(&hits);
            let last_target = Arc::clone(&last_target);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || serve(listener, mode, hits, last_target, shutdown))
        };

        TestServer {
            addr,
            hits,
            last_target,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests fully received so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// The request target (path + query) of the most recent request.
    pub fn last_target(&self) -> Option<String> {
        self.last_target.lock().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock accept().
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(
    listener: TcpListener,
    mode: Mode,
    hits: Arc<AtomicUsize>,
    last_target: Arc<Mutex<Option<String>>>,
    shutdown: Arc<AtomicBool>,
) {
    // Parked connections for silent mode, held open until shutdown.
    let mut parked = Vec::new();

    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let Ok(mut stream) = stream else { continue };

        if read_request(&mut stream, &hits, &last_target).is_none() {
            continue;
        }

        match &mode {
            Mode::Respond { status, body } => {
                let reason = match status {
                    200 => "OK",
                    404 => "Not Found",
                    500 => "Internal Server Error",
                    _ => "Response",
                };
                let header = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(body);
                let _ = stream.flush();
            }
            Mode::Silent => parked.push(stream),
        }
    }
}

/// Reads one request's head; returns `None` on a connection that produced
/// no request (e.g. the shutdown poke).
fn read_request(
    stream: &mut TcpStream,
    hits: &AtomicUsize,
    last_target: &Mutex<Option<String>>,
) -> Option<()> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.split_whitespace();
    let (Some(_method), Some(target)) = (parts.next(), parts.next()) else {
        return None;
    };

    hits.fetch_add(1, Ordering::SeqCst);
    *last_target.lock() = Some(target.to_string());
    Some(())
}
