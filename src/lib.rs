//! Multiplexed HTTP/HTTPS BitTorrent tracker client built on libcurl's
//! multi interface.
//!
//! A [`Manager`] runs one background worker thread that drives every
//! announce and scrape for a session over a single connection-pooled,
//! HTTP/2-capable transport:
//!
//! - requests enqueued from the host's event loop are batched, so a burst
//!   of announces wakes the worker once;
//! - easy handles are pooled with their session configuration (TLS version,
//!   cipher list, HTTP version, keep-alive) intact, and a shared DNS +
//!   TLS-session cache spans all of them;
//! - the connection pool is continuously rescaled to the population of
//!   distinct tracker hosts (two connections per host);
//! - failures retry with exponential backoff under a fixed per-request
//!   deadline, and every request resolves with exactly one completion
//!   callback, delivered on the host's reactor — never on the worker
//!   thread.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use curl_tracker::{HttpTracker, InfoHash, Manager, Reactor, Settings, Task, TrackerRequest};
//!
//! // The host process supplies its single-threaded event loop.
//! struct Loop(/* ... */);
//! # impl Loop { fn run(&self) {} }
//! impl Reactor for Loop {
//!     fn post(&self, task: Task) { /* queue on the event loop */ }
//!     fn post_after(&self, delay: Duration, task: Task) { /* one-shot timer */ }
//! }
//!
//! # fn main() -> curl_tracker::Result<()> {
//! let reactor = Arc::new(Loop(/* ... */));
//! let manager = Manager::new(reactor, Settings::default())?;
//!
//! let tracker = HttpTracker::new(manager.clone(), "http://tracker.example.com/announce");
//! let req = TrackerRequest::new(InfoHash::Sha1([0; 20]), *b"-CT0100-000000000000");
//! tracker.announce(&req, |result| match result {
//!     Ok(body) => println!("got {} bytes of bencoded response", body.len()),
//!     Err(err) => eprintln!("announce failed: {err}"),
//! });
//! # Ok(())
//! # }
//! ```

mod buffer;
mod error;
mod handle;
mod hosts;
mod manager;
mod reactor;
mod settings;
mod share;
mod tracker;

pub use crate::{
    error::{Error, ErrorKind, Result},
    manager::{Completion, Manager, Stats},
    reactor::{Reactor, Task},
    settings::{ProxyKind, Settings, TlsVersion},
    tracker::{AnnounceEvent, HttpTracker, InfoHash, Tracker, TrackerRequest},
};
