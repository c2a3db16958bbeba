//! Per-tracker clients: announce and scrape URL construction.
//!
//! A tracker client is a thin, stateless layer that turns a
//! [`TrackerRequest`] into the GET URL the tracker expects and hands it to
//! the [`Manager`]. Connection reuse, retries, and deadlines all live below,
//! so clients are free to be created per announce.

use std::fmt::Write as _;
use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_encode};
use url::Url;

use crate::{Error, Manager};

/// Everything except unreserved characters is escaped, as trackers expect
/// for binary fields like the info-hash.
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The event accompanying an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    /// A periodic (keep-alive) announce.
    #[default]
    None,
    Completed,
    Started,
    Stopped,
    Paused,
}

impl AnnounceEvent {
    fn as_str(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Paused => Some("paused"),
        }
    }
}

/// A torrent's identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl InfoHash {
    /// The form sent to trackers: SHA-256 hashes are truncated to 20 bytes
    /// on the wire (BEP 52).
    pub fn wire_bytes(&self) -> &[u8] {
        match self {
            InfoHash::Sha1(bytes) => bytes,
            InfoHash::Sha256(bytes) => &bytes[..20],
        }
    }
}

/// The progress report and peer solicitation carried by an announce.
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    /// The port peers should connect back to.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes left until the torrent is complete.
    pub left: u64,
    /// Bytes that failed their hash check.
    pub corrupt: u64,
    /// Bytes received more than once.
    pub redundant: u64,
    pub event: AnnounceEvent,
    /// Random identifier letting the tracker match announces across IP
    /// changes; sent as fixed-width hex.
    pub key: u32,
    /// How many peers to ask for; negative leaves it to the tracker.
    pub num_want: i32,
}

impl TrackerRequest {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> TrackerRequest {
        TrackerRequest {
            info_hash,
            peer_id,
            port: 0,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            corrupt: 0,
            redundant: 0,
            event: AnnounceEvent::None,
            key: 0,
            num_want: -1,
        }
    }
}

/// An HTTP(S) tracker endpoint bound to a [`Manager`].
#[derive(Clone)]
pub struct HttpTracker {
    url: String,
    manager: Arc<Manager>,
}

impl HttpTracker {
    pub fn new(manager: Arc<Manager>, url: impl Into<String>) -> HttpTracker {
        HttpTracker {
            url: url.into(),
            manager,
        }
    }

    /// The tracker's announce URL as configured.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Submits an announce. The completion receives the raw bencoded
    /// response body and runs on the reactor, exactly once.
    pub fn announce<F>(&self, req: &TrackerRequest, completion: F)
    where
        F: FnOnce(Result<Vec<u8>, Error>) + Send + 'static,
    {
        let url = build_announce_url(&self.url, req);
        let timeout = self.manager.settings().completion_timeout;
        self.manager.add_request(url, timeout, completion);
    }

    /// Submits a scrape for the request's info-hash.
    ///
    /// Per the BEP 48 convention this is only possible when the announce
    /// URL's last path segment starts with `announce`; otherwise the tracker
    /// has no derivable scrape endpoint and `Err` is returned without
    /// queueing anything.
    pub fn scrape<F>(&self, req: &TrackerRequest, completion: F) -> crate::Result<()>
    where
        F: FnOnce(Result<Vec<u8>, Error>) + Send + 'static,
    {
        let Some(base) = scrape_url_from_announce(&self.url) else {
            return Err(Error::builder_msg("tracker does not expose a scrape endpoint")
                .with_url(self.url.clone()));
        };
        let mut url = base;
        url.push(if url.contains('?') { '&' } else { '?' });
        let _ = write!(url, "info_hash={}", escape(req.info_hash.wire_bytes()));

        let timeout = self.manager.settings().completion_timeout;
        self.manager.add_request(url, timeout, completion);
        Ok(())
    }

    /// Always true: connection reuse happens in the transport's pools, not
    /// per client object.
    pub fn can_reuse(&self) -> bool {
        true
    }

    /// No-op, idempotent. The manager owns the in-flight transfer; a request
    /// already submitted still completes normally.
    pub fn close(&self) {}
}

/// A tracker endpoint of any transport family.
///
/// Announce transports are a closed set with a fixed protocol surface, so
/// they are a sum rather than a trait object. The UDP and WebSocket
/// transports belong to the host process; only HTTP(S) lives in this crate.
#[non_exhaustive]
pub enum Tracker {
    Http(HttpTracker),
}

impl Tracker {
    pub fn announce<F>(&self, req: &TrackerRequest, completion: F)
    where
        F: FnOnce(Result<Vec<u8>, Error>) + Send + 'static,
    {
        match self {
            Tracker::Http(t) => t.announce(req, completion),
        }
    }

    pub fn scrape<F>(&self, req: &TrackerRequest, completion: F) -> crate::Result<()>
    where
        F: FnOnce(Result<Vec<u8>, Error>) + Send + 'static,
    {
        match self {
            Tracker::Http(t) => t.scrape(req, completion),
        }
    }

    pub fn can_reuse(&self) -> bool {
        match self {
            Tracker::Http(t) => t.can_reuse(),
        }
    }

    pub fn close(&self) {
        match self {
            Tracker::Http(t) => t.close(),
        }
    }
}

fn escape(bytes: &[u8]) -> impl std::fmt::Display + '_ {
    percent_encode(bytes, QUERY_ESCAPE)
}

fn build_announce_url(tracker: &str, req: &TrackerRequest) -> String {
    let mut url = String::with_capacity(tracker.len() + 256);
    url.push_str(tracker);
    url.push(if tracker.contains('?') { '&' } else { '?' });

    let _ = write!(
        url,
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}\
         &corrupt={}&redundant={}&compact=1&no_peer_id=1&key={:08X}",
        escape(req.info_hash.wire_bytes()),
        escape(&req.peer_id),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left,
        req.corrupt,
        req.redundant,
        req.key,
    );
    if req.num_want >= 0 {
        let _ = write!(url, "&numwant={}", req.num_want);
    }
    if let Some(event) = req.event.as_str() {
        let _ = write!(url, "&event={event}");
    }
    url
}

/// Rewrites an announce URL into its scrape URL: the last path segment's
/// `announce` prefix becomes `scrape` (`/x/announce.php` → `/x/scrape.php`).
/// Returns `None` when the URL does not follow the convention.
fn scrape_url_from_announce(announce: &str) -> Option<String> {
    let mut parsed = Url::parse(announce).ok()?;
    let path = parsed.path().to_owned();
    let (dir, last) = match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path.as_str()),
    };
    let rest = last.strip_prefix("announce")?;
    parsed.set_path(&format!("{dir}scrape{rest}"));
    Some(parsed.to_string())
}
