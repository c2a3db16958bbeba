//! Tracker host accounting and connection-pool sizing.
//!
//! The multi handle's total-connection cap tracks the population of distinct
//! tracker hostnames: two connections per unique host (the HTTP/1.1
//! convention; under HTTP/2 those two connections multiplex many streams),
//! bounded below by 2 and above by the file-descriptor budget and a hard
//! ceiling of 100.

use std::collections::HashMap;

use parking_lot::Mutex;
use url::Url;

/// Refcounted multiset of tracker hostnames.
///
/// `add`/`remove` are called from the reactor whenever a tracker is added to
/// or removed from any torrent; the same URL may be registered by many
/// torrents, hence the reference counts. Only the hostname participates:
/// scheme, port and path do not make a tracker a distinct host.
pub(crate) struct HostCounter {
    counts: Mutex<HashMap<String, usize>>,
}

impl HostCounter {
    pub(crate) fn new() -> HostCounter {
        HostCounter {
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add(&self, url: &str) {
        let Some(host) = host_of(url) else { return };
        *self.counts.lock().entry(host).or_insert(0) += 1;
    }

    pub(crate) fn remove(&self, url: &str) {
        let Some(host) = host_of(url) else { return };
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&host) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&host);
            }
        }
    }

    pub(crate) fn unique_count(&self) -> usize {
        self.counts.lock().len()
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// Total-connection cap for the multi handle:
/// `clamp(2 * unique_hosts, 2, min(100, fd_budget, connections_limit))`.
pub(crate) fn connection_target(unique_hosts: usize, connections_limit: usize) -> usize {
    let mut ceiling = fd_budget().min(100);
    if connections_limit > 0 {
        ceiling = ceiling.min(connections_limit);
    }
    // The floor wins if the ceiling dips below it.
    (unique_hosts * 2).clamp(2, ceiling.max(2))
}

/// Connections this process can afford: a quarter of the file-descriptor
/// soft limit, so trackers cannot starve peer sockets and disk I/O.
#[cfg(unix)]
fn fd_budget() -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the struct we hand it.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if rc != 0 {
        return 250;
    }
    ((rlim.rlim_cur / 4) as usize).max(8)
}

#[cfg(windows)]
fn fd_budget() -> usize {
    // A quarter of the 2048 stdio handles the CRT allows once raised.
    512
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_unique_hosts_not_urls() {
        let counter = HostCounter::new();
        counter.add("http://tracker.example.com/announce");
        counter.add("https://tracker.example.com:8443/other/path");
        counter.add("udp://tracker.example.com:6969/announce");
        assert_eq!(counter.unique_count(), 1);

        counter.add("http://other.example.net/announce");
        assert_eq!(counter.unique_count(), 2);
    }

    #[test]
    fn add_remove_round_trip_is_identity() {
        let counter = HostCounter::new();
        counter.add("http://a.example/announce");
        assert_eq!(counter.unique_count(), 1);

        counter.add("http://b.example/announce");
        counter.remove("http://b.example/announce");
        assert_eq!(counter.unique_count(), 1);
    }

    #[test]
    fn refcounts_survive_partial_removal() {
        let counter = HostCounter::new();
        counter.add("http://a.example/announce");
        counter.add("http://a.example/announce");
        counter.remove("http://a.example/announce");
        assert_eq!(counter.unique_count(), 1);
        counter.remove("http://a.example/announce");
        assert_eq!(counter.unique_count(), 0);
    }

    #[test]
    fn unparsable_urls_are_ignored() {
        let counter = HostCounter::new();
        counter.add("not-a-url");
        counter.add("");
        counter.add("http://");
        counter.remove("also-not-a-url");
        assert_eq!(counter.unique_count(), 0);
    }

    #[test]
    fn target_scales_with_hosts_and_clamps() {
        assert_eq!(connection_target(0, 0), 2);
        assert_eq!(connection_target(1, 0), 2);
        assert_eq!(connection_target(3, 0), 6);
        // 2 * unique never exceeds the hard ceiling of 100.
        assert!(connection_target(500, 0) <= 100);
        // An explicit connections_limit lowers the ceiling further.
        assert_eq!(connection_target(50, 10), 10);
        // ... but never below the floor of 2.
        assert_eq!(connection_target(50, 1), 2);
    }
}
