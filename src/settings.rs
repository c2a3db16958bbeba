//! Read-only configuration consumed by the manager and the request
//! configurator.

use std::{path::PathBuf, time::Duration};

/// Which proxy protocol to speak for tracker connections.
///
/// The `*Pw` variants additionally send the configured username/password.
/// SOCKS variants always hand the hostname to the proxy so the client never
/// resolves tracker names locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyKind {
    #[default]
    None,
    Socks4,
    Socks5,
    Socks5Pw,
    Http,
    HttpPw,
}

impl ProxyKind {
    pub(crate) fn requires_auth(self) -> bool {
        matches!(self, ProxyKind::Socks5Pw | ProxyKind::HttpPw)
    }
}

/// Minimum TLS protocol version for HTTPS trackers.
///
/// TLS 1.1 is deprecated (RFC 8996); requesting it is honored as TLS 1.2
/// with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    Tls1_1,
    #[default]
    Tls1_2,
    Tls1_3,
}

/// Configuration record for the tracker HTTP client.
///
/// All fields are read once at manager construction; the record never
/// changes for the lifetime of a [`Manager`](crate::Manager).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Master switch: route tracker connections through the configured proxy.
    pub proxy_tracker_connections: bool,
    /// Proxy protocol. `ProxyKind::None` disables proxying regardless of the
    /// master switch.
    pub proxy_kind: ProxyKind,
    /// Proxy endpoint. An empty hostname or port 0 disables proxying.
    pub proxy_hostname: String,
    pub proxy_port: u16,
    /// Proxy credentials, used only by the `*Pw` proxy kinds. Local copies
    /// are zeroed as soon as they have been handed to the transport.
    pub proxy_username: String,
    pub proxy_password: String,
    /// Route even internal/loopback addresses through the proxy. Off by
    /// default; turning it on is logged loudly since it exposes internal
    /// traffic to the proxy operator.
    pub proxy_force_internal_addresses: bool,
    /// Let the proxy resolve tracker hostnames. Always honored for the SOCKS
    /// kinds via their hostname-forwarding variants.
    pub proxy_hostnames: bool,

    /// Verify the tracker's TLS certificate chain.
    pub ssl_verify_peer: bool,
    /// Verify that the certificate matches the tracker hostname.
    pub ssl_verify_host: bool,
    /// Minimum accepted TLS version.
    pub min_tls_version: TlsVersion,
    /// Optional custom CA bundle for tracker connections.
    pub ca_certificate: Option<PathBuf>,

    /// Prefer HTTP/2 (with ALPN) for tracker requests; falls back to
    /// HTTP/1.1 when the server does not negotiate it.
    pub enable_http2: bool,

    /// Overall per-request deadline, covering every retry attempt.
    pub completion_timeout: Duration,
    /// How long a transfer may stall (below 10 B/s) before it is aborted.
    pub receive_timeout: Duration,
    /// Hard cap on the size of a tracker response body.
    pub max_response_size: usize,

    /// Value of the `User-Agent` header. Empty sends no header.
    pub user_agent: String,
    /// Comma-separated outbound interfaces; the first entry is bound for
    /// tracker connections. Empty leaves the choice to the OS.
    pub outgoing_interfaces: String,
    /// Soft ceiling on the total connection pool, on top of the
    /// 2-per-unique-host scaling. 0 means no extra ceiling.
    pub connections_limit: usize,
}

pub(crate) const DEFAULT_MAX_RESPONSE_SIZE: usize = 128 * 1024;

impl Default for Settings {
    fn default() -> Self {
        Settings {
            proxy_tracker_connections: false,
            proxy_kind: ProxyKind::None,
            proxy_hostname: String::new(),
            proxy_port: 0,
            proxy_username: String::new(),
            proxy_password: String::new(),
            proxy_force_internal_addresses: false,
            proxy_hostnames: true,
            ssl_verify_peer: true,
            ssl_verify_host: true,
            min_tls_version: TlsVersion::Tls1_2,
            ca_certificate: None,
            enable_http2: true,
            completion_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(30),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            user_agent: String::new(),
            outgoing_interfaces: String::new(),
            connections_limit: 0,
        }
    }
}

impl Settings {
    /// The response-size cap, substituting the default when unset.
    pub(crate) fn response_size_cap(&self) -> usize {
        if self.max_response_size == 0 {
            DEFAULT_MAX_RESPONSE_SIZE
        } else {
            self.max_response_size
        }
    }

    /// Whether a usable proxy is configured for tracker connections.
    pub(crate) fn proxy_enabled(&self) -> bool {
        self.proxy_tracker_connections
            && self.proxy_kind != ProxyKind::None
            && !self.proxy_hostname.is_empty()
            && self.proxy_port != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_response_size_falls_back_to_default() {
        let mut settings = Settings::default();
        settings.max_response_size = 0;
        assert_eq!(settings.response_size_cap(), DEFAULT_MAX_RESPONSE_SIZE);
    }

    #[test]
    fn proxy_disabled_without_endpoint() {
        let mut settings = Settings {
            proxy_tracker_connections: true,
            proxy_kind: ProxyKind::Socks5,
            ..Settings::default()
        };
        assert!(!settings.proxy_enabled());

        settings.proxy_hostname = "proxy.local".into();
        assert!(!settings.proxy_enabled());

        settings.proxy_port = 1080;
        assert!(settings.proxy_enabled());

        settings.proxy_kind = ProxyKind::None;
        assert!(!settings.proxy_enabled());
    }
}
