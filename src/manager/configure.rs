//! Easy-handle configuration.
//!
//! Split the way the handle pool expects it:
//!
//! - [`clear_request_state`] unconditionally unsets every request-scoped
//!   option that could leak from one transfer into the next reuse of the
//!   handle.
//! - [`session`] applies the expensive session-level options (TLS, HTTP
//!   version, share attachment, keep-alive, redirect policy). Only run when
//!   the pool says the handle needs it; these options are what handle reuse
//!   preserves.
//! - [`request`] applies the per-request options (URL, deadline-derived
//!   timeouts, write target, user-agent, interface, proxy).

use std::{
    os::raw::{c_char, c_long},
    ptr,
    sync::Once,
    time::{Duration, Instant},
};

use curl::easy::{Auth, Easy2, HttpVersion, List, ProxyType, SslVersion};
use tracing::warn;

use crate::{
    handle::Collector,
    settings::{ProxyKind, Settings, TlsVersion},
    share::{ShareHandle, raw},
};

use super::Request;

// Request-scoped floors and session constants.
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: u32 = 5;
const TCP_KEEPIDLE: Duration = Duration::from_secs(120);
const TCP_KEEPINTVL: Duration = Duration::from_secs(60);
const DNS_CACHE_TIMEOUT: Duration = Duration::from_secs(300);
const LOW_SPEED_FLOOR: u32 = 10; // bytes per second
const DEFAULT_LOW_SPEED_WINDOW: Duration = Duration::from_secs(30);

// Modern AEAD suites only; everything weak or anonymous is excluded
// explicitly in case the backend's defaults are lax.
const CIPHER_LIST: &str = "ECDHE+AESGCM:ECDHE+CHACHA20:DHE+AESGCM:DHE+CHACHA20:\
                           ECDHE-RSA-AES256-GCM-SHA384:ECDHE-RSA-AES128-GCM-SHA256:\
                           !aNULL:!eNULL:!EXPORT:!DES:!MD5:!PSK:!RC4:!3DES:!DSS";

// Options the safe wrapper does not expose; numbered per libcurl's stable
// option ABI.
const CURLOPT_UNRESTRICTED_AUTH: curl_sys::CURLoption = curl_sys::CURLOPTTYPE_LONG + 105;
const CURLOPT_USERPWD: curl_sys::CURLoption = curl_sys::CURLOPTTYPE_OBJECTPOINT + 5;

// The HTTP/2 stream-window knob only exists in libcurl builds carrying the
// window-size patch; it sits outside the upstream option numbering, and
// stock builds answer the write with CURLE_UNKNOWN_OPTION (their stream
// window defaults to the same 10 MiB since 7.88.0). See `session`.
const CURLOPT_HTTP2_WINDOW_SIZE: curl_sys::CURLoption = curl_sys::CURLOPTTYPE_LONG + 999;
const HTTP2_WINDOW_SIZE: c_long = 10 * 1024 * 1024;

/// Unsets every option a previous transfer may have left on the handle.
///
/// Pooled handles are never reset wholesale, so anything request-scoped has
/// to be cleared field by field: leftover headers, body state, a custom
/// method, or auth credentials must not ride along into the next request.
pub(super) fn clear_request_state(easy: &mut Easy2<Collector>) -> Result<(), curl::Error> {
    // An empty list carries a NULL slist pointer, clearing the header list.
    easy.http_headers(List::new())?;

    easy.post(false)?;
    easy.upload(false)?;
    // No flags set means CURLAUTH_NONE.
    easy.http_auth(&Auth::new())?;

    // SAFETY: the handle is live; NULL is the documented way to clear these.
    unsafe {
        raw::setopt_ptr(easy.raw(), curl_sys::CURLOPT_POSTFIELDS, ptr::null::<c_char>())?;
        raw::setopt_long(easy.raw(), curl_sys::CURLOPT_POSTFIELDSIZE, -1)?;
        raw::setopt_ptr(easy.raw(), curl_sys::CURLOPT_CUSTOMREQUEST, ptr::null::<c_char>())?;
        raw::setopt_ptr(easy.raw(), CURLOPT_USERPWD, ptr::null::<c_char>())?;
    }

    easy.get(true)?;
    Ok(())
}

/// Applies session-level options. These survive in the handle across pool
/// round-trips; the pool only asks for them again after
/// `invalidate_settings`.
pub(super) fn session(
    easy: &mut Easy2<Collector>,
    share: &ShareHandle,
    settings: &Settings,
) -> Result<(), curl::Error> {
    share.attach(easy)?;

    // Required when libcurl is driven from a thread: signal-based resolver
    // timeouts would fire on the wrong thread.
    easy.signal(false)?;

    easy.follow_location(true)?;
    easy.max_redirections(MAX_REDIRECTS)?;

    // HTTP(S) only, both for the original URL and for every redirect
    // target. Keeps a malicious tracker from bouncing us to file:// or
    // gopher://.
    let http_only = (curl_sys::CURLPROTO_HTTP | curl_sys::CURLPROTO_HTTPS) as std::os::raw::c_long;
    // SAFETY: live handle, long options.
    unsafe {
        raw::setopt_long(easy.raw(), curl_sys::CURLOPT_PROTOCOLS, http_only)?;
        raw::setopt_long(easy.raw(), curl_sys::CURLOPT_REDIR_PROTOCOLS, http_only)?;
        // Do not replay credentials to a host a redirect handed us.
        raw::setopt_long(easy.raw(), CURLOPT_UNRESTRICTED_AUTH, 0)?;
    }

    easy.tcp_keepalive(true)?;
    easy.tcp_keepidle(TCP_KEEPIDLE)?;
    easy.tcp_keepintvl(TCP_KEEPINTVL)?;

    easy.dns_cache_timeout(DNS_CACHE_TIMEOUT)?;

    // Abort transfers that stall below 10 B/s for the receive window.
    let window = if settings.receive_timeout > Duration::ZERO {
        settings.receive_timeout
    } else {
        DEFAULT_LOW_SPEED_WINDOW
    };
    easy.low_speed_limit(LOW_SPEED_FLOOR)?;
    easy.low_speed_time(window)?;

    if settings.enable_http2 && curl::Version::get().feature_http2() {
        // HTTP/2 negotiated via ALPN (libcurl's default for HTTPS). Server
        // push stays off: no push callback is installed on the multi handle.
        easy.http_version(HttpVersion::V2)?;
        // Wait for an existing connection's multiplexing verdict instead of
        // racing a second connection to the same tracker.
        easy.pipewait(true)?;
        // 10 MiB stream window, so many multiplexed announces do not stall
        // each other's flow control. Builds without the knob reject the
        // option; their stream window already defaults to this size.
        // SAFETY: live handle, long option.
        match unsafe { raw::setopt_long(easy.raw(), CURLOPT_HTTP2_WINDOW_SIZE, HTTP2_WINDOW_SIZE) }
        {
            Ok(()) => {}
            Err(ref e) if e.is_unknown_option() => {}
            Err(e) => return Err(e),
        }
    } else {
        easy.http_version(HttpVersion::V11)?;
    }

    tls(easy, settings)?;
    Ok(())
}

fn tls(easy: &mut Easy2<Collector>, settings: &Settings) -> Result<(), curl::Error> {
    static PEER_WARN: Once = Once::new();
    static HOST_WARN: Once = Once::new();
    static TLS11_WARN: Once = Once::new();
    static CA_NOTE: Once = Once::new();

    easy.ssl_verify_peer(settings.ssl_verify_peer)?;
    if !settings.ssl_verify_peer {
        PEER_WARN.call_once(|| {
            warn!("TLS certificate verification disabled for tracker connections");
        });
    }

    easy.ssl_verify_host(settings.ssl_verify_host)?;
    if !settings.ssl_verify_host {
        HOST_WARN.call_once(|| {
            warn!("TLS hostname verification disabled for tracker connections");
        });
    }

    let min = match settings.min_tls_version {
        TlsVersion::Tls1_1 => {
            // Deprecated by RFC 8996; the request is honored as 1.2.
            TLS11_WARN.call_once(|| {
                warn!("TLS 1.1 requested for trackers; upgrading the minimum to TLS 1.2");
            });
            SslVersion::Tlsv12
        }
        TlsVersion::Tls1_2 => SslVersion::Tlsv12,
        TlsVersion::Tls1_3 => SslVersion::Tlsv13,
    };
    easy.ssl_min_max_version(min, SslVersion::Default)?;

    easy.ssl_cipher_list(CIPHER_LIST)?;

    if let Some(ref ca) = settings.ca_certificate {
        easy.cainfo(ca)?;
        CA_NOTE.call_once(|| {
            tracing::debug!(path = %ca.display(), "using custom CA bundle for trackers");
        });
    }
    Ok(())
}

/// Applies per-request options, starting from a clean request state.
pub(super) fn request(
    easy: &mut Easy2<Collector>,
    req: &Request,
    settings: &Settings,
) -> Result<(), curl::Error> {
    clear_request_state(easy)?;

    // The overall transfer timeout is whatever is left until the request's
    // deadline, floored at one second so an almost-expired request still
    // gets a real attempt (and then fails on the deadline check).
    let remaining = req.deadline.saturating_duration_since(Instant::now());
    let total = remaining.max(MIN_REQUEST_TIMEOUT);
    easy.timeout(total)?;
    easy.connect_timeout(total.min(MAX_CONNECT_TIMEOUT))?;

    easy.url(&req.url)?;

    // Write target: the collector appends into the request's shared buffer
    // and enforces its size cap. Belt and braces, the transfer also aborts
    // at the cap through MAXFILESIZE when the server announces a length.
    easy.get_mut().attach_buffer(req.buffer.clone());
    easy.max_filesize(req.buffer.lock().limit as u64)?;

    if !settings.user_agent.is_empty() {
        easy.useragent(&settings.user_agent)?;
    }

    if !settings.outgoing_interfaces.is_empty() {
        // Comma-separated list; tracker traffic binds the first entry.
        let first = settings
            .outgoing_interfaces
            .split(',')
            .next()
            .unwrap_or("")
            .trim();
        if !first.is_empty() {
            easy.interface(first)?;
        }
    }

    proxy(easy, settings)?;
    Ok(())
}

fn proxy(easy: &mut Easy2<Collector>, settings: &Settings) -> Result<(), curl::Error> {
    static FORCE_PROXY_WARN: Once = Once::new();

    if !settings.proxy_enabled() {
        return Ok(());
    }

    easy.proxy(&settings.proxy_hostname)?;
    easy.proxy_port(settings.proxy_port)?;

    // SOCKS kinds hand the hostname to the proxy so tracker names never hit
    // the local resolver (subject to `proxy_hostnames`).
    let kind = match settings.proxy_kind {
        ProxyKind::None => return Ok(()),
        ProxyKind::Socks4 => ProxyType::Socks4a,
        ProxyKind::Socks5 | ProxyKind::Socks5Pw => {
            if settings.proxy_hostnames {
                ProxyType::Socks5Hostname
            } else {
                ProxyType::Socks5
            }
        }
        ProxyKind::Http | ProxyKind::HttpPw => ProxyType::Http,
    };
    easy.proxy_type(kind)?;

    if settings.proxy_kind.requires_auth() && !settings.proxy_username.is_empty() {
        // Credentials go through the dedicated options, never spliced into
        // the proxy URL; libcurl copies them, so the temporaries are wiped
        // as soon as the options are set.
        let mut username = settings.proxy_username.clone();
        let mut password = settings.proxy_password.clone();
        let mut result = easy.proxy_username(&username);
        if result.is_ok() {
            result = easy.proxy_password(&password);
        }
        scrub(&mut username);
        scrub(&mut password);
        result?;

        if settings.proxy_kind == ProxyKind::HttpPw {
            // Challenge-response schemes only; basic would put the password
            // on the wire.
            let mut auth = Auth::new();
            auth.digest(true).gssnegotiate(true).ntlm(true);
            easy.proxy_auth(&auth)?;
        }
    }

    if settings.proxy_force_internal_addresses {
        // Clearing the bypass list sends even loopback and RFC 1918 targets
        // through the proxy.
        easy.noproxy("")?;
        FORCE_PROXY_WARN.call_once(|| {
            warn!(
                "proxying ALL tracker connections, including internal addresses \
                 (proxy_force_internal_addresses is set)"
            );
        });
    }
    Ok(())
}

/// Overwrites a secret in place before it is dropped.
fn scrub(secret: &mut String) {
    let mut bytes = std::mem::take(secret).into_bytes();
    for b in &mut bytes {
        *b = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_wipes_in_place() {
        let mut secret = String::from("hunter2");
        scrub(&mut secret);
        assert!(secret.is_empty());
    }

    #[test]
    fn clear_request_state_round_trips() {
        let mut easy = Easy2::new(Collector::new());
        // Dirty the handle the way a previous request might have.
        let mut headers = List::new();
        headers.append("X-Str: 1").unwrap();
        easy.http_headers(headers).unwrap();
        easy.custom_request("DELETE").unwrap();
        easy.post(true).unwrap();

        clear_request_state(&mut easy).unwrap();
    }
}
