//! Wrapper for libcurl's share interface.
//!
//! A single share handle holds the DNS cache and the TLS session cache for
//! every easy handle the worker drives. Repeated lookups of the same tracker
//! host become sub-millisecond and TLS handshakes to the same endpoint
//! resume their session tickets.
//!
//! The safe `curl` crate does not bind `curl_share_*`, so this goes through
//! `curl-sys` directly. No lock callbacks are installed: the share handle
//! and every easy handle attached to it live on the worker thread only,
//! which is the configuration libcurl documents as not needing locks.

use curl::easy::Easy2;

/// RAII handle for a `CURLSH` with DNS and TLS-session sharing enabled.
pub(crate) struct ShareHandle {
    raw: *mut curl_sys::CURLSH,
}

impl ShareHandle {
    pub(crate) fn new() -> crate::Result<ShareHandle> {
        // SAFETY: curl_share_init has no preconditions beyond global curl
        // init, which the manager performs before the worker starts.
        let raw = unsafe { curl_sys::curl_share_init() };
        if raw.is_null() {
            return Err(crate::error::no_memory().with_source("curl_share_init returned NULL"));
        }
        let share = ShareHandle { raw };
        for data in [
            curl_sys::CURL_LOCK_DATA_DNS,
            curl_sys::CURL_LOCK_DATA_SSL_SESSION,
        ] {
            // SAFETY: `raw` is a live share handle owned by `share`.
            let rc =
                unsafe { curl_sys::curl_share_setopt(share.raw, curl_sys::CURLSHOPT_SHARE, data) };
            if rc != curl_sys::CURLSHE_OK {
                return Err(crate::error::no_memory().with_source("curl_share_setopt failed"));
            }
        }
        Ok(share)
    }

    /// Attaches an easy handle to this share. Session-level: survives handle
    /// pooling and reuse.
    pub(crate) fn attach<H>(&self, easy: &Easy2<H>) -> Result<(), curl::Error> {
        // SAFETY: both handles are live; CURLOPT_SHARE takes a CURLSH*. The
        // share handle outlives every attached easy handle (the worker drops
        // its pool and multi before the share).
        unsafe {
            raw::setopt_ptr(
                easy.raw(),
                curl_sys::CURLOPT_SHARE,
                self.raw as *const std::os::raw::c_char,
            )
        }
    }
}

impl Drop for ShareHandle {
    fn drop(&mut self) {
        // SAFETY: `raw` is owned and not attached to any live easy handle by
        // the time the worker tears down.
        unsafe {
            curl_sys::curl_share_cleanup(self.raw);
        }
    }
}

/// Raw `curl_easy_setopt` shims for options the safe wrapper does not
/// expose. Kept in one place so every unsafe option write shares the same
/// error mapping.
pub(crate) mod raw {
    use std::os::raw::{c_char, c_long};

    /// # Safety
    /// `easy` must be a live easy handle and `opt` an object-pointer option
    /// accepting `val` (which may be NULL to clear the option).
    pub(crate) unsafe fn setopt_ptr(
        easy: *mut curl_sys::CURL,
        opt: curl_sys::CURLoption,
        val: *const c_char,
    ) -> Result<(), curl::Error> {
        let rc = unsafe { curl_sys::curl_easy_setopt(easy, opt, val) };
        cvt(rc)
    }

    /// # Safety
    /// `easy` must be a live easy handle and `opt` a long option.
    pub(crate) unsafe fn setopt_long(
        easy: *mut curl_sys::CURL,
        opt: curl_sys::CURLoption,
        val: c_long,
    ) -> Result<(), curl::Error> {
        let rc = unsafe { curl_sys::curl_easy_setopt(easy, opt, val) };
        cvt(rc)
    }

    fn cvt(rc: curl_sys::CURLcode) -> Result<(), curl::Error> {
        if rc == curl_sys::CURLE_OK {
            Ok(())
        } else {
            Err(curl::Error::new(rc))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_attach() {
        curl::init();
        let share = ShareHandle::new().unwrap();
        let easy = Easy2::new(crate::handle::Collector::new());
        share.attach(&easy).unwrap();
    }
}
