//! Error types delivered to tracker completion handlers.

use std::{error::Error as StdError, fmt};

/// A `Result` alias where the `Err` case is `curl_tracker::Error`.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while submitting or performing a tracker
/// request.
///
/// The error is opaque; inspect it through [`Error::kind`] or the `is_*`
/// predicates.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: ErrorKind,
    source: Option<BoxError>,
    url: Option<String>,
}

/// Classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The transfer timed out, or the request's deadline passed before the
    /// transfer (including any pending retries) could complete.
    TimedOut,
    /// The server answered with HTTP >= 400, or a generic transport failure
    /// occurred (connect failure, write error, oversized response, ...).
    HttpError,
    /// The tracker (or proxy) hostname did not resolve.
    InvalidHostname,
    /// TLS certificate verification failed.
    InvalidSslCert,
    /// The URL, or a redirect target, used a scheme other than HTTP(S).
    UnsupportedUrlProtocol,
    /// Allocation or handle creation failed.
    NoMemory,
    /// The request was abandoned because the manager is shutting down.
    SessionClosing,
    /// The request could not be constructed or the manager could not start.
    Builder,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error {
            inner: Box::new(Inner {
                kind,
                source: None,
                url: None,
            }),
        }
    }

    pub(crate) fn with_source<E: Into<BoxError>>(mut self, source: E) -> Error {
        self.inner.source = Some(source.into());
        self
    }

    pub(crate) fn with_url(mut self, url: impl Into<String>) -> Error {
        self.inner.url = Some(url.into());
        self
    }

    pub(crate) fn builder_msg<E: Into<BoxError>>(source: E) -> Error {
        Error::new(ErrorKind::Builder).with_source(source)
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    /// Returns the URL of the request this error relates to, if known.
    pub fn url(&self) -> Option<&str> {
        self.inner.url.as_deref()
    }

    /// Returns true if the request or its deadline timed out.
    pub fn is_timeout(&self) -> bool {
        self.inner.kind == ErrorKind::TimedOut
    }

    /// Returns true if the manager was shutting down.
    pub fn is_session_closing(&self) -> bool {
        self.inner.kind == ErrorKind::SessionClosing
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("curl_tracker::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref url) = self.inner.url {
            builder.field("url", url);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.inner.kind {
            ErrorKind::TimedOut => "tracker request timed out",
            ErrorKind::HttpError => "tracker HTTP request failed",
            ErrorKind::InvalidHostname => "tracker hostname could not be resolved",
            ErrorKind::InvalidSslCert => "tracker TLS certificate verification failed",
            ErrorKind::UnsupportedUrlProtocol => "unsupported URL protocol",
            ErrorKind::NoMemory => "out of memory while issuing tracker request",
            ErrorKind::SessionClosing => "session is closing",
            ErrorKind::Builder => "tracker request could not be constructed",
        };
        f.write_str(msg)?;
        if let Some(ref url) = self.inner.url {
            write!(f, " for url ({url})")?;
        }
        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

// Short-hand constructors used throughout the worker.

pub(crate) fn timed_out() -> Error {
    Error::new(ErrorKind::TimedOut)
}

pub(crate) fn session_closing() -> Error {
    Error::new(ErrorKind::SessionClosing)
}

pub(crate) fn no_memory() -> Error {
    Error::new(ErrorKind::NoMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn error_is_send_and_sync() {
        assert_send_sync::<Error>();
    }

    #[test]
    fn display_includes_url_and_source() {
        let err = Error::new(ErrorKind::HttpError)
            .with_url("http://tracker.example.com/announce")
            .with_source("server returned HTTP 503");
        let rendered = err.to_string();
        assert!(rendered.contains("tracker.example.com"));
        assert!(rendered.contains("503"));
    }

    #[test]
    fn kind_accessors() {
        assert!(timed_out().is_timeout());
        assert!(session_closing().is_session_closing());
        assert_eq!(no_memory().kind(), ErrorKind::NoMemory);
    }
}
