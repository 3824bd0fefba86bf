use std::io;

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// The variants group into the categories a caller can act on: protocol
/// violations (the connection is discarded), transport failures (possibly
/// retried internally), cache read failures (degrade to a cache miss) and
/// hard limits such as the redirect ceiling.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad uri: {0}")]
    BadUri(String),

    #[error("bad header: {0}")]
    BadHeader(String),

    #[error("http parse fail: {0}")]
    HttpParseFail(String),

    #[error("response missing status line")]
    MissingStatusLine,

    #[error("response has invalid status")]
    ResponseInvalidStatus,

    #[error("content-length header not a number")]
    BadContentLengthHeader,

    #[error("chunk length is not ascii")]
    ChunkLenNotAscii,

    #[error("chunk length cannot be read as a number")]
    ChunkLenNotANumber,

    #[error("chunk expected crlf as next character")]
    ChunkExpectedCrLf,

    #[error("attempt to stream body after sending finish")]
    BodyContentAfterFinish,

    #[error("attempt to write larger body than content-length")]
    BodyLargerThanContentLength,

    #[error("request is not finished")]
    UnfinishedRequest,

    #[error("premature end of response body")]
    PrematureEndOfBody,

    #[error("redirect response without location header")]
    NoLocationHeader,

    #[error("bad location header: {0}")]
    BadLocationHeader(String),

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("request body was streamed and cannot be replayed")]
    UnretryableBody,

    #[error("connect to {0} failed: {1}")]
    ConnectFailed(String, String),

    #[error("cache entry unreadable: {0}")]
    CacheRead(String),

    #[error("cache write refused: {0}")]
    CacheWrite(String),

    #[error("transport: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Tell whether this error is an expired connect/read timeout.
    ///
    /// Timeouts are delegated to the underlying transport. They surface
    /// here as io errors, distinguishable so the caller can decide
    /// whether to retry.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Tell whether the transport failed in a way that permits an
    /// internal retry on a fresh connection.
    pub(crate) fn is_retryable_transport(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            Error::PrematureEndOfBody => true,
            _ => false,
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        Error::HttpParseFail(value.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_is_distinguishable() {
        let e = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(e.is_timeout());

        let e = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(!e.is_timeout());
        assert!(e.is_retryable_transport());
    }

    #[test]
    fn redirect_ceiling_is_not_io() {
        assert!(!Error::TooManyRedirects.is_timeout());
        assert!(!Error::TooManyRedirects.is_retryable_transport());
    }
}
