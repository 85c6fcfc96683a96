//! The HTTP transport seam.
//!
//! The pipeline never talks to a socket itself; network workers call
//! [`Transport::perform`] and translate the returned status themselves
//! (including 3xx and 304, which a transport must surface rather than
//! follow). The bundled implementation is [`ReqwestTransport`].

use async_trait::async_trait;
use thiserror::Error;

use crate::request::Request;
use crate::response::Headers;

mod reqwest;

pub use self::reqwest::ReqwestTransport;

/// A raw HTTP exchange result: status line, headers and the drained body.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Failures below the HTTP layer. Anything that produced a status line is a
/// [`RawResponse`], not a `TransportError`.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The request URL could not be parsed.
    #[error("malformed url: {0}")]
    MalformedUrl(String),

    /// The exchange timed out after the connection was established.
    #[error("socket timeout")]
    SocketTimeout,

    /// Establishing the connection timed out.
    #[error("connect timeout")]
    ConnectTimeout,

    /// The connection could not be established; no status was obtained.
    #[error("connection failed: {0}")]
    NoConnection(String),

    /// I/O failed after the status line, e.g. while draining the body.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Performs a single HTTP exchange.
///
/// `extra_headers` carry per-attempt conditional headers (`If-None-Match`,
/// `If-Modified-Since`) and take precedence over the request's own headers.
/// Implementations read the attempt timeout from
/// [`Request::timeout`](crate::Request::timeout) and apply it to both
/// connecting and reading.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn perform(
        &self,
        request: &Request,
        extra_headers: &Headers,
    ) -> Result<RawResponse, TransportError>;
}
