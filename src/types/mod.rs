use std::{
    convert::Infallible,
    fmt::{self, Debug},
};

use http::{StatusCode, Uri, Version};
use tracing::debug;

use buffet::Piece;

mod headers;
pub use headers::*;

mod method;
pub use method::*;

/// An HTTP request
#[derive(Clone)]
pub struct Request {
    pub method: Method,

    /// Requested entity
    pub uri: Uri,

    /// The HTTP version used
    pub version: Version,

    /// Request headers
    pub headers: Headers,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Get,
            uri: "/".parse().unwrap(),
            version: Version::HTTP_2,
            headers: Default::default(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .finish()?;

        for (name, value) in self.headers.iter() {
            debug!(%name, value = ?std::str::from_utf8(value), "header");
        }

        Ok(())
    }
}

/// An HTTP response
#[derive(Clone)]
pub struct Response {
    pub version: Version,

    /// Status code (1xx-5xx)
    pub status: StatusCode,

    /// Response headers
    pub headers: Headers,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            version: Version::HTTP_2,
            status: StatusCode::OK,
            headers: Default::default(),
        }
    }
}

impl Response {
    /// 204, 205 and 304 responses must not have a body
    pub fn means_empty_body(&self) -> bool {
        matches!(
            self.status,
            StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT | StatusCode::NOT_MODIFIED
        )
    }
}

/// A body chunk
pub enum BodyChunk {
    Chunk(Piece),

    /// The body finished, and it matched the announced content-length,
    /// or we were using a framed protocol
    Done {
        trailers: Option<Box<Headers>>,
    },
}

#[allow(async_fn_in_trait)] // we never require Send
pub trait Body: Debug
where
    Self: Sized,
{
    type Error: std::error::Error + 'static;

    fn content_len(&self) -> Option<u64>;
    fn eof(&self) -> bool;
    async fn next_chunk(&mut self) -> Result<BodyChunk, Self::Error>;
}

impl Body for () {
    type Error = Infallible;

    fn content_len(&self) -> Option<u64> {
        Some(0)
    }

    fn eof(&self) -> bool {
        true
    }

    async fn next_chunk(&mut self) -> Result<BodyChunk, Self::Error> {
        Ok(BodyChunk::Done { trailers: None })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The peer sent everything it had to send and the connection shut
    /// down cleanly (possibly after a GOAWAY round-trip)
    SuccessfulHttp2GracefulShutdown,

    /// Client didn't speak HTTP/2 (missing/invalid connection preface)
    ClientDidntSpeakHttp2,

    /// No frame arrived within the keep-alive timeout, the connection
    /// was closed by the read loop
    IdleTimeout,
}
