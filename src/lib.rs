//! Server-side HTTP/2 connection handling.
//!
//! This crate owns the lifecycle of a single HTTP/2 connection over an
//! already-established duplex byte stream: it reads frames, multiplexes
//! request/response streams, applies connection- and stream-level flow
//! control (with weighted allocation along the RFC 7540 priority tree),
//! and hands completed requests to a [ServerDriver] for processing.
//!
//! HPACK and frame payload parsing are consumed from `loona-hpack` and
//! `loona-h2`; TLS/ALPN and the HTTP/1.1 upgrade mechanics live upstream
//! of this crate (only the post-upgrade handoff is modeled, see
//! [h2::serve_h2c_upgrade]).

use std::error::Error as StdError;

mod types;
mod util;

pub use types::*;

pub mod h2;

mod responder;
pub use responder::*;

pub use buffet;

/// re-exported so consumers can use whatever forked version we use
pub use http;

pub mod error;

#[allow(async_fn_in_trait)] // we never require Send
pub trait ServerDriver<OurEncoder>
where
    OurEncoder: Encoder,
{
    type Error: AsRef<dyn StdError>;

    async fn handle(
        &self,
        req: Request,
        req_body: &mut impl Body,
        respond: Responder<OurEncoder, ExpectResponseHeaders>,
    ) -> Result<Responder<OurEncoder, ResponseDone>, Self::Error>;
}
