//! HTTP/2 <https://httpwg.org/specs/rfc9113.html>
//! HTTP semantics <https://httpwg.org/specs/rfc9110.html>

mod server;
pub use server::*;

mod body;
pub use body::{H2Body, StreamIncomingError};

mod encode;
pub use encode::H2Encoder;

pub(crate) mod flow;
pub(crate) mod ping;
pub(crate) mod streams;
pub mod types;
