//! FastCGI 1.0, as much of it as a serially-contacted responder needs: a pure
//! codec for the wire records and a blocking client that speaks them over a
//! Unix domain socket.

pub mod client;
pub mod proto;

pub use client::{Client, ShutdownHandle, TransportError};
pub use proto::{FcgiRequest, FcgiResponse, ProtocolError};
