//! The wire frame codec.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by a
//! body. The codec here is pure and synchronous; de-framing of inbound bytes
//! happens in the reactor before a body is handed to a connection.

pub(crate) mod header;
pub(crate) mod invocation;
pub(crate) mod login;
pub(crate) mod response;

pub(crate) use self::header::{FrameHeader, FRAME_HEADER_LEN};
pub use self::invocation::{
    decode as decode_invocation,
    encode as encode_invocation,
    Invocation,
};
pub(crate) use self::login::{ConnectInfo, LoginRequest};
pub use self::login::ClusterIdentity;
pub use self::response::{Response, ResponseStatus};

use sha2::{Digest, Sha256};

/// The client handle reserved for internal heartbeats. Invocations queued
/// with this handle are rejected.
pub const HEARTBEAT_HANDLE: i64 = i64::MAX;

/// The internal no-op procedure invoked to confirm liveness on an idle
/// connection.
pub const HEARTBEAT_PROCEDURE: &str = "@Ping";

pub(crate) const WIRE_VERSION: u8 = 1;

/// Digests a cleartext password into the form
/// [`Distributor::create_connection`](crate::Distributor::create_connection)
/// expects.
pub fn hash_password(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}
