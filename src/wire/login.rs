use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{FrameHeader, FRAME_HEADER_LEN, WIRE_VERSION};
use crate::{
    error::{Error, Result},
    table::{put_bytes, read_exact, read_string, read_u8},
};

const LOGIN_SERVICE: &str = "database";

/// The identity of the cluster a pool is bound to: the cluster's start
/// timestamp and the address of the node that was leader at startup.
///
/// Captured from the first successful login; every later connection must
/// present the same pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterIdentity {
    /// Milliseconds since the epoch at which the cluster started.
    pub timestamp: i64,
    /// Packed address of the cluster's startup leader.
    pub leader_address: i32,
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:#x})", self.timestamp, self.leader_address)
    }
}

/// The credentials presented during the login handshake.
#[derive(Clone, Debug)]
pub(crate) struct LoginRequest {
    pub(crate) username: String,
    pub(crate) password_hash: [u8; 32],
}

impl LoginRequest {
    pub(crate) fn new(username: impl Into<String>, password_hash: [u8; 32]) -> Self {
        Self {
            username: username.into(),
            password_hash,
        }
    }

    /// Serializes the login request into a length-prefixed frame.
    pub(crate) fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64 + self.username.len());
        body.put_u8(WIRE_VERSION);
        put_bytes(&mut body, LOGIN_SERVICE.as_bytes());
        put_bytes(&mut body, self.username.as_bytes());
        body.put_slice(&self.password_hash);

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        FrameHeader::for_body(body.len())?.write_to(&mut frame);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Deserializes a login request body. Used by test fixtures standing in
    /// for a server.
    #[cfg(test)]
    pub(crate) fn decode(mut body: Bytes) -> Result<Self> {
        let version = read_u8(&mut body)?;
        if version != WIRE_VERSION {
            return Err(Error::invalid_response(format!(
                "unsupported wire version: {}",
                version
            )));
        }
        let service = read_string(&mut body)?;
        if service != LOGIN_SERVICE {
            return Err(Error::invalid_response(format!(
                "unexpected login service: {}",
                service
            )));
        }
        let username = read_string(&mut body)?;
        let mut password_hash = [0u8; 32];
        read_exact(&mut body, 32)?.copy_to_slice(&mut password_hash);
        Ok(Self {
            username,
            password_hash,
        })
    }
}

/// What the server reports on a successful login.
#[derive(Clone, Debug)]
pub(crate) struct ConnectInfo {
    pub(crate) host_id: i32,
    pub(crate) connection_id: i64,
    pub(crate) cluster: ClusterIdentity,
    pub(crate) build_string: String,
}

impl ConnectInfo {
    /// Serializes a login response frame. Used by test fixtures standing in
    /// for a server.
    #[cfg(test)]
    pub(crate) fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64 + self.build_string.len());
        body.put_u8(WIRE_VERSION);
        body.put_i8(0);
        body.put_i32(self.host_id);
        body.put_i64(self.connection_id);
        body.put_i64(self.cluster.timestamp);
        body.put_i32(self.cluster.leader_address);
        put_bytes(&mut body, self.build_string.as_bytes());

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        FrameHeader::for_body(body.len())?.write_to(&mut frame);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Deserializes a login response body, surfacing server-side rejections
    /// as authentication errors.
    pub(crate) fn decode(mut body: Bytes) -> Result<Self> {
        let version = read_u8(&mut body)?;
        if version != WIRE_VERSION {
            return Err(Error::invalid_response(format!(
                "unsupported wire version: {}",
                version
            )));
        }
        let code = read_exact(&mut body, 1)?.get_i8();
        if code != 0 {
            let reason = match code {
                1 => "too many connections".to_string(),
                2 => "credentials rejected".to_string(),
                other => format!("login rejected with code {}", other),
            };
            return Err(Error::authentication_error(reason));
        }
        let host_id = read_exact(&mut body, 4)?.get_i32();
        let connection_id = read_exact(&mut body, 8)?.get_i64();
        let timestamp = read_exact(&mut body, 8)?.get_i64();
        let leader_address = read_exact(&mut body, 4)?.get_i32();
        let build_string = read_string(&mut body)?;
        Ok(Self {
            host_id,
            connection_id,
            cluster: ClusterIdentity {
                timestamp,
                leader_address,
            },
            build_string,
        })
    }
}
