use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FrameHeader, FRAME_HEADER_LEN, HEARTBEAT_HANDLE, HEARTBEAT_PROCEDURE, WIRE_VERSION};
use crate::{
    error::{Error, Result},
    table::{put_bytes, read_exact, read_string, read_u8, Value},
};

/// A stored-procedure invocation.
///
/// The caller chooses the client handle; it must be unique among the caller's
/// in-flight invocations and is echoed back on the matching [`Response`].
/// [`HEARTBEAT_HANDLE`] (`i64::MAX`) is reserved for the transport's internal
/// heartbeats.
///
/// [`Response`]: crate::Response
#[derive(Clone, Debug)]
pub struct Invocation {
    procedure: String,
    client_handle: i64,
    params: Vec<Value>,
}

impl Invocation {
    /// Creates an invocation of `procedure` with the given parameters,
    /// correlated by `client_handle`.
    pub fn new(client_handle: i64, procedure: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            procedure: procedure.into(),
            client_handle,
            params,
        }
    }

    pub(crate) fn heartbeat() -> Self {
        Self::new(HEARTBEAT_HANDLE, HEARTBEAT_PROCEDURE, Vec::new())
    }

    /// The procedure name.
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// The caller-chosen correlation handle.
    pub fn client_handle(&self) -> i64 {
        self.client_handle
    }

    /// The invocation's parameters.
    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// Serializes an invocation into a length-prefixed frame.
pub fn encode(invocation: &Invocation) -> Result<Bytes> {
    let param_count = u16::try_from(invocation.params.len()).map_err(|_| {
        Error::from(crate::error::ErrorKind::Serialization {
            message: format!(
                "invocation of {} carries {} parameters, over the u16 limit",
                invocation.procedure,
                invocation.params.len()
            ),
        })
    })?;

    let mut body = BytesMut::with_capacity(64 + invocation.procedure.len());
    body.put_u8(WIRE_VERSION);
    put_bytes(&mut body, invocation.procedure.as_bytes());
    body.put_i64(invocation.client_handle);
    body.put_u16(param_count);
    for param in &invocation.params {
        param.write_to(&mut body);
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    FrameHeader::for_body(body.len())?.write_to(&mut frame);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Deserializes an invocation body (the frame minus its length prefix).
pub fn decode(mut body: Bytes) -> Result<Invocation> {
    let version = read_u8(&mut body)?;
    if version != WIRE_VERSION {
        return Err(Error::invalid_response(format!(
            "unsupported wire version: {}",
            version
        )));
    }
    let procedure = read_string(&mut body)?;
    let client_handle = read_exact(&mut body, 8)?.get_i64();
    let param_count = read_exact(&mut body, 2)?.get_u16() as usize;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        params.push(Value::read_from(&mut body)?);
    }
    if body.has_remaining() {
        return Err(Error::invalid_response(format!(
            "{} trailing bytes after invocation body",
            body.remaining()
        )));
    }
    Ok(Invocation {
        procedure,
        client_handle,
        params,
    })
}
