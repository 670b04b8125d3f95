use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FrameHeader, FRAME_HEADER_LEN, WIRE_VERSION};
use crate::{
    error::{Error, Result},
    table::{put_bytes, read_exact, read_u8, Table},
};

/// The disposition of a completed invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseStatus {
    /// The procedure committed.
    Success,
    /// The procedure aborted itself.
    UserAbort,
    /// The procedure rolled back in a controlled fashion.
    GracefulFailure,
    /// The procedure failed unexpectedly on the server.
    UnexpectedFailure,
    /// The connection carrying the invocation was lost before a response
    /// arrived. Synthesized by the transport.
    ConnectionLost,
    /// The cluster could not service the invocation.
    ServerUnavailable,
    /// The invocation went unanswered past the configured procedure-call
    /// timeout. Synthesized by the transport.
    ConnectionTimeout,
}

impl ResponseStatus {
    pub(crate) fn code(self) -> i8 {
        match self {
            ResponseStatus::Success => 1,
            ResponseStatus::UserAbort => -1,
            ResponseStatus::GracefulFailure => -2,
            ResponseStatus::UnexpectedFailure => -3,
            ResponseStatus::ConnectionLost => -4,
            ResponseStatus::ServerUnavailable => -5,
            ResponseStatus::ConnectionTimeout => -6,
        }
    }

    pub(crate) fn from_code(code: i8) -> Result<Self> {
        Ok(match code {
            1 => ResponseStatus::Success,
            -1 => ResponseStatus::UserAbort,
            -2 => ResponseStatus::GracefulFailure,
            -3 => ResponseStatus::UnexpectedFailure,
            -4 => ResponseStatus::ConnectionLost,
            -5 => ResponseStatus::ServerUnavailable,
            -6 => ResponseStatus::ConnectionTimeout,
            other => {
                return Err(Error::invalid_response(format!(
                    "invalid response status code: {}",
                    other
                )))
            }
        })
    }

    /// Whether this status represents a deliberate abort rather than an
    /// error.
    pub fn is_abort(self) -> bool {
        matches!(
            self,
            ResponseStatus::UserAbort | ResponseStatus::GracefulFailure
        )
    }
}

/// The response to a stored-procedure invocation.
///
/// Responses are produced by the cluster, except for the
/// [`ConnectionLost`](ResponseStatus::ConnectionLost) and
/// [`ConnectionTimeout`](ResponseStatus::ConnectionTimeout) statuses, which
/// the transport synthesizes.
#[derive(Clone, Debug)]
pub struct Response {
    client_handle: i64,
    status: ResponseStatus,
    status_string: Option<String>,
    cluster_rtt: Duration,
    client_rtt: Duration,
    tables: Vec<Table>,
}

impl Response {
    /// Constructs a response as the cluster would. The client round trip is
    /// stamped by the transport on delivery.
    pub(crate) fn server(
        client_handle: i64,
        status: ResponseStatus,
        status_string: Option<String>,
        cluster_rtt: Duration,
        tables: Vec<Table>,
    ) -> Self {
        Self {
            client_handle,
            status,
            status_string,
            cluster_rtt,
            client_rtt: Duration::ZERO,
            tables,
        }
    }

    /// Constructs a transport-synthesized response; both round trips are set
    /// to the observed elapsed time.
    pub(crate) fn synthesized(
        client_handle: i64,
        status: ResponseStatus,
        status_string: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            client_handle,
            status,
            status_string: Some(status_string.into()),
            cluster_rtt: elapsed,
            client_rtt: elapsed,
            tables: Vec::new(),
        }
    }

    /// The handle of the invocation this response answers.
    pub fn client_handle(&self) -> i64 {
        self.client_handle
    }

    /// The response's status.
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// The optional human-readable status detail.
    pub fn status_string(&self) -> Option<&str> {
        self.status_string.as_deref()
    }

    /// Round trip as measured by the cluster.
    pub fn cluster_round_trip(&self) -> Duration {
        self.cluster_rtt
    }

    /// Round trip as observed by this client, from submission to response
    /// arrival. Stamped by the transport before delivery.
    pub fn client_round_trip(&self) -> Duration {
        self.client_rtt
    }

    /// Result tables, in the order the procedure produced them.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub(crate) fn set_client_round_trip(&mut self, elapsed: Duration) {
        self.client_rtt = elapsed;
    }

    /// Serializes the response into a length-prefixed frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(WIRE_VERSION);
        body.put_i64(self.client_handle);
        body.put_i8(self.status.code());
        match &self.status_string {
            Some(s) => put_bytes(&mut body, s.as_bytes()),
            None => body.put_i32(-1),
        }
        let rtt_ms = i32::try_from(self.cluster_rtt.as_millis()).unwrap_or(i32::MAX);
        body.put_i32(rtt_ms);
        let table_count = u16::try_from(self.tables.len())
            .map_err(|_| Error::invalid_argument("too many result tables"))?;
        body.put_u16(table_count);
        for table in &self.tables {
            table.write_to(&mut body)?;
        }

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        FrameHeader::for_body(body.len())?.write_to(&mut frame);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Deserializes a response body (the frame minus its length prefix).
    pub fn decode(mut body: Bytes) -> Result<Self> {
        let version = read_u8(&mut body)?;
        if version != WIRE_VERSION {
            return Err(Error::invalid_response(format!(
                "unsupported wire version: {}",
                version
            )));
        }
        let client_handle = read_exact(&mut body, 8)?.get_i64();
        let status = ResponseStatus::from_code(read_exact(&mut body, 1)?.get_i8())?;
        let marker = read_exact(&mut body, 4)?.get_i32();
        let status_string = if marker < 0 {
            None
        } else {
            let len = marker as usize;
            if body.remaining() < len {
                return Err(Error::invalid_response("unexpected end of frame"));
            }
            let mut bytes = vec![0u8; len];
            body.copy_to_slice(&mut bytes);
            Some(String::from_utf8(bytes).map_err(|e| {
                Error::invalid_response(format!("invalid utf-8 in status string: {}", e))
            })?)
        };
        let rtt_ms = read_exact(&mut body, 4)?.get_i32();
        let cluster_rtt = Duration::from_millis(u64::try_from(rtt_ms).unwrap_or(0));
        let table_count = read_exact(&mut body, 2)?.get_u16() as usize;
        let mut tables = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            tables.push(Table::read_from(&mut body)?);
        }
        if body.has_remaining() {
            return Err(Error::invalid_response(format!(
                "{} trailing bytes after response body",
                body.remaining()
            )));
        }
        Ok(Self::server(
            client_handle,
            status,
            status_string,
            cluster_rtt,
            tables,
        ))
    }
}

#[cfg(test)]
impl Response {
    /// Test-only constructor for building responses delivered through mock
    /// reactors.
    pub(crate) fn test_success(client_handle: i64, cluster_rtt: Duration) -> Self {
        Self::server(client_handle, ResponseStatus::Success, None, cluster_rtt, Vec::new())
    }
}
