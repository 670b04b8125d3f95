use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Size of the length prefix carried by every frame.
pub(crate) const FRAME_HEADER_LEN: usize = std::mem::size_of::<u32>();

/// Upper bound on a single frame body. Anything larger is treated as a
/// corrupt stream.
pub(crate) const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// The length prefix for a wire frame, big-endian on the wire.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameHeader {
    pub(crate) length: u32,
}

impl FrameHeader {
    pub(crate) fn for_body(body_len: usize) -> Result<Self> {
        if body_len > MAX_FRAME_SIZE {
            return Err(Error::invalid_argument(format!(
                "frame body of {} bytes exceeds the {} byte frame limit",
                body_len, MAX_FRAME_SIZE
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            length: body_len as u32,
        })
    }

    pub(crate) fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.length);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn body_len(&self) -> usize {
        self.length as usize
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let length = reader.read_u32().await?;
        if length as usize > MAX_FRAME_SIZE {
            return Err(Error::invalid_response(format!(
                "peer announced a frame of {} bytes, over the {} byte frame limit",
                length, MAX_FRAME_SIZE
            )));
        }
        Ok(Self { length })
    }
}
