//! Frame boundaries on the wire.
//!
//! ```text
//! [version:1][type:1][id_len:1][id:id_len][data_len:4][timestamp:4][data:data_len]
//! ```
//!
//! Lengths and the timestamp are big-endian. Only boundaries are parsed
//! here; the payload is opaque. A frame that cannot be delimited is a
//! protocol error for the channel it arrived on.

use crate::error::{MeshError, MeshResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire version this build speaks
pub const FRAME_VERSION: u8 = 1;

/// Largest payload accepted in one frame
pub const MAX_FRAME_DATA: usize = 1024 * 1024;

/// Application data
pub const FRAME_TYPE_DATA: u8 = 0x01;
/// Health probe
pub const FRAME_TYPE_PROBE: u8 = 0x02;
/// Probe answer
pub const FRAME_TYPE_PROBE_ACK: u8 = 0x03;

const FIXED_LEN: usize = 1 + 1 + 1 + 4 + 4;

/// Parsed frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Wire version
    pub version: u8,
    /// Frame type, opaque to the core apart from probes
    pub frame_type: u8,
    /// Message id
    pub id: Bytes,
    /// Payload length
    pub data_len: u32,
    /// Sender timestamp (seconds, wrapping)
    pub timestamp: u32,
}

/// One delimited frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header fields
    pub header: FrameHeader,
    /// Opaque payload
    pub data: Bytes,
}

impl Frame {
    /// Bytes the frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        self.header.header_len() + self.data.len()
    }
}

fn malformed(reason: impl Into<String>) -> MeshError {
    MeshError::MalformedFrame(reason.into())
}

impl FrameHeader {
    /// Header for a frame carrying `data_len` bytes
    pub fn new(frame_type: u8, id: impl Into<Bytes>, data_len: u32, timestamp: u32) -> Self {
        Self {
            version: FRAME_VERSION,
            frame_type,
            id: id.into(),
            data_len,
            timestamp,
        }
    }

    /// Encoded header size
    pub fn header_len(&self) -> usize {
        FIXED_LEN + self.id.len()
    }

    /// Parse a header from the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn parse(buf: &[u8]) -> MeshResult<Option<FrameHeader>> {
        if buf.len() < 3 {
            return Ok(None);
        }
        let version = buf[0];
        if version != FRAME_VERSION {
            return Err(malformed(format!("unsupported frame version {version}")));
        }
        let frame_type = buf[1];
        let id_len = buf[2] as usize;
        if buf.len() < FIXED_LEN + id_len {
            return Ok(None);
        }

        let mut rest = &buf[3..];
        let id = Bytes::copy_from_slice(&rest[..id_len]);
        rest.advance(id_len);
        let data_len = rest.get_u32();
        let timestamp = rest.get_u32();

        if data_len as usize > MAX_FRAME_DATA {
            return Err(malformed(format!("frame data length {data_len} exceeds limit")));
        }

        Ok(Some(FrameHeader {
            version,
            frame_type,
            id,
            data_len,
            timestamp,
        }))
    }

    /// Encode the header followed by `data`
    pub fn encode(&self, data: &[u8]) -> MeshResult<Bytes> {
        if self.id.len() > u8::MAX as usize {
            return Err(malformed(format!("frame id of {} bytes is too long", self.id.len())));
        }
        if data.len() != self.data_len as usize {
            return Err(malformed(format!(
                "declared data length {} does not match {} bytes",
                self.data_len,
                data.len()
            )));
        }

        let mut out = BytesMut::with_capacity(self.header_len() + data.len());
        out.put_u8(self.version);
        out.put_u8(self.frame_type);
        out.put_u8(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_u32(self.data_len);
        out.put_u32(self.timestamp);
        out.put_slice(data);
        Ok(out.freeze())
    }
}

/// Encode an empty probe frame
pub fn encode_probe(id: &str, timestamp: u32) -> MeshResult<Bytes> {
    FrameHeader::new(FRAME_TYPE_PROBE, Bytes::copy_from_slice(id.as_bytes()), 0, timestamp).encode(&[])
}

/// Remove every complete frame from the front of `buf`.
///
/// A trailing partial frame stays in `buf` for the next read.
pub fn split_frames(buf: &mut BytesMut) -> MeshResult<Vec<Frame>> {
    let mut frames = Vec::new();
    while let Some(header) = FrameHeader::parse(buf)? {
        let total = header.header_len() + header.data_len as usize;
        if buf.len() < total {
            break;
        }
        let mut raw = buf.split_to(total);
        raw.advance(header.header_len());
        frames.push(Frame {
            header,
            data: raw.freeze(),
        });
    }
    Ok(frames)
}
