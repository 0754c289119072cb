//! Per-peer reassembly of inbound frames

use bytes::{Bytes, BytesMut};
use lifeline_core::PeerId;
use lifeline_mesh::{split_frames, Frame, MeshResult};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A data frame delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Sending peer
    pub peer_id: PeerId,
    /// The complete frame
    pub frame: Frame,
}

/// Frame reassembly buffers keyed by peer
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffers: Mutex<HashMap<PeerId, BytesMut>>,
}

impl FrameAssembler {
    /// Append `bytes` from `peer_id` and return every complete frame.
    ///
    /// A malformed stream drops the peer's buffer.
    pub fn push(&self, peer_id: &str, bytes: &Bytes) -> MeshResult<Vec<Frame>> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(peer_id.to_string()).or_default();
        buffer.extend_from_slice(bytes);
        match split_frames(buffer) {
            Ok(frames) => {
                if buffer.is_empty() {
                    buffers.remove(peer_id);
                }
                Ok(frames)
            }
            Err(e) => {
                buffers.remove(peer_id);
                Err(e)
            }
        }
    }

    /// Drop a peer's partial frame
    pub fn forget(&self, peer_id: &str) {
        self.buffers.lock().remove(peer_id);
    }

    /// Drop every partial frame
    pub fn clear(&self) {
        self.buffers.lock().clear();
    }

    /// Bytes held in partial frames
    pub fn buffered(&self) -> usize {
        self.buffers.lock().values().map(BytesMut::len).sum()
    }
}
