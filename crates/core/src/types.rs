//! Core types shared by every Lifeline crate

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a remote peer in the mesh
pub type PeerId = String;

/// Milliseconds on the core's monotonic timeline
pub type TimestampMs = u64;

/// Network layers that report state to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Radios and links (Bluetooth, Wi-Fi peer-to-peer)
    Physical,
    /// Peer channels managed by the pool
    Mesh,
    /// Application sessions on top of the mesh
    Application,
}

impl Layer {
    /// All layers in join order
    pub const ALL: [Layer; 3] = [Layer::Physical, Layer::Mesh, Layer::Application];
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::Physical => "physical",
            Layer::Mesh => "mesh",
            Layer::Application => "application",
        };
        f.write_str(name)
    }
}

/// Get current wall-clock timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_display() {
        assert_eq!(Layer::Physical.to_string(), "physical");
        assert_eq!(Layer::ALL.len(), 3);
    }

    #[test]
    fn test_layer_serde_snake_case() {
        let json = serde_json::to_string(&Layer::Application).unwrap();
        assert_eq!(json, "\"application\"");
    }
}
