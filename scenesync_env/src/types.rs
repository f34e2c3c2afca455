//! Common types for the SceneSync environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the session that authored an event.
///
/// Live sessions use UUID v4 for global uniqueness without coordination.
/// [`SessionId::REPLAY`] (the nil UUID) is reserved for replayed and
/// recorded events and is never handed out to a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Sentinel origin carried by replay/playback events.
    pub const REPLAY: SessionId = SessionId(Uuid::nil());

    /// Creates a new random live SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a SessionId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic SessionId from a seed (for simulation).
    ///
    /// The high bit of the second half is always set so a seed of zero
    /// cannot collide with the replay sentinel.
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        let mixed = seed.wrapping_mul(0x517cc1b727220a95) | (1 << 63);
        bytes[8..16].copy_from_slice(&mixed.to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// True for the replay sentinel.
    pub fn is_replay(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_replay() {
            return write!(f, "replay");
        }
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Envelope for encoded events shipped between sessions.
///
/// This is a transport-layer wrapper; the payload is an encoded event that
/// the receiving session decodes and raises on its own bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    /// The raw encoded event bytes
    pub payload: Vec<u8>,

    /// Timestamp when the frame was created (sender's clock)
    pub timestamp_ms: u64,

    /// Optional routing hint for multi-hop delivery
    pub hop_count: u8,
}

impl EventFrame {
    /// Creates a new frame from payload bytes.
    pub fn new(payload: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            payload,
            timestamp_ms,
            hop_count: 0,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_sentinel_is_distinct() {
        assert!(SessionId::REPLAY.is_replay());
        assert!(!SessionId::new().is_replay());
        assert!(!SessionId::from_seed(0).is_replay());
        assert_ne!(SessionId::from_seed(0), SessionId::REPLAY);
    }

    #[test]
    fn test_seeded_ids_are_deterministic() {
        assert_eq!(SessionId::from_seed(7), SessionId::from_seed(7));
        assert_ne!(SessionId::from_seed(7), SessionId::from_seed(8));
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionId::REPLAY.to_string(), "replay");
        assert_eq!(SessionId::from_seed(3).to_string().len(), 8);
    }
}
