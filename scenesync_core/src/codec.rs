//! Payload codec.
//!
//! Event payloads are opaque strings to the bus, scene info and recording;
//! whoever raises or handles a kind uses these helpers to turn the payload
//! into a typed value and back.

use crate::events::Event;
use scenesync_env::EventFrame;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Missing payload")]
    MissingPayload,
}

/// Encodes `value` as a payload string.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a payload string.
pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::MissingPayload);
    }
    serde_json::from_str(payload).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Decodes an optional payload, treating `None` as an error.
pub fn decode_payload<T: DeserializeOwned>(payload: Option<&str>) -> Result<T, CodecError> {
    decode(payload.ok_or(CodecError::MissingPayload)?)
}

/// Wraps an event for a transport.
pub fn encode_frame(event: &Event, timestamp_ms: u64) -> Result<EventFrame, CodecError> {
    let bytes = serde_json::to_vec(event).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(EventFrame::new(bytes, timestamp_ms))
}

/// Unwraps a transport frame. A frame carrying JSON `null` decodes to
/// `None`; the bus rejects it when raised.
pub fn decode_frame(frame: &EventFrame) -> Result<Option<Event>, CodecError> {
    serde_json::from_slice(&frame.payload).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Pose;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_pose_survives_encoding_bit_for_bit() {
        let pose = Pose::new(
            Vector3::new(0.1, -2.5, 1.0e-7),
            Vector3::new(1.0, 3.0, 0.5),
            UnitQuaternion::from_euler_angles(0.3, -1.2, 2.9),
        );
        let text = encode(&pose).unwrap();
        let back: Pose = decode(&text).unwrap();
        assert_eq!(back, pose);
    }

    #[test]
    fn test_missing_and_garbage_payloads() {
        assert!(matches!(
            decode_payload::<Pose>(None),
            Err(CodecError::MissingPayload)
        ));
        assert!(matches!(decode::<Pose>(""), Err(CodecError::MissingPayload)));
        assert!(matches!(decode::<Pose>("{"), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_frames() {
        use crate::events::EventKind;
        use scenesync_env::SessionId;

        let event = Event::new(EventKind::LoadRequest, SessionId::from_seed(1)).at("Model");
        let frame = encode_frame(&event, 42).unwrap();
        assert_eq!(frame.timestamp_ms, 42);
        assert_eq!(decode_frame(&frame).unwrap(), Some(event));

        let null = EventFrame::new(b"null".to_vec(), 0);
        assert_eq!(decode_frame(&null).unwrap(), None);
    }
}
