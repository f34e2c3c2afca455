//! SceneSync Core - Event-Sourced Scene Synchronization
//!
//! This library lets several participants share one mutable scene by
//! exchanging typed events, and lets any participant capture its scene as a
//! minimal set of events that rebuilds it exactly:
//! 1. **Event Bus**: synchronous, ordered pub/sub keyed by event kind
//! 2. **Scene Info**: append-only content log plus last-write-wins view state,
//!    with snapshot and replay
//! 3. **Recording**: timestamped log of every event with atomic flush
//! 4. **Pose Ownership**: one authority per entity, interpolation on receipt,
//!    and echo suppression so peers never republish each other's changes
//!
//! The [`scene_session`] module wires these together for one participant.

pub mod annotation;
pub mod codec;
pub mod event_bus;
pub mod events;
pub mod ownership;
pub mod pose;
pub mod scene_graph;
pub mod scene_info;
pub mod scene_recording;
pub mod scene_session;
pub mod schedule;
pub mod session;
pub mod synced_entity;

// Re-export key types for convenience
pub use annotation::{Annotation, ModelManifest};
pub use codec::CodecError;
pub use event_bus::{BusError, EventBus, HandlerId};
pub use events::{Event, EventGroup, EventKind};
pub use ownership::{EntityId, OwnershipRegistry};
pub use pose::{Pose, PoseTransition};
pub use scene_graph::{canonical_address, NodeKey, SceneError, SceneGraph};
pub use scene_info::{DisplayState, SceneInfo, SnapshotSource};
pub use scene_recording::{
    read_json_lines, JsonLinesSink, RecordingEntry, RecordingError, RecordingPlayer,
    RecordingSink, SceneRecording,
};
pub use scene_session::SceneSession;
pub use schedule::{CancellationToken, RepeatingTask};
pub use session::{SessionContext, SyncConfig, UserInfo};
pub use synced_entity::{PoseReceipt, SyncedEntity};

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a handler panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
