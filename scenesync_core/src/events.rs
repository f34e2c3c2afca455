//! The event model: a typed, immutable record of something that happened to
//! the shared scene, plus the taxonomy that decides how it is persisted.
//!
//! Request/response pairs keep peers race-free: request events are what a
//! session records and replays, response events (`SceneModified`) are
//! re-derived by whoever applies the requests.

use crate::scene_graph::canonical_address;
use scenesync_env::SessionId;
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;

/// Every kind of event the bus carries.
///
/// Declaration order matters: view events stored for one address are
/// replayed in this order, so `AnnotationRequest` (which creates the
/// annotation node) comes before the visibility and pose of that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Unknown,

    /// Test traffic; arbitrary string payloads.
    Generic,

    NetworkError,
    NetworkPing,
    NetworkConnected,
    NetworkDisconnected,
    NetworkJoinedRoom,
    NetworkLeftRoom,
    NetworkOtherJoinedRoom,
    NetworkOtherLeftRoom,

    /// Add a model to the scene.
    LoadRequest,
    /// Draw an annotation on (or beside) a model.
    AnnotationRequest,
    /// Show (payload present) or hide (payload absent) a node.
    SetVisibilityRequest,

    /// Raised after a request has modified the scene.
    SceneModified,

    /// Ephemeral pointer/highlight indication.
    IndicationRequest,
    /// New local pose for a synchronized entity.
    Pose,

    /// Raised once a load request has been fully applied.
    LoadCompleted,
}

/// Semantic grouping of [`EventKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventGroup {
    /// Connection and room traffic; informational, never persisted.
    Lifecycle,
    /// Adds or removes persistent scene content.
    ContentRequest,
    /// Derived signals, re-derivable after replay; never persisted.
    Notification,
    /// Alters how existing content is displayed; latest value wins.
    ViewRequest,
}

impl EventKind {
    /// Returns the semantic group of this kind.
    pub fn group(&self) -> EventGroup {
        match self {
            EventKind::LoadRequest => EventGroup::ContentRequest,
            EventKind::AnnotationRequest
            | EventKind::SetVisibilityRequest
            | EventKind::IndicationRequest
            | EventKind::Pose => EventGroup::ViewRequest,
            EventKind::SceneModified | EventKind::LoadCompleted => EventGroup::Notification,
            EventKind::Unknown
            | EventKind::Generic
            | EventKind::NetworkError
            | EventKind::NetworkPing
            | EventKind::NetworkConnected
            | EventKind::NetworkDisconnected
            | EventKind::NetworkJoinedRoom
            | EventKind::NetworkLeftRoom
            | EventKind::NetworkOtherJoinedRoom
            | EventKind::NetworkOtherLeftRoom => EventGroup::Lifecycle,
        }
    }

    /// True for kinds kept in the append-only content log.
    ///
    /// Only `LoadRequest` today; annotations are kept as view state under
    /// their own address instead.
    pub fn is_persisted_content(&self) -> bool {
        matches!(self, EventKind::LoadRequest)
    }

    /// True for kinds tracked as latest-value-per-address.
    pub fn is_view(&self) -> bool {
        self.group() == EventGroup::ViewRequest
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An immutable event.
///
/// `origin` is always set: events built with [`Event::new`] carry the
/// raising session's id, and only replay paths override it with
/// [`SessionId::REPLAY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened
    pub kind: EventKind,

    /// Session that authored the event
    pub origin: SessionId,

    /// Root-relative target address, `None` for addressless events.
    /// Canonical (see [`canonical_address`]) when set through [`Event::at`]
    /// or decoded.
    #[serde(default, deserialize_with = "deserialize_address")]
    pub address: Option<String>,

    /// Opaque payload; format owned by whoever handles `kind`
    pub payload: Option<String>,
}

impl Event {
    /// Creates an addressless, payload-free event authored by `origin`.
    pub fn new(kind: EventKind, origin: SessionId) -> Self {
        Self {
            kind,
            origin,
            address: None,
            payload: None,
        }
    }

    /// Sets the target address, in canonical form.
    pub fn at(mut self, address: impl Into<String>) -> Self {
        let address = address.into();
        let canonical = match canonical_address(&address) {
            Cow::Owned(canonical) => Some(canonical),
            Cow::Borrowed(_) => None,
        };
        self.address = Some(canonical.unwrap_or(address));
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets or clears the payload.
    pub fn with_optional_payload(mut self, payload: Option<String>) -> Self {
        self.payload = payload;
        self
    }

    /// Copy of this event re-authored by the replay sentinel.
    pub fn as_replay(&self) -> Self {
        Self {
            origin: SessionId::REPLAY,
            ..self.clone()
        }
    }

    /// True if this event was authored by `session`.
    pub fn is_from(&self, session: SessionId) -> bool {
        self.origin == session
    }
}

fn deserialize_address<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.map(|a| canonical_address(&a).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert_eq!(EventKind::LoadRequest.group(), EventGroup::ContentRequest);
        assert_eq!(EventKind::SceneModified.group(), EventGroup::Notification);
        assert_eq!(EventKind::NetworkJoinedRoom.group(), EventGroup::Lifecycle);
        assert!(EventKind::Pose.is_view());
        assert!(EventKind::AnnotationRequest.is_view());
        assert!(!EventKind::SceneModified.is_view());
    }

    #[test]
    fn test_only_load_is_persisted_content() {
        assert!(EventKind::LoadRequest.is_persisted_content());
        assert!(!EventKind::AnnotationRequest.is_persisted_content());
        assert!(!EventKind::SetVisibilityRequest.is_persisted_content());
        assert!(!EventKind::SceneModified.is_persisted_content());
    }

    #[test]
    fn test_annotation_sorts_before_visibility_and_pose() {
        assert!(EventKind::AnnotationRequest < EventKind::SetVisibilityRequest);
        assert!(EventKind::SetVisibilityRequest < EventKind::Pose);
    }

    #[test]
    fn test_as_replay_keeps_everything_but_origin() {
        let session = SessionId::from_seed(1);
        let event = Event::new(EventKind::Pose, session)
            .at("Model/PageA")
            .with_payload("p");
        let replay = event.as_replay();

        assert!(event.is_from(session));
        assert_eq!(replay.origin, SessionId::REPLAY);
        assert_eq!(replay.address, event.address);
        assert_eq!(replay.payload, event.payload);
    }

    #[test]
    fn test_addresses_are_canonical() {
        let session = SessionId::from_seed(1);
        let event = Event::new(EventKind::Pose, session).at("/Model//PageA/");
        assert_eq!(event.address.as_deref(), Some("Model/PageA"));

        let raw = r#"{"kind":"Pose","origin":"00000000-0000-0000-0000-000000000001","address":"Model/","payload":null}"#;
        let decoded: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.address.as_deref(), Some("Model"));
    }
}
