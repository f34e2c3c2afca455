//! Scene info: the minimal event set that rebuilds a scene.
//!
//! Two stores with different retention rules:
//! - `content_events`: append-only, every persisted content request in the
//!   order it was recorded (duplicates allowed)
//! - `view_events`: one event per (address, kind), the latest one wins
//!
//! Replaying content first and then the view events through a bus rebuilds
//! the scene the events describe. Both maps are ordered so a replay always
//! produces the same sequence: addresses sort parents before children, and
//! kinds sort in declaration order, so an annotation is created before its
//! visibility or pose is applied.

use crate::codec::{self, CodecError};
use crate::event_bus::EventBus;
use crate::events::{Event, EventGroup, EventKind};
use crate::pose::Pose;
use crate::scene_graph::canonical_address;
use scenesync_env::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Payload of a visibility event that shows its node.
pub const VISIBLE: &str = "1";

/// Display state of one node, as read for a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayState {
    pub address: String,
    pub active: bool,
    pub pose: Pose,
}

/// Anything that can list the display state of the scene below an address.
pub trait SnapshotSource {
    /// Every synchronized entity under `root` (the empty address is the
    /// whole scene) plus every child of each entity's annotation container.
    fn display_states(&self, root: &str) -> Vec<DisplayState>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SceneInfo {
    content_events: Vec<Event>,
    view_events: BTreeMap<String, BTreeMap<EventKind, Event>>,
}

impl SceneInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event` if it is a persisted content request; ignores it
    /// otherwise.
    pub fn record_content(&mut self, event: &Event) {
        if event.kind.is_persisted_content() {
            let mut event = event.clone();
            if let Some(address) = &event.address {
                event.address = Some(canonical_address(address).into_owned());
            }
            self.content_events.push(event);
        }
    }

    /// Stores `event` as the latest of its kind at its address.
    pub fn record_view(&mut self, event: &Event) {
        let Some(address) = &event.address else {
            warn!(kind = %event.kind, "View event without an address, not recorded");
            return;
        };
        let address = canonical_address(address).into_owned();
        let mut event = event.clone();
        event.address = Some(address.clone());
        self.view_events
            .entry(address)
            .or_default()
            .insert(event.kind, event);
    }

    /// Routes `event` by its group. Lifecycle and notification events are
    /// dropped.
    pub fn record(&mut self, event: &Event) {
        match event.kind.group() {
            EventGroup::ContentRequest => self.record_content(event),
            EventGroup::ViewRequest => self.record_view(event),
            EventGroup::Lifecycle | EventGroup::Notification => {}
        }
    }

    /// Captures the current visibility and pose of everything `source`
    /// reports under `root` as view events authored by `origin`.
    ///
    /// Returns the number of nodes captured.
    pub fn snapshot<S: SnapshotSource + ?Sized>(
        &mut self,
        source: &S,
        root: &str,
        origin: SessionId,
    ) -> Result<usize, CodecError> {
        let states = source.display_states(root);
        for state in &states {
            let visibility = Event::new(EventKind::SetVisibilityRequest, origin)
                .at(state.address.as_str())
                .with_optional_payload(state.active.then(|| VISIBLE.to_string()));
            self.record_view(&visibility);

            let pose = Event::new(EventKind::Pose, origin)
                .at(state.address.as_str())
                .with_payload(codec::encode(&state.pose)?);
            self.record_view(&pose);
        }
        debug!(root, nodes = states.len(), "Scene snapshot taken");
        Ok(states.len())
    }

    /// Re-raises the stored events through `bus` with the replay origin:
    /// content in recorded order, then every view event once.
    ///
    /// Callers must not hold any lock a handler on `bus` needs; replay a
    /// clone if the info itself is shared.
    pub fn replay(&self, bus: &EventBus, emit_content: bool, emit_view: bool) {
        self.replay_with(emit_content, emit_view, |event| bus.raise(event));
    }

    /// Like [`SceneInfo::replay`], handing each event to `emit` instead.
    pub fn replay_with<F>(&self, emit_content: bool, emit_view: bool, mut emit: F)
    where
        F: FnMut(&Event),
    {
        if emit_content {
            for event in &self.content_events {
                emit(&event.as_replay());
            }
        }
        if emit_view {
            for event in self.view_events.values().flat_map(BTreeMap::values) {
                emit(&event.as_replay());
            }
        }
    }

    pub fn content_events(&self) -> &[Event] {
        &self.content_events
    }

    pub fn view_event(&self, address: &str, kind: EventKind) -> Option<&Event> {
        self.view_events
            .get(canonical_address(address).as_ref())?
            .get(&kind)
    }

    /// All view events in replay order.
    pub fn view_events(&self) -> impl Iterator<Item = &Event> {
        self.view_events.values().flat_map(BTreeMap::values)
    }

    pub fn view_event_count(&self) -> usize {
        self.view_events.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.content_events.is_empty() && self.view_events.is_empty()
    }

    pub fn clear(&mut self) {
        self.content_events.clear();
        self.view_events.clear();
    }
}

impl Clone for SceneInfo {
    fn clone(&self) -> Self {
        let mut copy = SceneInfo::new();
        copy.clone_from(self);
        copy
    }

    /// Clears `self` and re-records everything in `source` through the
    /// normal recording rules.
    fn clone_from(&mut self, source: &Self) {
        self.clear();
        for event in &source.content_events {
            self.record_content(event);
        }
        for event in source.view_events() {
            self.record_view(event);
        }
    }
}
