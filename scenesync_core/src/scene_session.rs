//! Scene Session - one participant's view of the shared scene.
//!
//! Wires the engine pieces together around a scene graph:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        SceneSession                           │
//! │                                                               │
//! │  load / annotate / set_visibility ──► raise_global ──► outbox │
//! │                                          │                    │
//! │  receive_frame ──────────────────────►  BUS                   │
//! │                                          │                    │
//! │        ┌───────────────┬─────────────────┼──────────────┐     │
//! │        ▼               ▼                 ▼              ▼     │
//! │    appliers      live tracking      recording       (others)  │
//! │  (SceneState)     (SceneInfo)                                 │
//! │        │                                                      │
//! │  tick: apply interpolation, sample monitors, publish poses    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests are applied by bus handlers no matter who raised them, so a
//! local request, a peer's request and a replayed request all take the
//! same path. Poses are the exception: a session never applies a pose it
//! authored.
//!
//! # Usage
//!
//! ```ignore
//! use scenesync_core::{SceneSession, SessionContext, SyncConfig, ModelManifest};
//! use scenesync_env::{SessionId, TokioContext};
//!
//! let session = SessionContext::shared(SessionId::new(), SyncConfig::default());
//! let scene = SceneSession::new(session, TokioContext::shared());
//! scene.load("Model", &ModelManifest::new("engine.glb").with_part("Block"))?;
//!
//! loop {
//!     scene.tick();
//!     for event in scene.drain_outbox() {
//!         transport.broadcast(codec::encode_frame(&event, now_ms)?).await;
//!     }
//! }
//! ```

use crate::annotation::{Annotation, ModelManifest};
use crate::codec::{self, CodecError};
use crate::event_bus::{BusError, EventBus, HandlerId};
use crate::events::{Event, EventKind};
use crate::lock;
use crate::ownership::{EntityId, OwnershipRegistry};
use crate::pose::Pose;
use crate::scene_graph::{canonical_address, join_address, NodeKey, SceneError, SceneGraph};
use crate::scene_info::{DisplayState, SceneInfo, SnapshotSource, VISIBLE};
use crate::scene_recording::{RecordingEntry, SceneRecording};
use crate::schedule::{spawn_repeating, CancellationToken};
use crate::session::{SessionContext, SyncConfig, UserInfo};
use crate::synced_entity::{PoseReceipt, SyncedEntity};
use scenesync_env::{EventFrame, SceneContext, SessionId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// Everything the appliers mutate, behind one lock.
#[derive(Debug)]
pub struct SceneState {
    pub graph: SceneGraph,
    pub registry: OwnershipRegistry,
    pub entities: BTreeMap<EntityId, SyncedEntity>,
    pub annotations: BTreeMap<String, Annotation>,
    container: String,
}

impl SceneState {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            graph: SceneGraph::new(&config.scene_root),
            registry: OwnershipRegistry::new(),
            entities: BTreeMap::new(),
            annotations: BTreeMap::new(),
            container: config.annotation_container.clone(),
        }
    }

    /// Makes `node` a synchronized entity owned by `authority`.
    ///
    /// Gives the node its annotation container and registers every node
    /// below it with its nearest owning entity, so later lookups never walk
    /// the hierarchy.
    pub fn register_entity(
        &mut self,
        node: NodeKey,
        authority: SessionId,
        config: &SyncConfig,
        now: Duration,
    ) -> Result<EntityId, SceneError> {
        let address = self
            .graph
            .address_of(node)
            .ok_or(SceneError::UnknownNode(node))?;
        if self.graph.child_named(node, &self.container).is_none() {
            self.graph.add_child(node, &self.container)?;
        }

        let id = self.registry.create_entity(node, &address, authority);
        for descendant in self.graph.descendants(node).into_iter().skip(1) {
            let Some(owner) = self.owning_entity(descendant) else {
                continue;
            };
            if let Some(path) = self.graph.address_of(descendant) {
                self.registry.register(&path, owner);
            }
        }

        let pose = self.graph.pose(node).unwrap_or_default();
        self.entities
            .insert(id, SyncedEntity::new(id, node, address, pose, config, now));
        Ok(id)
    }

    /// Nearest entity at or above `key`.
    pub fn owning_entity(&self, key: NodeKey) -> Option<EntityId> {
        let mut current = key;
        loop {
            let address = self.graph.address_of(current)?;
            if let Some(id) = self.registry.entity_at(&address) {
                return Some(id);
            }
            current = self.graph.parent(current)?;
        }
    }

    pub fn entity_at(&self, address: &str) -> Option<&SyncedEntity> {
        self.entities.get(&self.registry.entity_at(address)?)
    }

    /// Annotation container of the entity at `owner`.
    pub fn container_address(&self, owner: &str) -> String {
        join_address(&canonical_address(owner), &self.container)
    }

    /// Cancels every monitor and forgets all content.
    pub fn clear(&mut self) {
        for entity in self.entities.values() {
            entity.cancel();
        }
        self.entities.clear();
        self.annotations.clear();
        self.registry.clear();
        self.graph.clear();
    }

    fn push_state(&self, out: &mut Vec<DisplayState>, key: NodeKey) {
        let (Some(node), Some(address)) = (self.graph.node(key), self.graph.address_of(key)) else {
            return;
        };
        out.push(DisplayState {
            address,
            active: node.active,
            pose: node.pose,
        });
    }
}

fn is_under(address: &str, root: &str) -> bool {
    root.is_empty()
        || address == root
        || address
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl SnapshotSource for SceneState {
    fn display_states(&self, root: &str) -> Vec<DisplayState> {
        let root = canonical_address(root);
        let mut out = Vec::new();
        for entity in self.entities.values() {
            if !is_under(entity.address(), &root) {
                continue;
            }
            self.push_state(&mut out, entity.node());

            let Some(container) = self.graph.child_named(entity.node(), &self.container) else {
                continue;
            };
            let children = self
                .graph
                .node(container)
                .map(|node| node.children.clone())
                .unwrap_or_default();
            for child in children {
                self.push_state(&mut out, child);
            }
        }
        out
    }
}

/// Bus handlers that apply requests to the scene state.
struct Appliers<Ctx: SceneContext> {
    session: Arc<SessionContext>,
    context: Arc<Ctx>,
    bus: Weak<EventBus>,
    state: Arc<Mutex<SceneState>>,
}

impl<Ctx: SceneContext> Appliers<Ctx> {
    /// Raises a derived notification locally. Never called with the state
    /// lock held.
    fn notify(&self, kind: EventKind, address: &str) {
        if let Some(bus) = self.bus.upgrade() {
            bus.raise(&Event::new(kind, self.session.local_id()).at(address));
        }
    }

    fn apply_load(&self, event: &Event) {
        let Some(address) = event.address.as_deref().map(canonical_address) else {
            warn!("LoadRequest without an address");
            return;
        };
        let address: &str = &address;
        let manifest = match &event.payload {
            Some(payload) => match codec::decode::<ModelManifest>(payload) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(address, error = %e, "Unreadable LoadRequest payload");
                    return;
                }
            },
            None => ModelManifest::new(address),
        };

        let loaded = {
            let mut state = lock(&self.state);
            if state.registry.entity_at(address).is_some() {
                debug!(address, "Already loaded");
                false
            } else {
                match self.load_into(&mut state, address, &manifest) {
                    Ok(id) => {
                        debug!(address, entity = %id, source = %manifest.source, "Model loaded");
                        true
                    }
                    Err(e) => {
                        warn!(address, error = %e, "LoadRequest failed");
                        false
                    }
                }
            }
        };

        if loaded {
            self.notify(EventKind::SceneModified, address);
            self.notify(EventKind::LoadCompleted, address);
        }
    }

    fn load_into(
        &self,
        state: &mut SceneState,
        address: &str,
        manifest: &ModelManifest,
    ) -> Result<EntityId, SceneError> {
        let node = state.graph.ensure_path(address)?;
        for part in &manifest.parts {
            if state.graph.child_named(node, part).is_none() {
                state.graph.add_child(node, part)?;
            }
        }
        state.register_entity(
            node,
            self.session.master_id(),
            self.session.config(),
            self.context.now(),
        )
    }

    fn apply_visibility(&self, event: &Event) {
        let Some(address) = event.address.as_deref().map(canonical_address) else {
            warn!("SetVisibilityRequest without an address");
            return;
        };
        let address: &str = &address;
        let visible = event.payload.is_some();

        let mut state = lock(&self.state);
        let Some(node) = state.graph.find(address) else {
            warn!(address, "SetVisibilityRequest for unknown node");
            return;
        };
        if let Err(e) = state.graph.set_active(node, visible) {
            warn!(address, error = %e, "SetVisibilityRequest failed");
        }
    }

    fn apply_pose(&self, event: &Event) {
        let Some(address) = event.address.as_deref().map(canonical_address) else {
            warn!("Pose without an address");
            return;
        };
        let address: &str = &address;
        let local = self.session.local_id();
        if event.is_from(local) {
            return;
        }
        let pose: Pose = match codec::decode_payload(event.payload.as_deref()) {
            Ok(pose) => pose,
            Err(e) => {
                warn!(address, error = %e, "Unreadable Pose payload");
                return;
            }
        };

        let now = self.context.now();
        let mut state = lock(&self.state);
        let SceneState {
            graph,
            registry,
            entities,
            ..
        } = &mut *state;

        let Some(node) = graph.find(address) else {
            warn!(address, "Pose for unknown node");
            return;
        };
        let current = graph.pose(node).unwrap_or_default();

        let entity = registry.entity_at(address).and_then(|id| entities.get_mut(&id));
        let write_now = match entity {
            Some(entity) => {
                entity.receive_pose(event.origin, local, pose, current, now) == PoseReceipt::Restored
            }
            // Plain nodes (annotations, parts) take the pose as is.
            None => true,
        };
        if write_now {
            if let Err(e) = graph.set_pose(node, pose) {
                warn!(address, error = %e, "Pose failed");
            }
        }
    }

    fn apply_annotation(&self, event: &Event) {
        let Some(address) = event.address.as_deref().map(canonical_address) else {
            warn!("AnnotationRequest without an address");
            return;
        };
        let address: &str = &address;
        let annotation: Annotation = match codec::decode_payload(event.payload.as_deref()) {
            Ok(annotation) => annotation,
            Err(e) => {
                warn!(address, error = %e, "Unreadable AnnotationRequest payload");
                return;
            }
        };

        let applied = {
            let mut state = lock(&self.state);
            match state.graph.ensure_path(address) {
                Ok(node) => {
                    if let Some(owner) = state.owning_entity(node) {
                        state.registry.register(address, owner);
                    }
                    state.annotations.insert(address.to_string(), annotation);
                    true
                }
                Err(e) => {
                    warn!(address, error = %e, "AnnotationRequest failed");
                    false
                }
            }
        };

        if applied {
            self.notify(EventKind::SceneModified, address);
        }
    }

    fn apply_roster(&self, event: &Event) {
        match event.kind {
            EventKind::NetworkOtherJoinedRoom => {
                let info = UserInfo {
                    name: event.payload.clone().unwrap_or_default(),
                    ..UserInfo::default()
                };
                info!(user = %event.origin, name = %info.name, "Participant joined");
                self.session.add_user(event.origin, info);
            }
            EventKind::NetworkOtherLeftRoom => {
                info!(user = %event.origin, "Participant left");
                self.session.remove_user(event.origin);
            }
            _ => {}
        }
    }
}

/// One participant's scene.
pub struct SceneSession<Ctx: SceneContext> {
    session: Arc<SessionContext>,
    context: Arc<Ctx>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<SceneState>>,
    info: Arc<Mutex<SceneInfo>>,
    recording: SceneRecording<Ctx>,
    outbox: Arc<Mutex<Vec<Event>>>,
    handlers: Vec<(Option<EventKind>, HandlerId)>,
}

impl<Ctx: SceneContext> SceneSession<Ctx> {
    /// Creates a session on a fresh bus and registers its appliers and
    /// live tracking.
    pub fn new(session: Arc<SessionContext>, context: Arc<Ctx>) -> Self {
        let bus = EventBus::shared();
        let state = Arc::new(Mutex::new(SceneState::new(session.config())));
        let info = Arc::new(Mutex::new(SceneInfo::new()));

        let appliers = Arc::new(Appliers {
            session: session.clone(),
            context: context.clone(),
            bus: Arc::downgrade(&bus),
            state: state.clone(),
        });

        let mut handlers = Vec::new();
        let mut on = |kind: EventKind, apply: fn(&Appliers<Ctx>, &Event)| {
            let appliers = appliers.clone();
            let id = bus.register(kind, move |event| apply(&appliers, event));
            handlers.push((Some(kind), id));
        };
        on(EventKind::LoadRequest, Appliers::apply_load);
        on(EventKind::SetVisibilityRequest, Appliers::apply_visibility);
        on(EventKind::Pose, Appliers::apply_pose);
        on(EventKind::AnnotationRequest, Appliers::apply_annotation);
        on(EventKind::NetworkOtherJoinedRoom, Appliers::apply_roster);
        on(EventKind::NetworkOtherLeftRoom, Appliers::apply_roster);

        let tracked = info.clone();
        let tracker = bus.register_generic(move |event| lock(&tracked).record(event));
        handlers.push((None, tracker));

        info!(session = %session.local_id(), master = %session.master_id(), "Scene session created");

        Self {
            recording: SceneRecording::new(context.clone()),
            session,
            context,
            bus,
            state,
            info,
            outbox: Arc::new(Mutex::new(Vec::new())),
            handlers,
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn local_id(&self) -> SessionId {
        self.session.local_id()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    /// A new event authored by this session.
    pub fn event(&self, kind: EventKind) -> Event {
        Event::new(kind, self.session.local_id())
    }

    /// Raises `event` locally and queues it for peers.
    pub fn raise_global(&self, event: Event) {
        self.bus.raise(&event);
        lock(&self.outbox).push(event);
    }

    /// Takes the events queued for peers.
    pub fn drain_outbox(&self) -> Vec<Event> {
        std::mem::take(&mut *lock(&self.outbox))
    }

    /// Raises an event received from a transport.
    pub fn receive_frame(&self, frame: &EventFrame) -> Result<(), SessionError> {
        let event = codec::decode_frame(frame)?;
        self.bus.raise_checked(event)?;
        Ok(())
    }

    pub fn load(&self, address: &str, manifest: &ModelManifest) -> Result<(), SessionError> {
        let event = self
            .event(EventKind::LoadRequest)
            .at(address)
            .with_payload(codec::encode(manifest)?);
        self.raise_global(event);
        Ok(())
    }

    pub fn set_visibility(&self, address: &str, visible: bool) {
        let event = self
            .event(EventKind::SetVisibilityRequest)
            .at(address)
            .with_optional_payload(visible.then(|| VISIBLE.to_string()));
        self.raise_global(event);
    }

    /// Draws `annotation` in the annotation container of the entity at
    /// `owner`, or free-standing under the root when `owner` is `None`.
    ///
    /// Returns the annotation's address.
    pub fn annotate(
        &self,
        owner: Option<&str>,
        annotation: &Annotation,
    ) -> Result<String, SessionError> {
        let address = match owner {
            Some(owner) => {
                let container = lock(&self.state).container_address(owner);
                join_address(&container, &annotation.name)
            }
            None => annotation.name.clone(),
        };
        let address = canonical_address(&address).into_owned();
        let event = self
            .event(EventKind::AnnotationRequest)
            .at(address.as_str())
            .with_payload(codec::encode(annotation)?);
        self.raise_global(event);
        Ok(address)
    }

    /// Moves a node locally, as a user dragging it would. An authority
    /// publishes the change on its next monitor sample.
    pub fn move_entity(&self, address: &str, pose: Pose) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        let node = state
            .graph
            .find(address)
            .ok_or_else(|| SceneError::UnknownAddress(address.to_string()))?;
        state.graph.set_pose(node, pose)?;
        Ok(())
    }

    /// Places an entity without it counting as a local change.
    pub fn place_entity(&self, address: &str, pose: Pose) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        let node = state
            .graph
            .find(address)
            .ok_or_else(|| SceneError::UnknownAddress(address.to_string()))?;
        state.graph.set_pose(node, pose)?;
        if let Some(id) = state.registry.entity_at(address) {
            if let Some(entity) = state.entities.get_mut(&id) {
                entity.reset(pose);
            }
        }
        Ok(())
    }

    /// Advances interpolation and runs due monitors. Returns how many
    /// poses were published.
    pub fn tick(&self) -> usize {
        let now = self.context.now();
        let local = self.session.local_id();
        let mut changed = Vec::new();
        {
            let mut state = lock(&self.state);
            let SceneState {
                graph,
                registry,
                entities,
                ..
            } = &mut *state;

            for entity in entities.values_mut() {
                let node = entity.node();
                if let Some(pose) = entity.apply(now) {
                    if let Err(e) = graph.set_pose(node, pose) {
                        warn!(address = entity.address(), error = %e, "Interpolation write failed");
                    }
                }

                let Some(current) = graph.pose(node) else {
                    continue;
                };
                let active = graph.is_active(node).unwrap_or(false);
                let may_publish = registry.is_authority(entity.id(), local);
                if let Some(pose) = entity.monitor(now, current, active, may_publish) {
                    changed.push((entity.address().to_string(), pose));
                }
            }
        }

        let mut published = 0;
        for (address, pose) in changed {
            match codec::encode(&pose) {
                Ok(payload) => {
                    self.raise_global(self.event(EventKind::Pose).at(address).with_payload(payload));
                    published += 1;
                }
                Err(e) => warn!(address, error = %e, "Pose encode failed"),
            }
        }
        published
    }

    /// Makes `master` this session's master and hands it authority over
    /// every loaded entity. Returns how many entities changed hands.
    pub fn set_master(&self, master: SessionId) -> usize {
        self.session.set_master(master);
        let mut state = lock(&self.state);
        let handed = state
            .registry
            .entity_ids()
            .into_iter()
            .filter(|id| state.registry.set_authority(*id, master))
            .count();
        info!(master = %master, entities = handed, "Authority handed over");
        handed
    }

    /// Ticks `session` every `interval` on its context's executor until the
    /// returned token is cancelled or the session is dropped.
    pub fn drive(session: &Arc<Self>, interval: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let weak = Arc::downgrade(session);
        let stop = token.clone();
        spawn_repeating(
            session.context.clone(),
            "scene-tick",
            interval,
            token.clone(),
            move || match weak.upgrade() {
                Some(session) => {
                    session.tick();
                }
                None => stop.cancel(),
            },
        );
        token
    }

    /// Records the current display state under `root` and returns a copy
    /// of the scene info.
    pub fn snapshot(&self, root: &str) -> Result<SceneInfo, SessionError> {
        let state = lock(&self.state);
        let mut info = lock(&self.info);
        info.snapshot(&*state, root, self.session.local_id())?;
        Ok(info.clone())
    }

    /// Snapshot of the whole scene as the events that rebuild it, in
    /// replay order and with the replay origin.
    pub fn snapshot_events(&self) -> Result<Vec<Event>, SessionError> {
        let info = self.snapshot("")?;
        let mut events = Vec::new();
        info.replay_with(true, true, |event| events.push(event.clone()));
        Ok(events)
    }

    /// Tears the scene down and rebuilds it from `saved`.
    pub fn restore(&self, saved: &SceneInfo) {
        self.teardown();
        saved.replay(&self.bus, true, true);
        info!(
            content = saved.content_events().len(),
            view = saved.view_event_count(),
            "Scene restored"
        );
    }

    /// Cancels every monitor and empties the scene and its scene info.
    pub fn teardown(&self) {
        lock(&self.state).clear();
        lock(&self.info).clear();
    }

    /// Copy of the live scene info.
    pub fn scene_info(&self) -> SceneInfo {
        lock(&self.info).clone()
    }

    /// Runs `f` against the scene state.
    pub fn with_state<R>(&self, f: impl FnOnce(&SceneState) -> R) -> R {
        f(&lock(&self.state))
    }

    pub fn pose_of(&self, address: &str) -> Option<Pose> {
        self.with_state(|state| state.graph.pose(state.graph.find(address)?))
    }

    pub fn is_visible(&self, address: &str) -> Option<bool> {
        self.with_state(|state| state.graph.is_active(state.graph.find(address)?))
    }

    pub fn annotation(&self, address: &str) -> Option<Annotation> {
        self.with_state(|state| {
            state
                .annotations
                .get(canonical_address(address).as_ref())
                .cloned()
        })
    }

    pub fn entity_count(&self) -> usize {
        self.with_state(|state| state.entities.len())
    }

    pub fn start_recording(&mut self) {
        let seed = self.scene_info();
        self.recording.start(&self.bus, &seed);
    }

    pub fn stop_recording(&mut self) -> bool {
        self.recording.stop(&self.bus)
    }

    pub fn flush_recording(&self) -> Vec<RecordingEntry> {
        self.recording.flush()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_recording()
    }
}

impl<Ctx: SceneContext> Drop for SceneSession<Ctx> {
    fn drop(&mut self) {
        self.recording.stop(&self.bus);
        for (kind, id) in self.handlers.drain(..) {
            match kind {
                Some(kind) => self.bus.unregister(kind, id),
                None => self.bus.unregister_generic(id),
            };
        }
        lock(&self.state).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nalgebra::Vector3;
    use scenesync_env::TokioContext;
    use std::future::Future;
    use std::time::SystemTime;

    /// Clock the test moves by hand.
    #[derive(Default)]
    struct ManualClock {
        now: Mutex<Duration>,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    #[async_trait]
    impl SceneContext for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn system_time(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH + self.now()
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }

        fn spawn<F>(&self, _name: &str, _future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
        }

        fn seed(&self) -> u64 {
            0
        }
    }

    fn scene(seed: u64, master: u64) -> (SceneSession<ManualClock>, Arc<ManualClock>) {
        let session = SessionContext::shared(SessionId::from_seed(seed), SyncConfig::default());
        session.set_master(SessionId::from_seed(master));
        let clock = Arc::new(ManualClock::default());
        (SceneSession::new(session, clock.clone()), clock)
    }

    fn pose_event(origin: SessionId, address: &str, pose: Pose) -> Event {
        Event::new(EventKind::Pose, origin)
            .at(address)
            .with_payload(codec::encode(&pose).unwrap())
    }

    fn moved(x: f32) -> Pose {
        Pose::at(Vector3::new(x, 0.0, 0.0))
    }

    fn half_second() -> Duration {
        Duration::from_millis(500)
    }

    #[test]
    fn test_load_creates_entity_and_notifies() {
        let (scene, _) = scene(1, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scene.bus().register_generic(move |e| sink.lock().unwrap().push(e.kind));

        scene
            .load("Model", &ModelManifest::new("engine.glb").with_part("Block"))
            .unwrap();

        assert_eq!(scene.entity_count(), 1);
        scene.with_state(|state| {
            let block = state.graph.find("Model/Block").unwrap();
            let container = state.graph.find("Model/Annotations").unwrap();
            let id = state.registry.entity_at("Model").unwrap();
            assert_eq!(state.owning_entity(block), Some(id));
            assert_eq!(state.registry.resolve("Model/Annotations"), Some(id));
            assert_eq!(state.owning_entity(container), Some(id));
        });

        // Derived notifications run inside the request's dispatch.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::SceneModified, EventKind::LoadCompleted, EventKind::LoadRequest]
        );
        assert_eq!(scene.drain_outbox().len(), 1);
        assert!(scene.drain_outbox().is_empty());
    }

    #[test]
    fn test_visibility_scenario() {
        let (scene, _) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.set_visibility("Model", true);
        scene.set_visibility("Model", false);

        assert_eq!(scene.is_visible("Model"), Some(false));
        let info = scene.scene_info();
        let stored = info
            .view_event("Model", EventKind::SetVisibilityRequest)
            .unwrap();
        assert_eq!(stored.payload, None);
        assert_eq!(info.content_events().len(), 1);
    }

    #[test]
    fn test_own_pose_echo_is_ignored() {
        let (scene, _) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.bus().raise(&pose_event(scene.local_id(), "Model", moved(4.0)));
        assert_eq!(scene.pose_of("Model"), Some(Pose::default()));
    }

    #[test]
    fn test_peer_pose_eases_in_over_ticks() {
        let (scene, clock) = scene(2, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene
            .bus()
            .raise(&pose_event(SessionId::from_seed(1), "Model", moved(4.0)));
        assert_eq!(scene.pose_of("Model"), Some(Pose::default()));

        clock.advance(Duration::from_millis(50));
        scene.tick();
        let mid = scene.pose_of("Model").unwrap();
        assert!(mid.position.x > 0.0 && mid.position.x < 4.0);

        clock.advance(Duration::from_millis(50));
        scene.tick();
        assert_eq!(scene.pose_of("Model"), Some(moved(4.0)));

        clock.advance(half_second());
        assert_eq!(scene.tick(), 0);
        assert!(scene.drain_outbox().iter().all(|e| e.kind != EventKind::Pose));
    }

    #[test]
    fn test_authority_publishes_local_moves() {
        let (scene, clock) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.drain_outbox();

        scene.move_entity("Model", moved(2.0)).unwrap();
        clock.advance(half_second());
        assert_eq!(scene.tick(), 1);

        let outbox = scene.drain_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].kind, EventKind::Pose);
        assert!(outbox[0].is_from(scene.local_id()));
        // The local raise was its own echo; the pose stays where it was moved.
        assert_eq!(scene.pose_of("Model"), Some(moved(2.0)));

        clock.advance(half_second());
        assert_eq!(scene.tick(), 0);
    }

    #[test]
    fn test_non_authority_never_publishes() {
        let (scene, clock) = scene(2, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.move_entity("Model", moved(2.0)).unwrap();
        clock.advance(half_second());
        assert_eq!(scene.tick(), 0);
    }

    #[test]
    fn test_place_entity_is_not_a_local_change() {
        let (scene, clock) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.place_entity("Model", moved(3.0)).unwrap();
        clock.advance(half_second());
        assert_eq!(scene.tick(), 0);
        assert!(scene.place_entity("Missing", moved(1.0)).is_err());
    }

    #[test]
    fn test_annotation_joins_owner_container() {
        let (scene, _) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();

        let mut doodle = Annotation::new("Doodle");
        doodle.add_point(Vector3::new(0.0, 1.0, 0.0));
        let address = scene.annotate(Some("Model"), &doodle).unwrap();
        assert_eq!(address, "Model/Annotations/Doodle");
        assert_eq!(scene.annotation(&address), Some(doodle));

        scene.with_state(|state| {
            let owner = state.registry.entity_at("Model");
            assert_eq!(state.registry.resolve("Model/Annotations/Doodle"), owner);
        });

        let info = scene.scene_info();
        assert!(info.view_event(&address, EventKind::AnnotationRequest).is_some());
    }

    #[test]
    fn test_snapshot_restore_rebuilds_scene() {
        let (scene, _) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m").with_part("Block")).unwrap();
        scene.annotate(Some("Model"), &Annotation::new("Doodle")).unwrap();
        scene.set_visibility("Model/Annotations/Doodle", false);
        scene.place_entity("Model", moved(7.0)).unwrap();

        let saved = scene.snapshot("").unwrap();
        scene.teardown();
        assert_eq!(scene.entity_count(), 0);
        assert_eq!(scene.pose_of("Model"), None);

        scene.restore(&saved);
        assert_eq!(scene.entity_count(), 1);
        assert_eq!(scene.pose_of("Model"), Some(moved(7.0)));
        assert_eq!(scene.is_visible("Model/Annotations/Doodle"), Some(false));
        assert!(scene.annotation("Model/Annotations/Doodle").is_some());
        assert!(scene.pose_of("Model/Block").is_some());

        // A second snapshot of the rebuilt scene captures the same state.
        let again = scene.snapshot("").unwrap();
        let payloads = |info: &SceneInfo| -> Vec<(EventKind, Option<String>, Option<String>)> {
            info.view_events()
                .map(|e| (e.kind, e.address.clone(), e.payload.clone()))
                .collect()
        };
        assert_eq!(payloads(&again), payloads(&saved));
        assert_eq!(again.content_events().len(), saved.content_events().len());
    }

    #[test]
    fn test_restored_pose_is_republished_by_authority() {
        let (scene, clock) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.place_entity("Model", moved(7.0)).unwrap();
        let saved = scene.snapshot("").unwrap();

        scene.restore(&saved);
        scene.drain_outbox();
        clock.advance(half_second());
        assert_eq!(scene.tick(), 1);
    }

    #[test]
    fn test_null_frame_is_rejected() {
        let (scene, _) = scene(1, 1);
        let frame = EventFrame::new(b"null".to_vec(), 0);
        assert!(matches!(
            scene.receive_frame(&frame),
            Err(SessionError::Bus(BusError::InvalidArgument(_)))
        ));

        let garbage = EventFrame::new(b"{".to_vec(), 0);
        assert!(matches!(scene.receive_frame(&garbage), Err(SessionError::Codec(_))));
    }

    #[test]
    fn test_frames_from_peer_apply() {
        let (master, _) = scene(1, 1);
        let (peer, _) = scene(2, 1);
        master.load("Model", &ModelManifest::new("m")).unwrap();
        for event in master.drain_outbox() {
            peer.receive_frame(&codec::encode_frame(&event, 0).unwrap()).unwrap();
        }
        assert_eq!(peer.entity_count(), 1);
        assert!(peer.drain_outbox().is_empty());
    }

    #[test]
    fn test_roster_follows_lifecycle_events() {
        let (scene, _) = scene(1, 1);
        let other = SessionId::from_seed(9);
        scene
            .bus()
            .raise(&Event::new(EventKind::NetworkOtherJoinedRoom, other).with_payload("ana"));
        assert_eq!(scene.session().user(other).unwrap().name, "ana");
        scene
            .bus()
            .raise(&Event::new(EventKind::NetworkOtherLeftRoom, other));
        assert_eq!(scene.session().user_count(), 0);
    }

    #[test]
    fn test_recording_captures_session_traffic() {
        let (mut scene, clock) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.start_recording();
        clock.advance(Duration::from_secs(1));
        scene.set_visibility("Model", false);

        let entries = scene.flush_recording();
        // Seed: LoadRequest. Live: SetVisibilityRequest.
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].elapsed, Duration::ZERO);
        assert_eq!(entries[1].elapsed, Duration::from_secs(1));
        assert!(scene.stop_recording());
    }

    #[test]
    fn test_address_spellings_converge_after_restore() {
        let (scene, _) = scene(1, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.set_visibility("Model/", false);
        scene.set_visibility("Model", true);
        assert_eq!(scene.is_visible("Model"), Some(true));

        let saved = scene.snapshot("").unwrap();
        let visibility = saved
            .view_events()
            .filter(|e| e.kind == EventKind::SetVisibilityRequest)
            .count();
        assert_eq!(visibility, 1);
        scene.restore(&saved);
        assert_eq!(scene.is_visible("Model"), Some(true));
    }

    #[test]
    fn test_aliased_peer_pose_still_interpolates() {
        let (scene, clock) = scene(2, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        let mut event = pose_event(SessionId::from_seed(1), "Model", moved(4.0));
        event.address = Some("/Model/".to_string());
        scene.bus().raise(&event);

        // Taken as an entity pose: eased in, not written straight away.
        assert_eq!(scene.pose_of("Model"), Some(Pose::default()));
        clock.advance(Duration::from_millis(100));
        scene.tick();
        assert_eq!(scene.pose_of("Model"), Some(moved(4.0)));
    }

    #[test]
    fn test_set_master_hands_over_authority() {
        let (scene, clock) = scene(2, 1);
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.move_entity("Model", moved(2.0)).unwrap();
        clock.advance(half_second());
        assert_eq!(scene.tick(), 0);

        assert_eq!(scene.set_master(scene.local_id()), 1);
        assert!(scene.session().is_master());
        scene.move_entity("Model", moved(3.0)).unwrap();
        clock.advance(half_second());
        assert_eq!(scene.tick(), 1);
    }

    #[tokio::test]
    async fn test_drive_ticks_until_cancelled() {
        let config = SyncConfig {
            pose_monitor_interval: Duration::from_millis(10),
            ..SyncConfig::default()
        };
        let session = SessionContext::shared(SessionId::from_seed(1), config);
        let scene = Arc::new(SceneSession::new(session, TokioContext::shared()));
        scene.load("Model", &ModelManifest::new("m")).unwrap();
        scene.move_entity("Model", moved(2.0)).unwrap();
        scene.drain_outbox();

        let token = SceneSession::drive(&scene, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(80)).await;
        token.cancel();

        let published = scene.drain_outbox();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, EventKind::Pose);
    }

    #[test]
    fn test_drop_unregisters_handlers() {
        let (scene, _) = scene(1, 1);
        let bus = scene.bus().clone();
        assert_eq!(bus.handler_count(EventKind::LoadRequest), 1);
        drop(scene);
        assert_eq!(bus.handler_count(EventKind::LoadRequest), 0);
        assert_eq!(bus.generic_handler_count(), 0);
    }
}
