//! SimulatedPeer - a scene session attached to the simulated network.
//!
//! Bridges `scenesync_core::SceneSession` with the simulation:
//! - outbound events are encoded into frames and broadcast
//! - delivered frames are decoded and raised on the session's bus
//! - per-peer traffic counters for scenario assertions

use crate::context::SimContext;
use crate::network::SimNetwork;

use scenesync_core::codec;
use scenesync_core::{EventKind, SceneSession, SessionContext, SyncConfig};
use scenesync_env::{EventTransport, SceneContext, SessionId};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Traffic counters for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Frames handed to the network
    pub frames_sent: u64,

    /// Frames decoded and raised
    pub frames_received: u64,

    /// Frames that failed to decode or were rejected by the bus
    pub frames_rejected: u64,

    /// Pose events this peer published
    pub poses_published: u64,
}

/// A scene session running in the deterministic environment.
pub struct SimulatedPeer {
    /// Position in the world (0 is the master)
    index: usize,

    scene: SceneSession<SimContext>,

    network: Arc<SimNetwork>,

    stats: PeerStats,
}

impl SimulatedPeer {
    /// Creates a peer whose master is `master`.
    pub fn new(
        index: usize,
        context: Arc<SimContext>,
        network: Arc<SimNetwork>,
        master: SessionId,
        config: SyncConfig,
    ) -> Self {
        let session = SessionContext::shared(network.local_id(), config);
        let scene = SceneSession::new(session, context);
        scene.set_master(master);
        Self {
            index,
            scene,
            network,
            stats: PeerStats::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> SessionId {
        self.network.local_id()
    }

    pub fn scene(&self) -> &SceneSession<SimContext> {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut SceneSession<SimContext> {
        &mut self.scene
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    /// Interpolation and monitor step.
    pub fn tick(&mut self) {
        self.stats.poses_published += self.scene.tick() as u64;
    }

    /// Raises every frame delivered since the last call. Returns how many
    /// were applied.
    pub fn process_inbox(&mut self) -> usize {
        let mut applied = 0;
        while let Some((from, frame)) = self.network.try_recv() {
            match self.scene.receive_frame(&frame) {
                Ok(()) => {
                    self.stats.frames_received += 1;
                    applied += 1;
                }
                Err(e) => {
                    self.stats.frames_rejected += 1;
                    warn!(peer = self.index, from = %from, error = %e, "Rejected frame");
                }
            }
        }
        applied
    }

    /// Broadcasts every event the session queued for its peers.
    pub async fn flush_outbox(&mut self) -> usize {
        let timestamp_ms = self
            .scene
            .context()
            .system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut sent = 0;
        for event in self.scene.drain_outbox() {
            let frame = match codec::encode_frame(&event, timestamp_ms) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = self.index, kind = %event.kind, error = %e, "Encode failed");
                    continue;
                }
            };
            self.network.broadcast(frame).await;
            sent += 1;
        }
        self.stats.frames_sent += sent as u64;
        sent
    }

    /// Sends the full scene, as replay events, to a newly joined session.
    pub async fn send_scene_to(&mut self, target: SessionId) -> usize {
        let events = match self.scene.snapshot_events() {
            Ok(events) => events,
            Err(e) => {
                warn!(peer = self.index, error = %e, "Snapshot failed");
                return 0;
            }
        };

        let mut sent = 0;
        for event in &events {
            let Ok(frame) = codec::encode_frame(event, 0) else {
                continue;
            };
            match self.network.send(target, frame).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(peer = self.index, target = %target, error = %e, "Scene transfer failed");
                    break;
                }
            }
        }
        debug!(peer = self.index, target = %target, events = sent, "Scene sent to newcomer");
        self.stats.frames_sent += sent as u64;
        sent
    }

    /// Tells the session a participant entered or left the room.
    pub fn announce(&self, other: SessionId, name: &str, joined: bool) {
        let kind = if joined {
            EventKind::NetworkOtherJoinedRoom
        } else {
            EventKind::NetworkOtherLeftRoom
        };
        let event = scenesync_core::Event::new(kind, other).with_payload(name);
        self.scene.bus().raise(&event);
    }
}
