//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::exporter::{EntityFrame, PeerFrame, SimFrame};
use crate::network::{Directory, NetworkMessage, Route, SimNetwork, SimNetworkController};
use crate::peer::{PeerStats, SimulatedPeer};

use rand::Rng;
use scenesync_core::{Pose, SyncConfig};
use scenesync_env::{EventFrame, SceneContext, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of peers to spawn (peer 0 is the master)
    pub num_peers: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Maximum simulation duration in seconds (0 = unlimited)
    pub max_duration_secs: f64,

    /// Base one-way latency in milliseconds
    pub latency_ms: u64,

    /// Extra random latency in milliseconds, uniform in [0, jitter_ms]
    pub jitter_ms: u64,

    /// Synchronization tuning handed to every peer
    pub sync: SyncConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_peers: 4,
            tick_rate_hz: 30,
            max_duration_secs: 10.0,
            latency_ms: 20,
            jitter_ms: 10,
            sync: SyncConfig::default(),
        }
    }
}

/// Network counters for the whole world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Frames routed to an inbox
    pub delivered: u64,

    /// Frames lost to partitions, loss or full inboxes
    pub dropped: u64,
}

/// A frame on its way to one recipient.
struct InFlight {
    deliver_at: Duration,
    from: SessionId,
    to: SessionId,
    frame: EventFrame,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub network_controller: SimNetworkController,

    /// Peers in join order
    peers: Vec<SimulatedPeer>,

    /// Inbox senders, one per peer
    inboxes: HashMap<SessionId, mpsc::Sender<(SessionId, EventFrame)>>,

    /// Everyone on the network
    directory: Directory,

    /// Central router sender (cloned into every peer's network)
    router_tx: mpsc::Sender<NetworkMessage>,

    /// Central router receiver
    router_rx: mpsc::Receiver<NetworkMessage>,

    /// Frames waiting out their latency
    in_flight: Vec<InFlight>,

    /// Latest delivery time per link; links are FIFO like the relays they
    /// stand in for
    link_clock: HashMap<(SessionId, SessionId), Duration>,

    traffic: TrafficStats,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with `config.num_peers` peers.
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let network_controller = SimNetworkController::new();
        network_controller.set_default_latency(config.latency_ms);

        // Create central router channel
        let (router_tx, router_rx) = mpsc::channel::<NetworkMessage>(10_000);

        let mut world = Self {
            config,
            context,
            network_controller,
            peers: Vec::new(),
            inboxes: HashMap::new(),
            directory: Arc::new(Mutex::new(Vec::new())),
            router_tx,
            router_rx,
            in_flight: Vec::new(),
            link_clock: HashMap::new(),
            traffic: TrafficStats::default(),
            tick_count: 0,
        };
        for _ in 0..world.config.num_peers {
            world.spawn_peer();
        }
        world
    }

    /// Session id of the `index`th peer. Stable for a given seed.
    pub fn session_id(&self, index: usize) -> SessionId {
        SessionId::from_seed(self.config.seed.wrapping_mul(1_000).wrapping_add(index as u64))
    }

    /// The master is always the first peer.
    pub fn master_id(&self) -> SessionId {
        self.session_id(0)
    }

    fn spawn_peer(&mut self) -> usize {
        let index = self.peers.len();
        let id = self.session_id(index);
        let (inbox_tx, inbox_rx) = mpsc::channel(10_000);

        let network = Arc::new(SimNetwork::new(
            id,
            self.router_tx.clone(),
            inbox_rx,
            self.directory.clone(),
        ));
        let peer = SimulatedPeer::new(
            index,
            self.context.clone(),
            network,
            self.master_id(),
            self.config.sync.clone(),
        );

        for other in &self.peers {
            other.announce(id, &format!("peer-{index}"), true);
            peer.announce(other.id(), &format!("peer-{}", other.index()), true);
        }

        self.directory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(id);
        self.inboxes.insert(id, inbox_tx);
        self.peers.push(peer);
        debug!(peer = index, session = %id, "Peer spawned");
        index
    }

    /// Adds a peer mid-session. The master sends it the current scene.
    pub async fn join_peer(&mut self) -> usize {
        let index = self.spawn_peer();
        let newcomer = self.peers[index].id();
        if let Some(master) = self.peers.first_mut() {
            let sent = master.send_scene_to(newcomer).await;
            info!(peer = index, events = sent, "Late joiner synchronized");
        }
        index
    }

    pub fn peer(&self, index: usize) -> Option<&SimulatedPeer> {
        self.peers.get(index)
    }

    pub fn peer_mut(&mut self, index: usize) -> Option<&mut SimulatedPeer> {
        self.peers.get_mut(index)
    }

    pub fn master(&self) -> Option<&SimulatedPeer> {
        self.peers.first()
    }

    pub fn peers(&self) -> &[SimulatedPeer] {
        &self.peers
    }

    /// Tick length.
    pub fn dt(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.tick_rate_hz.max(1) as f64)
    }

    /// Advances the simulation by one tick: apply delivered frames, tick,
    /// publish, route. Returns how many frames moved during the tick.
    pub async fn step(&mut self) -> usize {
        self.context.advance_time(self.dt());

        let mut activity = 0;
        for peer in &mut self.peers {
            activity += peer.process_inbox();
            peer.tick();
            activity += peer.flush_outbox().await;
        }
        activity += self.process_network();
        self.tick_count += 1;
        activity
    }

    /// Runs for `duration` of virtual time.
    pub async fn run_for(&mut self, duration: Duration) {
        let ticks = (duration.as_secs_f64() * self.config.tick_rate_hz as f64).ceil() as u64;
        for _ in 0..ticks {
            self.step().await;
        }
    }

    /// Steps until a tick passes with no traffic and nothing in flight, at
    /// most `max_ticks` times. Returns whether the network went quiet.
    pub async fn settle(&mut self, max_ticks: u64) -> bool {
        for _ in 0..max_ticks {
            let activity = self.step().await;
            if activity == 0 && self.in_flight.is_empty() {
                return true;
            }
        }
        false
    }

    /// Routes pending messages: faults are applied here, delivery happens
    /// once each frame's latency has passed. Returns frames delivered.
    pub fn process_network(&mut self) -> usize {
        let now = self.context.now();

        while let Ok(msg) = self.router_rx.try_recv() {
            let recipients: Vec<SessionId> = match msg.route {
                Route::To(target) => vec![target],
                Route::Broadcast => self
                    .peers
                    .iter()
                    .map(SimulatedPeer::id)
                    .filter(|id| *id != msg.from || self.network_controller.echoes(msg.from))
                    .collect(),
            };

            for to in recipients {
                if !self.network_controller.can_communicate(msg.from, to)
                    || self.context.chance(self.network_controller.loss())
                {
                    self.traffic.dropped += 1;
                    continue;
                }
                let jitter = match self.config.jitter_ms {
                    0 => 0,
                    j => self.context.with_rng(|rng| rng.gen_range(0..=j)),
                };
                let latency = self.network_controller.get_latency(msg.from, to) + jitter;
                let link = self.link_clock.entry((msg.from, to)).or_default();
                let deliver_at = (now + Duration::from_millis(latency)).max(*link);
                *link = deliver_at;
                self.in_flight.push(InFlight {
                    deliver_at,
                    from: msg.from,
                    to,
                    frame: msg.frame.clone(),
                });
            }
        }

        // Partition and sort are both stable, so frames sharing a deadline
        // keep their send order.
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|f| f.deliver_at <= now);
        self.in_flight = waiting;

        let mut due = due;
        due.sort_by_key(|f| f.deliver_at);
        let mut delivered = 0;
        for flight in due {
            let Some(inbox) = self.inboxes.get(&flight.to) else {
                self.traffic.dropped += 1;
                continue;
            };
            match inbox.try_send((flight.from, flight.frame)) {
                Ok(()) => delivered += 1,
                Err(_) => self.traffic.dropped += 1,
            }
        }
        self.traffic.delivered += delivered as u64;
        trace!(delivered, in_flight = self.in_flight.len(), "Network routed");
        delivered
    }

    /// True when every peer shows `address` with the same pose and
    /// visibility as the master.
    pub fn converged(&self, address: &str) -> bool {
        let Some(master) = self.master() else {
            return true;
        };
        let pose = master.scene().pose_of(address);
        let visible = master.scene().is_visible(address);
        self.peers.iter().all(|peer| {
            peer.scene().pose_of(address) == pose && peer.scene().is_visible(address) == visible
        })
    }

    /// Largest positional gap between the master and any peer for `address`.
    pub fn divergence(&self, address: &str) -> f32 {
        let Some(reference) = self.master().and_then(|m| m.scene().pose_of(address)) else {
            return 0.0;
        };
        self.peers
            .iter()
            .filter_map(|peer| peer.scene().pose_of(address))
            .map(|pose: Pose| (pose.position - reference.position).norm())
            .fold(0.0, f32::max)
    }

    /// Sum of every peer's counters.
    pub fn peer_totals(&self) -> PeerStats {
        self.peers.iter().map(SimulatedPeer::stats).fold(
            PeerStats::default(),
            |acc, s| PeerStats {
                frames_sent: acc.frames_sent + s.frames_sent,
                frames_received: acc.frames_received + s.frames_received,
                frames_rejected: acc.frames_rejected + s.frames_rejected,
                poses_published: acc.poses_published + s.poses_published,
            },
        )
    }

    pub fn traffic(&self) -> TrafficStats {
        self.traffic
    }

    /// Captures every peer's view of `addresses` for export.
    pub fn capture_frame(&self, addresses: &[String]) -> SimFrame {
        let peers = self
            .peers
            .iter()
            .map(|peer| PeerFrame {
                peer: peer.index(),
                entities: addresses
                    .iter()
                    .filter_map(|address| {
                        let pose = peer.scene().pose_of(address)?;
                        Some(EntityFrame::new(
                            address,
                            &pose,
                            peer.scene().is_visible(address).unwrap_or(false),
                        ))
                    })
                    .collect(),
            })
            .collect();
        SimFrame {
            time_sec: self.time(),
            peers,
            events: Vec::new(),
        }
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns the number of peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use scenesync_core::ModelManifest;

    fn quiet_config(peers: usize) -> SimConfig {
        SimConfig {
            seed: 7,
            num_peers: peers,
            latency_ms: 0,
            jitter_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_sim_world_creation() {
        let world = SimWorld::new(quiet_config(3));
        assert_eq!(world.peer_count(), 3);
        assert_eq!(world.tick_count(), 0);
        assert_eq!(world.master().unwrap().id(), world.master_id());
        // Everyone knows everyone else.
        for peer in world.peers() {
            assert_eq!(peer.scene().session().user_count(), 2);
            assert_eq!(peer.scene().session().master_id(), world.master_id());
        }
    }

    #[tokio::test]
    async fn test_load_reaches_every_peer() {
        let mut world = SimWorld::new(quiet_config(3));
        world
            .master()
            .unwrap()
            .scene()
            .load("Model", &ModelManifest::new("m"))
            .unwrap();
        assert!(world.settle(30).await);

        for peer in world.peers() {
            assert_eq!(peer.scene().entity_count(), 1);
        }
        assert!(world.converged("Model"));
    }

    #[tokio::test]
    async fn test_master_moves_propagate_without_echo_storm() {
        let mut world = SimWorld::new(quiet_config(3));
        world
            .master()
            .unwrap()
            .scene()
            .load("Model", &ModelManifest::new("m"))
            .unwrap();
        world.settle(30).await;

        world
            .master()
            .unwrap()
            .scene()
            .move_entity("Model", Pose::at(Vector3::new(3.0, 0.0, 0.0)))
            .unwrap();
        world.run_for(Duration::from_secs(2)).await;

        assert!(world.converged("Model"));
        assert_eq!(world.peer_totals().poses_published, 1);
    }

    #[tokio::test]
    async fn test_partition_drops_frames() {
        let mut world = SimWorld::new(quiet_config(2));
        let a = world.session_id(0);
        let b = world.session_id(1);
        world.network_controller.partition(vec![a], vec![b]);

        world
            .master()
            .unwrap()
            .scene()
            .load("Model", &ModelManifest::new("m"))
            .unwrap();
        world.settle(10).await;

        assert_eq!(world.peer(1).unwrap().scene().entity_count(), 0);
        assert!(world.traffic().dropped >= 1);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_scene() {
        let mut world = SimWorld::new(quiet_config(2));
        world
            .master()
            .unwrap()
            .scene()
            .load("Model", &ModelManifest::new("m"))
            .unwrap();
        world.settle(30).await;

        let index = world.join_peer().await;
        world.settle(30).await;
        assert_eq!(world.peer(index).unwrap().scene().entity_count(), 1);
        assert!(world.converged("Model"));
    }
}
