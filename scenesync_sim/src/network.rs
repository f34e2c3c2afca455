//! Simulated event transport with fault injection.
//!
//! Every peer's [`SimNetwork`] pushes frames into one router channel owned
//! by the world; the world applies the [`SimNetworkController`]'s faults
//! and delivers surviving frames into each peer's inbox.

use async_trait::async_trait;
use scenesync_env::{EnvError, EventFrame, EventTransport, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where a frame is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    To(SessionId),
    Broadcast,
}

/// Internal message to the network router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: SessionId,
    pub route: Route,
    pub frame: EventFrame,
}

/// Sessions currently attached to the simulated network.
pub type Directory = Arc<Mutex<Vec<SessionId>>>;

/// Simulated network interface for one peer.
pub struct SimNetwork {
    /// This session's ID
    local_id: SessionId,

    /// Sender to central router
    tx: mpsc::Sender<NetworkMessage>,

    /// Receiver for incoming frames (behind tokio mutex for async)
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(SessionId, EventFrame)>>>,

    /// Everyone on the network, for broadcast counts
    directory: Directory,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(
        local_id: SessionId,
        tx: mpsc::Sender<NetworkMessage>,
        rx: mpsc::Receiver<(SessionId, EventFrame)>,
        directory: Directory,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            directory,
        }
    }

    /// Takes one delivered frame without waiting.
    pub fn try_recv(&self) -> Option<(SessionId, EventFrame)> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    async fn route(&self, route: Route, frame: EventFrame) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            route,
            frame,
        };
        self.tx
            .send(msg)
            .await
            .map_err(|_| EnvError::network("Router channel closed"))
    }
}

#[async_trait]
impl EventTransport for SimNetwork {
    async fn send(&self, target: SessionId, frame: EventFrame) -> Result<(), EnvError> {
        if !lock(&self.directory).contains(&target) {
            return Err(EnvError::unreachable(target));
        }
        self.route(Route::To(target), frame).await
    }

    async fn recv(&self) -> Option<(SessionId, EventFrame)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    async fn broadcast(&self, frame: EventFrame) -> usize {
        let peers = lock(&self.directory)
            .iter()
            .filter(|id| **id != self.local_id)
            .count();
        match self.route(Route::Broadcast, frame).await {
            Ok(()) => peers,
            Err(_) => 0,
        }
    }

    fn local_id(&self) -> SessionId {
        self.local_id
    }
}

/// Network controller for fault injection.
#[derive(Default)]
pub struct SimNetworkController {
    /// Per-link latency in milliseconds
    link_latency: Mutex<HashMap<(SessionId, SessionId), u64>>,

    /// Latency for links without an override
    default_latency_ms: Mutex<u64>,

    /// Packet loss rate (0.0 - 1.0) applied to every link
    loss_rate: Mutex<f64>,

    /// Active partitions (sessions that cannot communicate)
    partitions: Mutex<Vec<(Vec<SessionId>, Vec<SessionId>)>>,

    /// Sessions that also receive their own broadcasts
    echoing: Mutex<HashSet<SessionId>>,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets latency for a specific link.
    pub fn set_latency(&self, from: SessionId, to: SessionId, latency_ms: u64) {
        lock(&self.link_latency).insert((from, to), latency_ms);
    }

    /// Sets the latency of every link without an override.
    pub fn set_default_latency(&self, latency_ms: u64) {
        *lock(&self.default_latency_ms) = latency_ms;
    }

    /// Sets the packet loss rate.
    pub fn set_loss(&self, loss_rate: f64) {
        *lock(&self.loss_rate) = loss_rate.clamp(0.0, 1.0);
    }

    pub fn loss(&self) -> f64 {
        *lock(&self.loss_rate)
    }

    /// Creates a network partition between two groups.
    pub fn partition(&self, group_a: Vec<SessionId>, group_b: Vec<SessionId>) {
        lock(&self.partitions).push((group_a, group_b));
    }

    /// Heals all active partitions.
    pub fn heal_all(&self) {
        lock(&self.partitions).clear();
    }

    /// Makes the router hand `session`'s broadcasts back to it, as relays
    /// that fan out to the whole room do.
    pub fn set_echo(&self, session: SessionId, echo: bool) {
        let mut echoing = lock(&self.echoing);
        if echo {
            echoing.insert(session);
        } else {
            echoing.remove(&session);
        }
    }

    pub fn echoes(&self, session: SessionId) -> bool {
        lock(&self.echoing).contains(&session)
    }

    /// Checks if two sessions can communicate (not partitioned).
    pub fn can_communicate(&self, from: SessionId, to: SessionId) -> bool {
        let partitions = lock(&self.partitions);
        !partitions.iter().any(|(group_a, group_b)| {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);
            (from_in_a && to_in_b) || (from_in_b && to_in_a)
        })
    }

    /// Gets the latency for a link.
    pub fn get_latency(&self, from: SessionId, to: SessionId) -> u64 {
        lock(&self.link_latency)
            .get(&(from, to))
            .copied()
            .unwrap_or_else(|| *lock(&self.default_latency_ms))
    }
}
