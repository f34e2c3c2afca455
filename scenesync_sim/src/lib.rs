//! SceneSync Deterministic Simulation Harness
//!
//! Runs several complete scene sessions against one virtual clock and one
//! simulated relay, so multi-user synchronization can be tested without
//! real time or real sockets.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock advanced one tick at a time
//! - **Network**: channels with configurable latency, jitter, loss, echo
//!   and partitions
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      SimWorld                        │
//! │   ┌──────────┐                     ┌──────────┐      │
//! │   │  Peer 0  │                     │  Peer 1  │ ...  │
//! │   │ (master) │                     │          │      │
//! │   └────┬─────┘                     └────┬─────┘      │
//! │        │ EventFrame                     │            │
//! │   ┌────▼────────────────────────────────▼─────┐      │
//! │   │  Router (latency, jitter, loss, echo)      │      │
//! │   └────────────────────────────────────────────┘      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use scenesync_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::LateJoiner);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod peer;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use exporter::{EntityFrame, ExportError, PeerFrame, SimEvent, SimExport, SimFrame};
pub use network::{Directory, NetworkMessage, Route, SimNetwork, SimNetworkController};
pub use peer::{PeerStats, SimulatedPeer};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld, TrafficStats};
