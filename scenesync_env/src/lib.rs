//! SceneSync Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the SceneSync
//! engine to run both against a real clock (tokio) and inside the
//! deterministic simulation harness.
//!
//! # Core Concept
//!
//! Everything the engine needs from the outside world goes through a trait:
//! - Time (`now()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Event fan-out between peers (`EventTransport`)
//!
//! Session identity lives here too, because both the engine and every
//! transport need to agree on what a session id and the replay sentinel are.
//!
//! # Example
//!
//! ```ignore
//! use scenesync_env::{SceneContext, EventTransport};
//!
//! async fn peer_loop<Ctx: SceneContext, Net: EventTransport>(ctx: &Ctx, net: &Net) {
//!     loop {
//!         tokio::select! {
//!             frame = net.recv() => handle_frame(frame),
//!             _ = ctx.sleep(Duration::from_millis(16)) => tick(),
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod network;
mod tokio_impl;
mod types;

pub use context::SceneContext;
pub use error::EnvError;
pub use network::EventTransport;
pub use tokio_impl::TokioContext;
pub use types::{EventFrame, SessionId};
