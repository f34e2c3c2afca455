//! Event transport abstraction between SceneSync sessions.

use crate::error::EnvError;
use crate::types::{EventFrame, SessionId};
use async_trait::async_trait;

/// Abstraction for shipping encoded events between sessions.
///
/// The engine never defines the wire protocol; it hands encoded events to
/// a transport and raises whatever comes back on its own bus.
///
/// # Implementations
///
/// - **Production**: wraps whatever relay or socket the host application uses
/// - **Simulation**: channel-based with configurable partitions
///
/// # Frame Flow
///
/// ```text
/// Session A                  Transport                 Session B
///   |                           |                          |
///   |-- send(B, frame) -------->|                          |
///   |                           |-- [latency/partition] -->|
///   |                           |                          |-- recv() -> frame
/// ```
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Sends an encoded event frame to a target session.
    ///
    /// # Returns
    /// * `Ok(())` - Frame queued for delivery
    /// * `Err(EnvError::NetworkError)` - Immediate send failure
    ///
    /// # Note
    /// Success does not guarantee delivery.
    async fn send(&self, target: SessionId, frame: EventFrame) -> Result<(), EnvError>;

    /// Receives the next frame addressed to this session.
    ///
    /// Returns `None` once the transport is closed.
    async fn recv(&self) -> Option<(SessionId, EventFrame)>;

    /// Broadcasts a frame to every other connected session.
    ///
    /// Returns the number of sessions the frame was queued for.
    async fn broadcast(&self, frame: EventFrame) -> usize;

    /// Returns this session's id.
    fn local_id(&self) -> SessionId;
}
