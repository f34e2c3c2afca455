//! Per-entity pose synchronization.
//!
//! A [`SyncedEntity`] sits on one scene node and does three things:
//! - applies incoming poses, easing towards them every tick
//! - samples the node's pose on a slow schedule to spot local changes
//! - decides whether a detected change may be published
//!
//! The feedback rule is the important part. A session never applies a pose
//! it authored itself, and a pose received from a peer becomes the last
//! sample, so the monitor never mistakes it for a local change.

use crate::ownership::EntityId;
use crate::pose::{Pose, PoseTransition};
use crate::scene_graph::NodeKey;
use crate::schedule::{CancellationToken, RepeatingTask};
use crate::session::SyncConfig;
use scenesync_env::SessionId;
use std::time::Duration;
use tracing::trace;

/// What [`SyncedEntity::receive_pose`] did with an incoming pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseReceipt {
    /// Authored by this session; dropped.
    IgnoredEcho,
    /// Replayed; the entity jumped straight to the pose.
    Restored,
    /// From a peer; the entity is easing towards the pose.
    Interpolating,
    /// From a peer, but the entity is already there.
    Unchanged,
}

/// Synchronization state of one entity.
#[derive(Debug, Clone)]
pub struct SyncedEntity {
    id: EntityId,
    node: NodeKey,
    address: String,
    transition: PoseTransition,
    monitor: RepeatingTask,
    last_sampled: Pose,
    snap_duration: Duration,
}

impl SyncedEntity {
    pub fn new(
        id: EntityId,
        node: NodeKey,
        address: impl Into<String>,
        pose: Pose,
        config: &SyncConfig,
        now: Duration,
    ) -> Self {
        Self {
            id,
            node,
            address: address.into(),
            transition: PoseTransition::new(pose),
            monitor: RepeatingTask::new(config.pose_monitor_interval, now),
            last_sampled: pose,
            snap_duration: config.pose_snap_duration,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn node(&self) -> NodeKey {
        self.node
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn last_sampled(&self) -> &Pose {
        &self.last_sampled
    }

    pub fn is_interpolating(&self) -> bool {
        !self.transition.is_idle()
    }

    pub fn transition(&self) -> &PoseTransition {
        &self.transition
    }

    /// Rests at `pose` and treats it as already seen. Used when the pose
    /// is set from outside (initial load, direct placement).
    pub fn reset(&mut self, pose: Pose) {
        self.transition.reset(pose);
        self.last_sampled = pose;
    }

    /// Per-tick step. Returns the pose to write to the node, if any.
    pub fn apply(&mut self, now: Duration) -> Option<Pose> {
        self.transition
            .advance(now)
            .then(|| *self.transition.current())
    }

    /// Periodic sample. Returns a pose to publish when the node moved since
    /// the last sample and `may_publish` is set.
    ///
    /// Inactive nodes are not sampled, nor are nodes still easing towards a
    /// received pose.
    pub fn monitor(
        &mut self,
        now: Duration,
        current: Pose,
        active: bool,
        may_publish: bool,
    ) -> Option<Pose> {
        if !self.monitor.poll(now) || !active || self.is_interpolating() {
            return None;
        }
        if current == self.last_sampled {
            return None;
        }
        self.last_sampled = current;
        if may_publish {
            trace!(entity = %self.id, address = %self.address, "Local pose change");
            Some(current)
        } else {
            None
        }
    }

    /// Handles a pose addressed at this entity.
    ///
    /// `current` is the node's pose right now.
    pub fn receive_pose(
        &mut self,
        origin: SessionId,
        local: SessionId,
        pose: Pose,
        current: Pose,
        now: Duration,
    ) -> PoseReceipt {
        if origin == local {
            return PoseReceipt::IgnoredEcho;
        }
        if origin.is_replay() {
            // The last sample stays as it was, so an authority notices the
            // restored pose and republishes it to its peers.
            self.transition.reset(pose);
            return PoseReceipt::Restored;
        }

        self.last_sampled = pose;
        if pose == current && !self.is_interpolating() {
            return PoseReceipt::Unchanged;
        }
        self.transition.begin(current, pose, self.snap_duration, now);
        PoseReceipt::Interpolating
    }

    /// Stops the monitor. Pending interpolation is abandoned by dropping
    /// the entity.
    pub fn cancel(&self) {
        self.monitor.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.monitor.token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn entity() -> SyncedEntity {
        SyncedEntity::new(
            EntityId(0),
            NodeKey(1),
            "Model",
            Pose::default(),
            &SyncConfig::default(),
            Duration::ZERO,
        )
    }

    fn moved(x: f32) -> Pose {
        Pose::at(Vector3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let local = SessionId::from_seed(1);
        let mut e = entity();
        let receipt = e.receive_pose(local, local, moved(3.0), Pose::default(), Duration::ZERO);
        assert_eq!(receipt, PoseReceipt::IgnoredEcho);
        assert!(!e.is_interpolating());
        assert_eq!(*e.last_sampled(), Pose::default());
    }

    #[test]
    fn test_peer_pose_interpolates_and_is_not_republished() {
        let local = SessionId::from_seed(1);
        let peer = SessionId::from_seed(2);
        let mut e = entity();

        let receipt = e.receive_pose(peer, local, moved(3.0), Pose::default(), Duration::ZERO);
        assert_eq!(receipt, PoseReceipt::Interpolating);

        let mid = e.apply(Duration::from_millis(50)).unwrap();
        assert!(mid.position.x > 0.0 && mid.position.x < 3.0);
        let end = e.apply(Duration::from_millis(100)).unwrap();
        assert_eq!(end, moved(3.0));
        assert_eq!(e.apply(Duration::from_millis(150)), None);

        // Even as authority, the received pose is not a local change.
        assert_eq!(e.monitor(Duration::from_millis(500), end, true, true), None);
    }

    #[test]
    fn test_replayed_pose_restores_and_authority_republishes() {
        let local = SessionId::from_seed(1);
        let mut e = entity();

        let receipt = e.receive_pose(
            SessionId::REPLAY,
            local,
            moved(5.0),
            Pose::default(),
            Duration::ZERO,
        );
        assert_eq!(receipt, PoseReceipt::Restored);
        assert!(!e.is_interpolating());
        assert_eq!(*e.transition().current(), moved(5.0));

        assert_eq!(
            e.monitor(Duration::from_millis(500), moved(5.0), true, true),
            Some(moved(5.0))
        );
    }

    #[test]
    fn test_non_authority_samples_but_never_publishes() {
        let mut e = entity();
        assert_eq!(e.monitor(Duration::from_millis(500), moved(1.0), true, false), None);
        assert_eq!(*e.last_sampled(), moved(1.0));
    }

    #[test]
    fn test_monitor_respects_interval_and_activity() {
        let mut e = entity();
        assert_eq!(e.monitor(Duration::from_millis(100), moved(1.0), true, true), None);
        assert_eq!(e.monitor(Duration::from_millis(500), moved(1.0), false, true), None);
        assert_eq!(
            e.monitor(Duration::from_millis(1000), moved(1.0), true, true),
            Some(moved(1.0))
        );
        // Nothing changed since.
        assert_eq!(e.monitor(Duration::from_millis(1500), moved(1.0), true, true), None);
    }

    #[test]
    fn test_cancelled_monitor_is_silent() {
        let mut e = entity();
        e.cancel();
        assert!(e.cancellation_token().is_cancelled());
        assert_eq!(e.monitor(Duration::from_secs(2), moved(1.0), true, true), None);
    }

    #[test]
    fn test_same_pose_from_peer_is_unchanged() {
        let local = SessionId::from_seed(1);
        let peer = SessionId::from_seed(2);
        let mut e = entity();
        let receipt = e.receive_pose(peer, local, Pose::default(), Pose::default(), Duration::ZERO);
        assert_eq!(receipt, PoseReceipt::Unchanged);
    }
}
