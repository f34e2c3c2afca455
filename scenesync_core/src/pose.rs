//! Poses and pose interpolation.
//!
//! A [`PoseTransition`] eases a synchronized entity from wherever it is to
//! the last pose received from its authority, and snaps exactly onto the
//! target at the end so successive transitions never accumulate drift.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Local position, scale and orientation of a scene node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3<f32>,
    pub scale: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
}

impl Pose {
    pub fn new(position: Vector3<f32>, scale: Vector3<f32>, rotation: UnitQuaternion<f32>) -> Self {
        Self {
            position,
            scale,
            rotation,
        }
    }

    /// Identity rotation, unit scale, at `position`.
    pub fn at(position: Vector3<f32>) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Exact component-wise equality; no tolerance.
    pub fn same_as(&self, other: &Pose) -> bool {
        self.position == other.position
            && self.scale == other.scale
            && self.rotation.coords == other.rotation.coords
    }

    /// Interpolates towards `target`: linear for position and scale,
    /// spherical for orientation.
    pub fn lerp(&self, target: &Pose, t: f32) -> Pose {
        let rotation = self
            .rotation
            .try_slerp(&target.rotation, t, 1.0e-6)
            // Antipodal orientations have no unique great arc.
            .unwrap_or_else(|| self.rotation.nlerp(&target.rotation, t));

        Pose {
            position: self.position.lerp(&target.position, t),
            scale: self.scale.lerp(&target.scale, t),
            rotation,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            scale: Vector3::new(1.0, 1.0, 1.0),
            rotation: UnitQuaternion::identity(),
        }
    }
}

impl PartialEq for Pose {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

/// Interpolation state for one entity.
///
/// Idle when `previous == target`; `current` then equals both.
#[derive(Debug, Clone, Default)]
pub struct PoseTransition {
    previous: Pose,
    target: Pose,
    current: Pose,
    start: Duration,
    duration: Duration,
}

impl PoseTransition {
    /// Creates an idle transition resting at `pose`.
    pub fn new(pose: Pose) -> Self {
        Self {
            previous: pose,
            target: pose,
            current: pose,
            ..Self::default()
        }
    }

    /// Rests at `pose` without triggering a transition.
    ///
    /// Used on initial load and scene restoration.
    pub fn reset(&mut self, pose: Pose) {
        self.previous = pose;
        self.target = pose;
        self.current = pose;
    }

    /// Starts moving from `current` to `target` over `duration`.
    pub fn begin(&mut self, current: Pose, target: Pose, duration: Duration, now: Duration) {
        if target == current {
            self.reset(current);
            return;
        }
        self.previous = current;
        self.target = target;
        self.current = current;
        self.start = now;
        self.duration = duration;
    }

    /// Advances the interpolation to `now`.
    ///
    /// Returns true when the caller must write `current()` back to the
    /// entity, including the final write that lands exactly on the target.
    pub fn advance(&mut self, now: Duration) -> bool {
        if self.is_idle() {
            return false;
        }

        let elapsed = now.saturating_sub(self.start).as_secs_f32();
        let span = self.duration.as_secs_f32();
        let x = if span > 0.0 { elapsed / span } else { 1.0 };

        if x >= 1.0 {
            self.previous = self.target;
            self.current = self.target;
        } else {
            self.current = self.previous.lerp(&self.target, x);
        }
        true
    }

    pub fn is_idle(&self) -> bool {
        self.previous == self.target
    }

    pub fn current(&self) -> &Pose {
        &self.current
    }

    pub fn target(&self) -> &Pose {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    fn moved() -> Pose {
        Pose::new(
            Vector3::new(2.0, 4.0, -6.0),
            Vector3::new(2.0, 2.0, 2.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
        )
    }

    #[test]
    fn test_equality_is_exact() {
        let a = Pose::default();
        let mut b = a;
        assert_eq!(a, b);
        b.position.x += 1.0e-6;
        assert_ne!(a, b);
    }

    #[test]
    fn test_reset_is_idle() {
        let mut transition = PoseTransition::default();
        transition.reset(moved());
        assert!(transition.is_idle());
        assert!(!transition.advance(Duration::from_secs(10)));
        assert_eq!(*transition.current(), moved());
    }

    #[test]
    fn test_begin_with_same_pose_stays_idle() {
        let mut transition = PoseTransition::new(moved());
        transition.begin(moved(), moved(), Duration::from_millis(100), Duration::ZERO);
        assert!(transition.is_idle());
        assert!(!transition.advance(Duration::from_millis(50)));
    }

    #[test]
    fn test_halfway_interpolation() {
        let start = Pose::default();
        let mut transition = PoseTransition::new(start);
        transition.begin(start, moved(), Duration::from_secs(1), Duration::from_secs(10));

        assert!(transition.advance(Duration::from_millis(10_500)));
        let current = transition.current();
        assert_relative_eq!(current.position, Vector3::new(1.0, 2.0, -3.0), epsilon = 1.0e-5);
        assert_relative_eq!(current.scale, Vector3::new(1.5, 1.5, 1.5), epsilon = 1.0e-5);
        assert_relative_eq!(
            current.rotation.angle(),
            FRAC_PI_2 / 2.0,
            epsilon = 1.0e-5
        );
        assert!(!transition.is_idle());
    }

    #[test]
    fn test_converges_exactly_then_goes_quiet() {
        let start = Pose::default();
        let mut transition = PoseTransition::new(start);
        transition.begin(start, moved(), Duration::from_millis(100), Duration::ZERO);

        assert!(transition.advance(Duration::from_millis(30)));
        assert!(transition.advance(Duration::from_millis(100)));
        assert_eq!(*transition.current(), moved());
        assert!(transition.is_idle());

        assert!(!transition.advance(Duration::from_millis(200)));
        assert!(!transition.advance(Duration::from_millis(300)));
    }

    #[test]
    fn test_zero_duration_snaps() {
        let mut transition = PoseTransition::new(Pose::default());
        transition.begin(Pose::default(), moved(), Duration::ZERO, Duration::from_secs(1));
        assert!(transition.advance(Duration::from_secs(1)));
        assert_eq!(*transition.current(), moved());
    }

    #[test]
    fn test_antipodal_rotation_does_not_panic() {
        let a = Pose::default();
        let b = Pose {
            rotation: UnitQuaternion::from_euler_angles(0.0, std::f32::consts::PI, 0.0),
            ..Pose::default()
        };
        let mid = a.lerp(&b, 0.5);
        assert!(mid.rotation.coords.iter().all(|c| c.is_finite()));
    }
}
