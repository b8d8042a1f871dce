//! Smooths remote avatars between positions snapshots.
//!
//! The server sends a snapshot every tick; each render frame advances a
//! shared blend factor by a fixed step, so with the default step a remote
//! avatar reaches the latest snapshot after 10 frames and then holds.

use plaza_shared::pose::{lerp, slerp, Pose, Quat, Vec3};
use plaza_shared::protocol::PositionsMsg;
use plaza_shared::PeerId;
use std::collections::HashMap;

pub const DEFAULT_LERP_STEP: f64 = 0.1;

/// Below this distance from 1 the blend factor counts as complete, so that
/// ten steps of 0.1 land exactly on the target.
const T_SNAP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
struct RemotePose {
    previous: Pose,
    desired: Pose,
    rendered: Pose,
}

impl RemotePose {
    fn at(pose: Pose) -> Self {
        Self {
            previous: pose,
            desired: pose,
            rendered: pose,
        }
    }
}

pub struct SnapshotInterpolator {
    step: f64,
    t: f64,
    peers: HashMap<PeerId, RemotePose>,
}

impl Default for SnapshotInterpolator {
    fn default() -> Self {
        Self::new(DEFAULT_LERP_STEP)
    }
}

impl SnapshotInterpolator {
    pub fn new(step: f64) -> Self {
        let step = if step.is_finite() && step > 0.0 {
            step
        } else {
            DEFAULT_LERP_STEP
        };
        Self {
            step,
            t: 1.0,
            peers: HashMap::new(),
        }
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Start tracking a remote at a known pose. Re-inserting resets it.
    pub fn insert(&mut self, id: PeerId, pose: Pose) {
        self.peers.insert(id, RemotePose::at(pose));
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        self.peers.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.t = 1.0;
    }

    /// New blend target. Each tracked remote blends from wherever it is
    /// currently drawn; ids not tracked yet (including our own) are skipped.
    pub fn apply_snapshot(&mut self, snapshot: &PositionsMsg) {
        self.t = 0.0;
        for (id, remote) in self.peers.iter_mut() {
            remote.previous = remote.rendered;
            if let Some(wire) = snapshot.positions.get(id) {
                remote.desired = Pose::new(wire.position, wire.rotation, wire.is_shouting);
            } else {
                remote.desired = remote.rendered;
            }
        }
    }

    /// Advance one render frame and recompute every rendered pose.
    pub fn advance_frame(&mut self) {
        let mut t = (self.t + self.step).min(1.0);
        if 1.0 - t < T_SNAP_EPSILON {
            t = 1.0;
        }
        self.t = t;

        for remote in self.peers.values_mut() {
            remote.rendered = Pose {
                position: lerp(remote.previous.position, remote.desired.position, t),
                rotation: slerp(remote.previous.rotation, remote.desired.rotation, t),
                is_shouting: remote.desired.is_shouting,
            };
        }
    }

    pub fn rendered(&self, id: &PeerId) -> Option<Pose> {
        self.peers.get(id).map(|r| r.rendered)
    }

    pub fn rendered_position(&self, id: &PeerId) -> Option<Vec3> {
        self.rendered(id).map(|p| p.position)
    }

    pub fn rendered_rotation(&self, id: &PeerId) -> Option<Quat> {
        self.rendered(id).map(|p| p.rotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plaza_shared::protocol::PoseWire;
    use std::collections::BTreeMap;
    use std::f64::consts::PI;

    fn snapshot(entries: &[(&str, [f64; 3], [f64; 4], bool)]) -> PositionsMsg {
        let positions: BTreeMap<PeerId, PoseWire> = entries
            .iter()
            .map(|(id, p, r, s)| {
                (
                    PeerId::from(*id),
                    PoseWire {
                        position: *p,
                        rotation: *r,
                        is_shouting: *s,
                    },
                )
            })
            .collect();
        PositionsMsg { positions }
    }

    fn at_origin() -> Pose {
        Pose::new([0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0], false)
    }

    #[test]
    fn reaches_target_exactly_after_ten_frames() {
        let mut interp = SnapshotInterpolator::default();
        interp.insert(PeerId::from("r"), at_origin());
        interp.apply_snapshot(&snapshot(&[("r", [10.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0], false)]));

        for _ in 0..5 {
            interp.advance_frame();
        }
        let half = interp.rendered_position(&PeerId::from("r")).unwrap();
        assert!((half.x - 5.0).abs() < 1e-9);

        for _ in 0..5 {
            interp.advance_frame();
        }
        assert_eq!(interp.t(), 1.0);
        assert_eq!(
            interp.rendered_position(&PeerId::from("r")),
            Some(Vec3::new(10.0, 0.0, 0.0))
        );
    }

    #[test]
    fn t_stays_clamped_without_new_snapshot() {
        let mut interp = SnapshotInterpolator::default();
        interp.insert(PeerId::from("r"), at_origin());
        interp.apply_snapshot(&snapshot(&[("r", [10.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0], false)]));
        for _ in 0..25 {
            interp.advance_frame();
        }
        assert_eq!(interp.t(), 1.0);
        assert_eq!(
            interp.rendered_position(&PeerId::from("r")),
            Some(Vec3::new(10.0, 0.0, 0.0))
        );
    }

    #[test]
    fn new_snapshot_blends_from_partially_reached_pose() {
        let mut interp = SnapshotInterpolator::default();
        let id = PeerId::from("r");
        interp.insert(id.clone(), at_origin());
        interp.apply_snapshot(&snapshot(&[("r", [10.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0], false)]));
        for _ in 0..4 {
            interp.advance_frame();
        }
        let reached = interp.rendered_position(&id).unwrap();
        assert!((reached.x - 4.0).abs() < 1e-9);

        interp.apply_snapshot(&snapshot(&[("r", [4.0, 0.0, 10.0], [0.0, 0.0, 0.0, 1.0], false)]));
        assert_eq!(interp.t(), 0.0);
        // No jump on the snapshot itself
        assert_eq!(interp.rendered_position(&id), Some(reached));

        interp.advance_frame();
        let p = interp.rendered_position(&id).unwrap();
        assert!((p.x - 4.0).abs() < 1e-9);
        assert!((p.z - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rotation_uses_slerp() {
        let mut interp = SnapshotInterpolator::new(0.5);
        let id = PeerId::from("r");
        interp.insert(id.clone(), at_origin());
        let quarter = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), PI / 2.0);
        interp.apply_snapshot(&snapshot(&[("r", [0.0; 3], quarter.to_array(), true)]));
        interp.advance_frame();

        let q = interp.rendered_rotation(&id).unwrap();
        let eighth = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), PI / 4.0);
        assert!((q.y - eighth.y).abs() < 1e-9);
        assert!((q.w - eighth.w).abs() < 1e-9);
        assert!(interp.rendered(&id).unwrap().is_shouting);
    }

    #[test]
    fn unknown_ids_in_snapshot_are_ignored() {
        let mut interp = SnapshotInterpolator::default();
        interp.insert(PeerId::from("r"), at_origin());
        interp.apply_snapshot(&snapshot(&[
            ("me", [5.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0], false),
            ("r", [1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0], false),
        ]));
        assert_eq!(interp.len(), 1);
        assert!(interp.rendered(&PeerId::from("me")).is_none());
    }

    #[test]
    fn remote_missing_from_snapshot_holds_still() {
        let mut interp = SnapshotInterpolator::default();
        let id = PeerId::from("r");
        interp.insert(id.clone(), Pose::new([3.0, 0.5, 1.0], [0.0, 0.0, 0.0, 1.0], false));
        interp.apply_snapshot(&PositionsMsg::default());
        for _ in 0..3 {
            interp.advance_frame();
        }
        assert_eq!(interp.rendered_position(&id), Some(Vec3::new(3.0, 0.5, 1.0)));
    }

    #[test]
    fn removed_remote_is_forgotten() {
        let mut interp = SnapshotInterpolator::default();
        interp.insert(PeerId::from("r"), at_origin());
        assert!(interp.remove(&PeerId::from("r")));
        assert!(!interp.remove(&PeerId::from("r")));
        assert!(interp.is_empty());
    }

    #[test]
    fn invalid_step_falls_back_to_default() {
        let mut interp = SnapshotInterpolator::new(0.0);
        interp.insert(PeerId::from("r"), at_origin());
        interp.apply_snapshot(&PositionsMsg::default());
        interp.advance_frame();
        assert!((interp.t() - DEFAULT_LERP_STEP).abs() < 1e-12);
    }
}
