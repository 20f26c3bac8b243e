//! Client-side coordinate transform applied to reported samples.
//!
//! The server always reports in its own frame. A session can rescale
//! positions and re-express everything in a frame of its choosing; the
//! server is never told about either.

use crate::types::{CameraSample, MarkerSample, Pose, RigidSample, IDENTITY_POSE};

/// Scale followed by a rigid transform: `p' = R(q) * (scale * p) + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientTransform {
    scale: f32,
    pose: Pose,
}

impl Default for ClientTransform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            pose: IDENTITY_POSE,
        }
    }
}

impl ClientTransform {
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = scale;
    }

    /// Load `[x, y, z, s, qx, qy, qz]`. The quaternion is normalized; a zero
    /// quaternion is treated as no rotation.
    pub fn set_pose(&mut self, pose: Pose) {
        let [x, y, z, s, qx, qy, qz] = pose;
        let norm = (s * s + qx * qx + qy * qy + qz * qz).sqrt();
        let q = if norm > f32::EPSILON {
            [s / norm, qx / norm, qy / norm, qz / norm]
        } else {
            [1.0, 0.0, 0.0, 0.0]
        };
        self.pose = [x, y, z, q[0], q[1], q[2], q[3]];
    }

    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.pose == IDENTITY_POSE
    }

    fn rotation(&self) -> [f32; 4] {
        [self.pose[3], self.pose[4], self.pose[5], self.pose[6]]
    }

    pub fn apply_point(&self, p: [f32; 3]) -> [f32; 3] {
        let scaled = [p[0] * self.scale, p[1] * self.scale, p[2] * self.scale];
        let r = rotate(self.rotation(), scaled);
        [r[0] + self.pose[0], r[1] + self.pose[1], r[2] + self.pose[2]]
    }

    pub fn apply_pose(&self, pose: Pose) -> Pose {
        let [x, y, z] = self.apply_point([pose[0], pose[1], pose[2]]);
        let q = multiply(self.rotation(), [pose[3], pose[4], pose[5], pose[6]]);
        [x, y, z, q[0], q[1], q[2], q[3]]
    }

    /// Samples that are not currently visible are left untouched.
    pub fn apply_markers(&self, samples: &mut [MarkerSample]) {
        if self.is_identity() {
            return;
        }
        for s in samples.iter_mut().filter(|s| s.is_visible()) {
            let [x, y, z] = self.apply_point([s.x, s.y, s.z]);
            s.x = x;
            s.y = y;
            s.z = z;
        }
    }

    pub fn apply_rigids(&self, samples: &mut [RigidSample]) {
        if self.is_identity() {
            return;
        }
        for s in samples.iter_mut().filter(|s| s.is_visible()) {
            s.pose = self.apply_pose(s.pose);
        }
    }

    pub fn apply_cameras(&self, samples: &mut [CameraSample]) {
        if self.is_identity() {
            return;
        }
        for s in samples.iter_mut() {
            s.pose = self.apply_pose(s.pose);
        }
    }
}

/// Hamilton product of scalar-first quaternions.
fn multiply(a: [f32; 4], b: [f32; 4]) -> [f32; 4] {
    let [aw, ax, ay, az] = a;
    let [bw, bx, by, bz] = b;
    [
        aw * bw - ax * bx - ay * by - az * bz,
        aw * bx + ax * bw + ay * bz - az * by,
        aw * by - ax * bz + ay * bw + az * bx,
        aw * bz + ax * by - ay * bx + az * bw,
    ]
}

/// Rotate `v` by unit quaternion `q`: `v + 2w(u × v) + 2u × (u × v)`.
fn rotate(q: [f32; 4], v: [f32; 3]) -> [f32; 3] {
    let [w, x, y, z] = q;
    let u = [x, y, z];
    let uv = cross(u, v);
    let uuv = cross(u, uv);
    [
        v[0] + 2.0 * (w * uv[0] + uuv[0]),
        v[1] + 2.0 * (w * uv[1] + uuv[1]),
        v[2] + 2.0 * (w * uv[2] + uuv[2]),
    ]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: [f32; 3], b: [f32; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_identity_is_noop() {
        let t = ClientTransform::default();
        assert!(t.is_identity());
        assert_eq!(t.apply_point([1.0, 2.0, 3.0]), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_scale_millimeters_to_meters() {
        let mut t = ClientTransform::default();
        t.set_scale(0.001);
        assert!(close(t.apply_point([1000.0, -250.0, 10.0]), [1.0, -0.25, 0.01]));
    }

    #[test]
    fn test_rotation_about_z() {
        // 90 degrees about +Z, then shift by (1, 0, 0).
        let h = std::f32::consts::FRAC_1_SQRT_2;
        let mut t = ClientTransform::default();
        t.set_pose([1.0, 0.0, 0.0, h, 0.0, 0.0, h]);
        assert!(close(t.apply_point([1.0, 0.0, 0.0]), [1.0, 1.0, 0.0]));

        let pose = t.apply_pose(IDENTITY_POSE);
        assert!(close([pose[0], pose[1], pose[2]], [1.0, 0.0, 0.0]));
        assert!((pose[3] - h).abs() < 1e-6 && (pose[6] - h).abs() < 1e-6);
    }

    #[test]
    fn test_set_pose_normalizes() {
        let mut t = ClientTransform::default();
        t.set_pose([0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0]);
        assert!(t.is_identity());
        t.set_pose([0.0; 7]);
        assert!(t.is_identity());
    }

    #[test]
    fn test_invisible_markers_untouched() {
        let mut t = ClientTransform::default();
        t.set_scale(2.0);
        let mut samples = [
            MarkerSample { x: 1.0, confidence: 1.0, ..Default::default() },
            MarkerSample { x: 1.0, confidence: -1.0, ..Default::default() },
        ];
        t.apply_markers(&mut samples);
        assert_eq!(samples[0].x, 2.0);
        assert_eq!(samples[1].x, 1.0);
    }
}
