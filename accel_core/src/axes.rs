use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn pick<T: Copy>(self, x: T, y: T, z: T) -> T {
        match self {
            Axis::X => x,
            Axis::Y => y,
            Axis::Z => z,
        }
    }
}

/// One output component: which input axis it comes from and whether it is negated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAxis {
    pub axis: Axis,
    pub negate: bool,
}

impl SignedAxis {
    pub const fn pos(axis: Axis) -> Self {
        Self {
            axis,
            negate: false,
        }
    }

    pub const fn neg(axis: Axis) -> Self {
        Self { axis, negate: true }
    }

    fn apply(self, x: f32, y: f32, z: f32) -> f32 {
        let value = self.axis.pick(x, y, z);
        if self.negate { -value } else { value }
    }
}

/// A signed permutation of the three axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMap {
    pub x: SignedAxis,
    pub y: SignedAxis,
    pub z: SignedAxis,
}

impl AxisMap {
    pub const IDENTITY: AxisMap = AxisMap {
        x: SignedAxis::pos(Axis::X),
        y: SignedAxis::pos(Axis::Y),
        z: SignedAxis::pos(Axis::Z),
    };

    pub fn apply(&self, x: f32, y: f32, z: f32) -> (f32, f32, f32) {
        (
            self.x.apply(x, y, z),
            self.y.apply(x, y, z),
            self.z.apply(x, y, z),
        )
    }
}

/// Converts device body-frame values into the application's world frame.
///
/// The sensor boards are mounted rotated relative to the scene, so every vector and quaternion
/// coming off the wire goes through this mapping before it reaches a track. Vectors and
/// quaternions carry separate maps because the device's orientation output does not share the
/// accelerometer's axis convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRemap {
    pub vector: AxisMap,
    pub quaternion: AxisMap,
    pub negate_w: bool,
}

impl Default for AxisRemap {
    /// Vectors `(x, y, z) -> (y, -x, z)`, quaternions `(w, x, y, z) -> (-w, y, -z, -x)`.
    fn default() -> Self {
        Self {
            vector: AxisMap {
                x: SignedAxis::pos(Axis::Y),
                y: SignedAxis::neg(Axis::X),
                z: SignedAxis::pos(Axis::Z),
            },
            quaternion: AxisMap {
                x: SignedAxis::pos(Axis::Y),
                y: SignedAxis::neg(Axis::Z),
                z: SignedAxis::neg(Axis::X),
            },
            negate_w: true,
        }
    }
}

impl AxisRemap {
    /// Passes everything through untouched.
    pub fn identity() -> Self {
        Self {
            vector: AxisMap::IDENTITY,
            quaternion: AxisMap::IDENTITY,
            negate_w: false,
        }
    }

    pub fn vector(&self, v: &Vector3<f32>) -> Vector3<f32> {
        let (x, y, z) = self.vector.apply(v.x, v.y, v.z);
        Vector3::new(x, y, z)
    }

    /// Remaps and normalizes `q`. A zero quaternion stays zero rather than turning into NaN.
    pub fn quaternion(&self, q: &Quaternion<f32>) -> Quaternion<f32> {
        let (x, y, z) = self.quaternion.apply(q.i, q.j, q.k);
        let w = if self.negate_w { -q.w } else { q.w };
        let remapped = Quaternion::new(w, x, y, z);
        remapped
            .coords
            .try_normalize(f32::EPSILON)
            .map_or(remapped, Quaternion::from_vector)
    }
}
