//! Coordinate conversion between the authoring tool (Z up) and the target
//! format (Y up), plus the compact encodings used by the binary writer.

use glam::{Mat4, Quat, Vec3, Vec4};

/// Remap an authoring-space vector into target space: `(x, y, z) -> (x, z, -y)`.
///
/// This is a quarter rotation about X, so applying it twice does not give the
/// input back. Use [`unflip_space`] to undo it.
pub fn flip_space(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.z, -v.y)
}

/// Inverse of [`flip_space`]: `(x, y, z) -> (x, -z, y)`.
pub fn unflip_space(v: Vec3) -> Vec3 {
    Vec3::new(v.x, -v.z, v.y)
}

pub fn flip_array(v: Vec3) -> [f32; 3] {
    flip_space(v).to_array()
}

/// Build the three stored rows of an instance transform.
///
/// The forward matrix is rebuilt with the permuted rows `(r0, r2, -r1, r3)`
/// so the coordinate flip is baked in once per instance, then inverted to
/// obtain the world-to-instance matrix. Returns `None` for singular input.
pub fn instance_rows(world: &Mat4) -> Option<[[f32; 4]; 3]> {
    let flipped = Mat4::from_cols(world.row(0), world.row(2), -world.row(1), world.row(3)).transpose();
    if flipped.determinant() == 0.0 {
        return None;
    }
    let inv = flipped.inverse();
    if !inv.is_finite() {
        return None;
    }
    Some([
        inv.row(0).to_array(),
        inv.row(1).to_array(),
        inv.row(2).to_array(),
    ])
}

/// Rotation plus translation packed as a dual quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualQuat {
    pub real: Quat,
    pub dual: Quat,
}

impl DualQuat {
    pub const IDENTITY: DualQuat = DualQuat {
        real: Quat::IDENTITY,
        dual: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
    };

    /// Decompose an affine transform. Scale is discarded.
    pub fn from_transform(m: &Mat4) -> Self {
        let (_scale, rotation, translation) = m.to_scale_rotation_translation();
        Self::from_rotation_translation(rotation, translation)
    }

    pub fn from_rotation_translation(rotation: Quat, translation: Vec3) -> Self {
        let t = translation * 0.5;
        let dual = Quat::from_xyzw(t.x, t.y, t.z, 0.0) * rotation;
        DualQuat {
            real: rotation,
            dual,
        }
    }

    /// Recover the translation encoded in the dual part.
    pub fn translation(&self) -> Vec3 {
        let t = self.dual * self.real.conjugate();
        Vec3::new(t.x, t.y, t.z) * 2.0
    }

    /// Components in storage order: `q0` then `qe`, each as `(i, j, k, r)`.
    pub fn to_components(&self) -> [f32; 8] {
        let r = Vec4::from(self.real);
        let d = Vec4::from(self.dual);
        [r.x, r.y, r.z, r.w, d.x, d.y, d.z, d.w]
    }

    pub fn from_components(c: [f32; 8]) -> Self {
        DualQuat {
            real: Quat::from_xyzw(c[0], c[1], c[2], c[3]),
            dual: Quat::from_xyzw(c[4], c[5], c[6], c[7]),
        }
    }
}

const OCT_SCALE: f32 = 32767.0;

/// Pack a unit normal into 32 bits using the octahedral mapping.
///
/// The lower hemisphere is folded over the diagonals. Each axis is quantized
/// to a signed 16-bit value, `u` in the low half and `v` in the high half.
pub fn encode_octahedral(n: Vec3) -> u32 {
    let mut l1 = n.x.abs() + n.y.abs() + n.z.abs();
    if l1 == 0.0 {
        l1 = 1e-7;
    }
    let (u, v) = if n.z >= 0.0 {
        (n.x / l1, n.y / l1)
    } else {
        (
            (1.0 - n.y.abs() / l1) * sign_non_negative(n.x),
            (1.0 - n.x.abs() / l1) * sign_non_negative(n.y),
        )
    };
    let qu = (u * OCT_SCALE + 0.5).floor() as i32 as u16;
    let qv = (v * OCT_SCALE + 0.5).floor() as i32 as u16;
    u32::from(qu) | (u32::from(qv) << 16)
}

/// Inverse of [`encode_octahedral`]. Returns a normalized vector, or zero for
/// codes that decode to the origin.
pub fn decode_octahedral(code: u32) -> Vec3 {
    let u = f32::from((code & 0xFFFF) as u16 as i16) / OCT_SCALE;
    let v = f32::from((code >> 16) as u16 as i16) / OCT_SCALE;
    let z = 1.0 - u.abs() - v.abs();
    let (x, y) = if z >= 0.0 {
        (u, v)
    } else {
        (
            (1.0 - v.abs()) * sign_non_negative(u),
            (1.0 - u.abs()) * sign_non_negative(v),
        )
    };
    Vec3::new(x, y, z).normalize_or_zero()
}

fn sign_non_negative(x: f32) -> f32 {
    if x >= 0.0 { 1.0 } else { -1.0 }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Bounds of a point set. An empty set yields a zero-sized box at the origin.
    pub fn from_points(points: &[Vec3]) -> Self {
        let Some(first) = points.first() else {
            return Aabb {
                min: Vec3::ZERO,
                max: Vec3::ZERO,
            };
        };
        points.iter().fold(
            Aabb {
                min: *first,
                max: *first,
            },
            |acc, p| Aabb {
                min: acc.min.min(*p),
                max: acc.max.max(*p),
            },
        )
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}
