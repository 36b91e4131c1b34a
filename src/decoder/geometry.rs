//! Small 3D helpers for triangulation: vectors, rays and rotations.

#[cfg(not(test))]
use micromath::F32Ext;

pub type Vec3 = [f32; 3];

/// Rays closer to parallel than this (squared sine of the angle) do not intersect usefully.
const PARALLEL_EPS: f32 = 1e-8;
/// Triangles with a smaller doubled area are treated as collinear, in m².
pub const COLLINEAR_EPS: f32 = 1e-6;

pub fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn scale(a: Vec3, k: f32) -> Vec3 {
    [a[0] * k, a[1] * k, a[2] * k]
}

pub fn dot(a: Vec3, b: Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn norm(a: Vec3) -> f32 {
    dot(a, a).sqrt()
}

pub fn normalize(a: Vec3) -> Option<Vec3> {
    let n = norm(a);
    if n > 0.0 && n.is_finite() {
        Some(scale(a, n.recip()))
    } else {
        None
    }
}

/// Row-major 3×3 matrix times vector.
pub fn mat_mul_vec(m: &[f32; 9], v: Vec3) -> Vec3 {
    [
        m[0] * v[0] + m[1] * v[1] + m[2] * v[2],
        m[3] * v[0] + m[4] * v[1] + m[5] * v[2],
        m[6] * v[0] + m[7] * v[1] + m[8] * v[2],
    ]
}

/// Direction of the ray towards a sensor seen at (`angle_h`, `angle_v`),
/// in station coordinates. The station looks down its −Z axis.
pub fn station_ray(angle_h: f32, angle_v: f32) -> Vec3 {
    [angle_h.tan(), angle_v.tan(), -1.0]
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClosestApproach {
    /// Midpoint of the shortest segment between the rays.
    pub point: Vec3,
    /// Length of that segment.
    pub distance: f32,
}

/// Closest approach of rays `o1 + s·d1` and `o2 + t·d2` (s, t > 0).
///
/// Returns `None` for (near) parallel rays or when the closest points lie
/// behind either origin.
pub fn closest_approach(o1: Vec3, d1: Vec3, o2: Vec3, d2: Vec3) -> Option<ClosestApproach> {
    let w0 = sub(o1, o2);
    let a = dot(d1, d1);
    let b = dot(d1, d2);
    let c = dot(d2, d2);
    let d = dot(d1, w0);
    let e = dot(d2, w0);
    let denom = a * c - b * b;
    if !(denom > PARALLEL_EPS * a * c) {
        return None;
    }
    let s = (b * e - c * d) / denom;
    let t = (a * e - b * d) / denom;
    if s <= 0.0 || t <= 0.0 {
        return None;
    }
    let p1 = add(o1, scale(d1, s));
    let p2 = add(o2, scale(d2, t));
    Some(ClosestApproach {
        point: scale(add(p1, p2), 0.5),
        distance: norm(sub(p1, p2)),
    })
}

pub fn centroid(points: &[Vec3]) -> Option<Vec3> {
    if points.is_empty() {
        return None;
    }
    let sum = points.iter().fold([0.0; 3], |acc, p| add(acc, *p));
    Some(scale(sum, (points.len() as f32).recip()))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

impl Quaternion {
    pub fn to_array(self) -> [f32; 4] {
        [self.w, self.x, self.y, self.z]
    }

    /// Quaternion of a row-major rotation matrix.
    pub fn from_rotation(m: &[f32; 9]) -> Self {
        let (m00, m01, m02) = (m[0], m[1], m[2]);
        let (m10, m11, m12) = (m[3], m[4], m[5]);
        let (m20, m21, m22) = (m[6], m[7], m[8]);
        let trace = m00 + m11 + m22;

        let q = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Self {
                w: 0.25 * s,
                x: (m21 - m12) / s,
                y: (m02 - m20) / s,
                z: (m10 - m01) / s,
            }
        } else if m00 > m11 && m00 > m22 {
            let s = (1.0 + m00 - m11 - m22).sqrt() * 2.0;
            Self {
                w: (m21 - m12) / s,
                x: 0.25 * s,
                y: (m01 + m10) / s,
                z: (m02 + m20) / s,
            }
        } else if m11 > m22 {
            let s = (1.0 + m11 - m00 - m22).sqrt() * 2.0;
            Self {
                w: (m02 - m20) / s,
                x: (m01 + m10) / s,
                y: 0.25 * s,
                z: (m12 + m21) / s,
            }
        } else {
            let s = (1.0 + m22 - m00 - m11).sqrt() * 2.0;
            Self {
                w: (m10 - m01) / s,
                x: (m02 + m20) / s,
                y: (m12 + m21) / s,
                z: 0.25 * s,
            }
        };
        q.normalized()
    }

    /// Unit quaternion with non-negative `w`.
    pub fn normalized(self) -> Self {
        let n = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if !(n > 0.0) {
            return Self::default();
        }
        let k = if self.w < 0.0 { -n.recip() } else { n.recip() };
        Self {
            w: self.w * k,
            x: self.x * k,
            y: self.y * k,
            z: self.z * k,
        }
    }
}

/// Orthonormal frame spanned by three points, as matrix columns (e1, e2, e3).
fn triad(a: Vec3, b: Vec3, c: Vec3) -> Option<[Vec3; 3]> {
    let e1 = normalize(sub(b, a))?;
    let n = cross(sub(b, a), sub(c, a));
    if norm(n) < COLLINEAR_EPS {
        return None;
    }
    let e3 = normalize(n)?;
    let e2 = cross(e3, e1);
    Some([e1, e2, e3])
}

/// Rotation taking the object-frame triangle `local` onto the world-frame
/// triangle `world`, row-major. `None` when either triangle is degenerate.
pub fn rotation_between(local: [Vec3; 3], world: [Vec3; 3]) -> Option<[f32; 9]> {
    let l = triad(local[0], local[1], local[2])?;
    let w = triad(world[0], world[1], world[2])?;
    // R = W · Lᵀ
    let mut r = [0.0f32; 9];
    for row in 0..3 {
        for col in 0..3 {
            r[row * 3 + col] = (0..3).map(|k| w[k][row] * l[k][col]).sum();
        }
    }
    Some(r)
}
