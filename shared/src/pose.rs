/// Position/orientation math for remote avatars.
/// Wire poses are plain arrays; these types exist for blending on the client.

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_array(a: [f64; 3]) -> Self {
        Self::new(a[0], a[1], a[2])
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Rotation quaternion stored XYZW, matching the wire order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn from_array(a: [f64; 4]) -> Self {
        Self::new(a[0], a[1], a[2], a[3])
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.x, self.y, self.z, self.w]
    }

    /// Rotation of `angle` radians around a unit `axis`.
    pub fn from_axis_angle(axis: Vec3, angle: f64) -> Self {
        let half = angle * 0.5;
        let s = half.sin();
        Self::new(axis.x * s, axis.y * s, axis.z * s, half.cos())
    }
}

/// A rendered or received avatar pose.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
    pub is_shouting: bool,
}

impl Pose {
    pub fn new(position: [f64; 3], rotation: [f64; 4], is_shouting: bool) -> Self {
        Self {
            position: Vec3::from_array(position),
            rotation: Quat::from_array(rotation),
            is_shouting,
        }
    }
}

/// Linear interpolation. t=0 returns a, t=1 returns b exactly.
pub fn lerp(a: Vec3, b: Vec3, t: f64) -> Vec3 {
    Vec3::new(
        a.x * (1.0 - t) + b.x * t,
        a.y * (1.0 - t) + b.y * t,
        a.z * (1.0 - t) + b.z * t,
    )
}

fn quat_dot(a: Quat, b: Quat) -> f64 {
    a.x * b.x + a.y * b.y + a.z * b.z + a.w * b.w
}

fn quat_normalize(q: Quat) -> Quat {
    let len = quat_dot(q, q).sqrt();
    if len < 1e-10 {
        return Quat::IDENTITY;
    }
    Quat::new(q.x / len, q.y / len, q.z / len, q.w / len)
}

/// Spherical linear interpolation between two rotations along the shorter arc.
/// t=0 returns a, t=1 returns b (or its negation, which is the same rotation).
pub fn slerp(a: Quat, b: Quat, t: f64) -> Quat {
    if t <= 0.0 {
        return a;
    }
    if t >= 1.0 {
        return b;
    }

    let mut d = quat_dot(a, b);
    let mut b = b;
    if d < 0.0 {
        d = -d;
        b = Quat::new(-b.x, -b.y, -b.z, -b.w);
    }

    // Nearly identical: nlerp avoids dividing by a vanishing sine
    if d > 0.9995 {
        return quat_normalize(Quat::new(
            a.x + t * (b.x - a.x),
            a.y + t * (b.y - a.y),
            a.z + t * (b.z - a.z),
            a.w + t * (b.w - a.w),
        ));
    }

    let theta = d.clamp(-1.0, 1.0).acos();
    let sin_theta = theta.sin();
    let s0 = ((1.0 - t) * theta).sin() / sin_theta;
    let s1 = (t * theta).sin() / sin_theta;

    Quat::new(
        s0 * a.x + s1 * b.x,
        s0 * a.y + s1 * b.y,
        s0 * a.z + s1 * b.z,
        s0 * a.w + s1 * b.w,
    )
}
