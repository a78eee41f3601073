use core::ops::{Add, Mul, Sub};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    /// Sentinel stored by an unset vector key.
    pub const INVALID: Vec3 = Vec3::new(f32::MAX, f32::MAX, f32::MAX);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Vec3) -> f32 {
        (other - self).length()
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.z.to_le_bytes());
        out
    }

    pub(crate) fn from_le_slice(raw: &[u8]) -> Self {
        Self::new(
            read_f32(&raw[0..4]),
            read_f32(&raw[4..8]),
            read_f32(&raw[8..12]),
        )
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rotator {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

impl Rotator {
    pub const ZERO: Rotator = Rotator::new(0.0, 0.0, 0.0);
    pub const INVALID: Rotator = Rotator::new(f32::MAX, f32::MAX, f32::MAX);

    pub const fn new(pitch: f32, yaw: f32, roll: f32) -> Self {
        Self { pitch, yaw, roll }
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 12] {
        Vec3::new(self.pitch, self.yaw, self.roll).to_le_bytes()
    }

    pub(crate) fn from_le_slice(raw: &[u8]) -> Self {
        let v = Vec3::from_le_slice(raw);
        Self::new(v.x, v.y, v.z)
    }
}

pub(crate) fn read_f32(raw: &[u8]) -> f32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[..4]);
    f32::from_le_bytes(bytes)
}
