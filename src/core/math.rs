//! World-space point and vector arithmetic.
//!
//! Coordinates are double precision throughout the host side of the map;
//! voxel keys are derived from `f64` values relative to the map origin so
//! that precision does not degrade far from the origin. The batched device
//! path narrows to `f32` only after re-basing rays onto the map origin.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Index, Mul, Neg, Sub};

/// A point or vector in world space (metres, f64).
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    /// X coordinate in metres.
    pub x: f64,
    /// Y coordinate in metres.
    pub y: f64,
    /// Z coordinate in metres.
    pub z: f64,
}

impl Point3 {
    /// Origin point.
    pub const ZERO: Point3 = Point3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Create a new point.
    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Create a point with all components equal.
    #[inline]
    pub fn splat(v: f64) -> Self {
        Self { x: v, y: v, z: v }
    }

    /// Euclidean length as a vector from the origin.
    #[inline]
    pub fn length(&self) -> f64 {
        self.length_squared().sqrt()
    }

    /// Squared length (avoids the sqrt).
    #[inline]
    pub fn length_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Euclidean distance to another point.
    #[inline]
    pub fn distance(&self, other: &Point3) -> f64 {
        (*self - *other).length()
    }

    /// Dot product with another vector.
    #[inline]
    pub fn dot(&self, other: &Point3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Largest absolute component (L-infinity norm).
    #[inline]
    pub fn max_abs_component(&self) -> f64 {
        self.x.abs().max(self.y.abs()).max(self.z.abs())
    }

    /// Narrow to an `f32` triple for device staging buffers.
    #[inline]
    pub fn to_f32_array(&self) -> [f32; 3] {
        [self.x as f32, self.y as f32, self.z as f32]
    }

    /// Widen an `f32` triple back to a point.
    #[inline]
    pub fn from_f32_array(v: [f32; 3]) -> Self {
        Self::new(f64::from(v[0]), f64::from(v[1]), f64::from(v[2]))
    }
}

impl Add for Point3 {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Point3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Point3 {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Point3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f64> for Point3 {
    type Output = Self;

    #[inline]
    fn mul(self, scalar: f64) -> Self {
        Point3::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Neg for Point3 {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Point3::new(-self.x, -self.y, -self.z)
    }
}

impl Index<usize> for Point3 {
    type Output = f64;

    #[inline]
    fn index(&self, axis: usize) -> &f64 {
        match axis {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("axis out of range: {}", axis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_point_arithmetic() {
        let a = Point3::new(1.0, 2.0, 3.0);
        let b = Point3::new(4.0, 5.0, 6.0);

        let sum = a + b;
        assert_relative_eq!(sum.x, 5.0);
        assert_relative_eq!(sum.y, 7.0);
        assert_relative_eq!(sum.z, 9.0);

        let diff = b - a;
        assert_relative_eq!(diff.x, 3.0);

        let scaled = a * 2.0;
        assert_relative_eq!(scaled.z, 6.0);
    }

    #[test]
    fn test_point_length() {
        let v = Point3::new(3.0, 4.0, 12.0);
        assert_relative_eq!(v.length(), 13.0);
        assert_relative_eq!(v.length_squared(), 169.0);
    }

    #[test]
    fn test_point_indexing() {
        let v = Point3::new(1.0, 2.0, 3.0);
        assert_eq!(v[0], 1.0);
        assert_eq!(v[1], 2.0);
        assert_eq!(v[2], 3.0);
    }

    #[test]
    fn test_f32_round_trip() {
        let v = Point3::new(1.5, -2.25, 0.125);
        let narrowed = Point3::from_f32_array(v.to_f32_array());
        assert_eq!(narrowed, v);
    }
}
