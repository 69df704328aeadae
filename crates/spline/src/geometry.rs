//! Point and rectangle primitives shared by the fitter, builder and tessellator.
//!
//! The third coordinate of a [`Point3`] is the stroke radius at that sample. Vector
//! operations treat it like any other axis so that the fitter approximates position
//! and radius together.

use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

pub(crate) const GEOMETRY_EPSILON: f32 = 1e-12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    /// Stroke radius.
    pub z: f32,
}

impl Point3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn length_squared(self) -> f32 {
        self.dot(self)
    }

    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    pub fn distance(self, other: Self) -> f32 {
        (self - other).length()
    }

    pub fn distance_squared(self, other: Self) -> f32 {
        (self - other).length_squared()
    }

    /// Planar distance, ignoring the radius axis.
    pub fn distance_xy(self, other: Self) -> f32 {
        let delta_x = self.x - other.x;
        let delta_y = self.y - other.y;
        (delta_x * delta_x + delta_y * delta_y).sqrt()
    }

    /// Unit vector in the same direction. Vectors shorter than epsilon map to zero.
    pub fn normalized(self) -> Self {
        let length = self.length();
        if length <= GEOMETRY_EPSILON {
            return Self::ZERO;
        }
        self * (1.0 / length)
    }

    pub fn lerp(self, other: Self, t: f32) -> Self {
        self + (other - self) * t
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Point3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Point3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Point3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl SubAssign for Point3 {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul<f32> for Point3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Point3 {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Axis-aligned rectangle in canvas space.
///
/// An empty rectangle has `min > max` on both axes so that the first `union` or
/// `include_circle` adopts the other operand unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Default for Rect {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Rect {
    pub const EMPTY: Self = Self {
        min_x: f32::INFINITY,
        min_y: f32::INFINITY,
        max_x: f32::NEG_INFINITY,
        max_y: f32::NEG_INFINITY,
    };

    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn width(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.max_x - self.min_x
        }
    }

    pub fn height(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.max_y - self.min_y
        }
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn include_circle(&mut self, center_x: f32, center_y: f32, radius: f32) {
        let radius = radius.abs();
        self.min_x = self.min_x.min(center_x - radius);
        self.min_y = self.min_y.min(center_y - radius);
        self.max_x = self.max_x.max(center_x + radius);
        self.max_y = self.max_y.max(center_y + radius);
    }

    /// Grows the rectangle by a stroke sample: its xy position inflated by its radius.
    pub fn include_point(&mut self, point: Point3) {
        self.include_circle(point.x, point.y, point.z);
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_zero_vector_stays_zero() {
        assert_eq!(Point3::ZERO.normalized(), Point3::ZERO);
        let unit = Point3::new(3.0, 4.0, 0.0).normalized();
        assert!((unit.length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn distance_xy_ignores_radius() {
        let a = Point3::new(0.0, 0.0, 1.0);
        let b = Point3::new(3.0, 4.0, 10.0);
        assert_eq!(a.distance_xy(b), 5.0);
    }

    #[test]
    fn empty_rect_adopts_first_circle() {
        let mut rect = Rect::EMPTY;
        assert!(rect.is_empty());
        rect.include_circle(10.0, 20.0, -2.0);
        assert_eq!(rect, Rect::new(8.0, 18.0, 12.0, 22.0));
        assert_eq!(rect.union(&Rect::EMPTY), rect);
        assert!(rect.contains_rect(&Rect::EMPTY));
    }
}
