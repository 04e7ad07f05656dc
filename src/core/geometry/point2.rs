//! 2D points and vectors.

use crate::core::common::{Float, Int};
use num_traits::Num;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub};

/// A 2D point.
#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point2<T: Num> {
    pub x: T,
    pub y: T,
}

/// 2D point containing `Float` coordinates.
pub type Point2f = Point2<Float>;

/// 2D point containing `Int` coordinates.
pub type Point2i = Point2<Int>;

impl<T: Num> Point2<T> {
    /// Create a new 2D point.
    ///
    /// * `x` - X-coordinate.
    /// * `y` - Y-coordinate.
    pub fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

impl From<Point2i> for Point2f {
    fn from(p: Point2i) -> Self {
        Self::new(p.x as Float, p.y as Float)
    }
}

impl<T: Num> Add<Vector2<T>> for Point2<T> {
    type Output = Point2<T>;

    fn add(self, v: Vector2<T>) -> Self::Output {
        Point2::new(self.x + v.x, self.y + v.y)
    }
}

impl<T: Num> Sub for Point2<T> {
    type Output = Vector2<T>;

    fn sub(self, other: Self) -> Self::Output {
        Vector2::new(self.x - other.x, self.y - other.y)
    }
}

/// A 2D vector.
#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vector2<T: Num> {
    pub x: T,
    pub y: T,
}

/// 2D vector containing `Float` components.
pub type Vector2f = Vector2<Float>;

/// 2D vector containing `Int` components.
pub type Vector2i = Vector2<Int>;

impl<T: Num> Vector2<T> {
    /// Create a new 2D vector.
    ///
    /// * `x` - X-component.
    /// * `y` - Y-component.
    pub fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

impl<T: Num> Add for Vector2<T> {
    type Output = Vector2<T>;

    fn add(self, other: Self) -> Self::Output {
        Vector2::new(self.x + other.x, self.y + other.y)
    }
}

impl<T: Num> AddAssign for Vector2<T>
where
    T: Copy,
{
    fn add_assign(&mut self, other: Self) {
        self.x = self.x + other.x;
        self.y = self.y + other.y;
    }
}

impl<T: Num + Copy> Mul<T> for Vector2<T> {
    type Output = Vector2<T>;

    fn mul(self, s: T) -> Self::Output {
        Vector2::new(self.x * s, self.y * s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_minus_point_is_a_vector() {
        let d = Point2::new(3, 5) - Point2::new(1, 1);
        assert_eq!(d, Vector2::new(2, 4));
    }

    #[test]
    fn point_plus_vector_is_a_point() {
        let p = Point2::new(3.0, 5.0) + Vector2::new(1.0, -1.0);
        assert_eq!(p, Point2::new(4.0, 4.0));
    }
}
