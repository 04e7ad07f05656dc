//! 2D axis aligned bounding boxes.

use crate::core::geometry::{Point2, Point2i, Vector2};
use crate::core::common::{max, min, Int};
use itertools::{iproduct, Product};
use num_traits::Num;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// 2D axis aligned bounding box.
#[derive(Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds2<T: Num> {
    /// Minimum bounds.
    pub p_min: Point2<T>,

    /// Maximum bounds.
    pub p_max: Point2<T>,
}

/// 2D bounding box containing `Int` points. Used as a half-open pixel
/// rectangle: `p_max` is exclusive.
pub type Bounds2i = Bounds2<Int>;

impl<T: Num + PartialOrd + Copy> Bounds2<T> {
    /// Create a new 2D bounding box from 2 points. The minimum and maximum
    /// bounds are used for each coordinate axis.
    ///
    /// * `p1` - First point.
    /// * `p2` - Second point.
    pub fn new(p1: Point2<T>, p2: Point2<T>) -> Self {
        Self {
            p_min: Point2::new(min(p1.x, p2.x), min(p1.y, p2.y)),
            p_max: Point2::new(max(p1.x, p2.x), max(p1.y, p2.y)),
        }
    }

    /// Returns the vector along the box diagonal from the minimum point to
    /// the maximum point.
    pub fn diagonal(&self) -> Vector2<T> {
        self.p_max - self.p_min
    }

    /// Returns the area of the bounding box.
    pub fn area(&self) -> T {
        let d = self.diagonal();
        d.x * d.y
    }

    /// Returns true if a point is inside the bounding box. The upper
    /// boundary is considered out of bounds.
    ///
    /// * `p` - The point.
    pub fn contains_exclusive(&self, p: &Point2<T>) -> bool {
        p.x >= self.p_min.x && p.x < self.p_max.x && p.y >= self.p_min.y && p.y < self.p_max.y
    }

    /// Returns true if the half-open extents of another bounding box
    /// overlap with this one.
    ///
    /// * `other` - The other bounding box.
    pub fn overlaps(&self, other: &Self) -> bool {
        let x = self.p_max.x > other.p_min.x && self.p_min.x < other.p_max.x;
        let y = self.p_max.y > other.p_min.y && self.p_min.y < other.p_max.y;
        x && y
    }
}

impl<T: Num + fmt::Debug> fmt::Debug for Bounds2<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bounds2")
            .field("p_min", &self.p_min)
            .field("p_max", &self.p_max)
            .finish()
    }
}

impl<T: Num + fmt::Display> fmt::Display for Bounds2<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{({}, {}), ({}, {})}}",
            self.p_min.x, self.p_min.y, self.p_max.x, self.p_max.y
        )
    }
}

/// An iterator that steps through the integer coordinates in a bounding
/// box in a left-to-right (x-axis) and top-to-bottom (y-axis) scan order.
pub struct Bounds2iIterator {
    p: Product<Range<Int>, Range<Int>>,
}

impl IntoIterator for Bounds2i {
    type Item = Point2i;
    type IntoIter = Bounds2iIterator;

    fn into_iter(self) -> Self::IntoIter {
        Bounds2iIterator {
            p: iproduct!(self.p_min.y..self.p_max.y, self.p_min.x..self.p_max.x),
        }
    }
}

impl Iterator for Bounds2iIterator {
    type Item = Point2i;

    fn next(&mut self) -> Option<Self::Item> {
        self.p.next().map(|(y, x)| Point2i::new(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sorts_x_and_y_components() {
        let b = Bounds2::new(Point2::new(4, 1), Point2::new(2, 3));
        assert_eq!(b.p_min, Point2::new(2, 1));
        assert_eq!(b.p_max, Point2::new(4, 3));
    }

    #[test]
    fn area_is_product_of_diagonal_components() {
        let b = Bounds2i::new(Point2::new(1, 1), Point2::new(4, 3));
        assert_eq!(b.area(), 6);
    }

    #[test]
    fn contains_exclusive_rejects_upper_boundary() {
        let b = Bounds2i::new(Point2::new(0, 0), Point2::new(2, 2));
        assert!(b.contains_exclusive(&Point2::new(1, 1)));
        assert!(!b.contains_exclusive(&Point2::new(2, 1)));
        assert!(!b.contains_exclusive(&Point2::new(1, 2)));
    }

    #[test]
    fn half_open_boxes_sharing_an_edge_do_not_overlap() {
        let b1 = Bounds2i::new(Point2::new(0, 0), Point2::new(2, 4));
        let b2 = Bounds2i::new(Point2::new(2, 0), Point2::new(4, 4));
        assert!(!b1.overlaps(&b2));
    }

    #[test]
    fn iterate_bounds_in_scan_order() {
        let b = Bounds2i::new(Point2::new(0, 0), Point2::new(2, 2));
        let points: Vec<Point2i> = b.into_iter().collect();
        assert_eq!(
            points,
            vec![
                Point2::new(0, 0),
                Point2::new(1, 0),
                Point2::new(0, 1),
                Point2::new(1, 1)
            ]
        );
    }
}
