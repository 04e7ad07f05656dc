//! Rays with differentials.

use crate::core::geometry::{Point3f, Vector3f};
use crate::core::common::Float;

/// Differential origins and directions for a camera ray, offset one pixel
/// in each film direction.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RayDifferentials {
    pub rx_origin: Point3f,
    pub ry_origin: Point3f,
    pub rx_direction: Vector3f,
    pub ry_direction: Vector3f,
}

/// A ray with optional differentials.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RayDifferential {
    /// Origin.
    pub o: Point3f,

    /// Direction.
    pub d: Vector3f,

    /// Maximum extent of the ray.
    pub t_max: Float,

    /// Time value for motion blur.
    pub time: Float,

    /// Differentials, present on camera rays.
    pub differentials: Option<RayDifferentials>,
}

impl Default for RayDifferential {
    fn default() -> Self {
        Self {
            o: Point3f::default(),
            d: Vector3f::default(),
            t_max: Float::INFINITY,
            time: 0.0,
            differentials: None,
        }
    }
}

impl RayDifferential {
    /// Create a new ray from an origin and a direction.
    ///
    /// * `o` - Origin.
    /// * `d` - Direction.
    pub fn new(o: Point3f, d: Vector3f) -> Self {
        Self {
            o,
            d,
            ..Self::default()
        }
    }

    /// Returns the point at parameter `t` along the ray.
    ///
    /// * `t` - The parameter.
    pub fn at(&self, t: Float) -> Point3f {
        self.o + self.d * t
    }

    /// Scale the differentials to account for spacing between samples when
    /// multiple samples are taken per pixel.
    ///
    /// * `s` - The scale.
    pub fn scale_differentials(&mut self, s: Float) {
        if let Some(d) = self.differentials.as_mut() {
            d.rx_origin = self.o + (d.rx_origin - self.o) * s;
            d.ry_origin = self.o + (d.ry_origin - self.o) * s;
            d.rx_direction = self.d + (d.rx_direction - self.d) * s;
            d.ry_direction = self.d + (d.ry_direction - self.d) * s;
        }
    }
}
