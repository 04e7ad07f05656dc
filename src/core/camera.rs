//! Cameras

use crate::core::film::FilmDescription;
use crate::core::geometry::{Point2f, Point3f, RayDifferential, RayDifferentials, Vector3f};
use crate::core::common::Float;
use serde::{Deserialize, Serialize};

/// All the sample values needed to generate a camera ray.
#[derive(Copy, Clone, Debug, Default)]
pub struct CameraSample {
    /// Film-space sample position.
    pub p_film: Point2f,

    /// Lens sample position.
    pub p_lens: Point2f,

    /// Time sample.
    pub time: Float,
}

/// Serialized camera description from a scene dump.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraDescription {
    /// Field of view in degrees along the shorter image axis.
    pub fov: Float,

    /// Time when the shutter opens.
    pub shutter_open: Float,

    /// Time when the shutter closes.
    pub shutter_close: Float,

    /// The film this camera exposes.
    pub film: FilmDescription,
}

/// A pinhole perspective camera at the origin looking down +z. The core
/// only needs camera-ray generation; lens models live with the
/// intersection kernel outside this crate.
pub struct PerspectiveCamera {
    /// The dumped description this camera was built from.
    pub desc: CameraDescription,

    tan_half_fov: Float,
}

impl PerspectiveCamera {
    /// Create a camera from its dumped description.
    ///
    /// * `desc` - The description.
    pub fn new(desc: CameraDescription) -> Self {
        let tan_half_fov = (desc.fov.to_radians() / 2.0).tan();
        Self { desc, tan_half_fov }
    }

    fn direction_for(&self, p_film: &Point2f) -> Vector3f {
        let res = self.desc.film.resolution;
        let aspect = res.x as Float / res.y as Float;
        // Map the film sample to [-1, 1] screen space, y flipped so the
        // image is not upside down.
        let sx = 2.0 * p_film.x / res.x as Float - 1.0;
        let sy = 1.0 - 2.0 * p_film.y / res.y as Float;
        let (scale_x, scale_y) = if aspect > 1.0 {
            (self.tan_half_fov * aspect, self.tan_half_fov)
        } else {
            (self.tan_half_fov, self.tan_half_fov / aspect)
        };
        Vector3f::new(sx * scale_x, sy * scale_y, 1.0).normalize()
    }

    /// Generate a camera ray with differentials for a film sample.
    /// Returns the ray and the weight its radiance contributes with.
    ///
    /// * `sample` - The camera sample.
    pub fn generate_ray_differential(&self, sample: &CameraSample) -> (RayDifferential, Float) {
        let o = Point3f::new(0.0, 0.0, 0.0);
        let d = self.direction_for(&sample.p_film);

        let dx = self.direction_for(&Point2f::new(sample.p_film.x + 1.0, sample.p_film.y));
        let dy = self.direction_for(&Point2f::new(sample.p_film.x, sample.p_film.y + 1.0));

        let mut ray = RayDifferential::new(o, d);
        ray.time = crate::core::common::lerp(
            sample.time,
            self.desc.shutter_open,
            self.desc.shutter_close,
        );
        ray.differentials = Some(RayDifferentials {
            rx_origin: o,
            ry_origin: o,
            rx_direction: dx,
            ry_direction: dy,
        });
        (ray, 1.0)
    }
}
