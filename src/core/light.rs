//! Lights

use crate::core::geometry::{Point2f, Point3f, Vector3f};
use crate::core::common::Float;
use crate::core::spectrum::RGBSpectrum;
use serde::{Deserialize, Serialize};

/// Distance used for lights at infinity; far beyond any treelet bound.
const WORLD_RADIUS: Float = 1.0e7;

/// An incident-radiance sample toward a light.
#[derive(Copy, Clone, Debug)]
pub struct LightSample {
    /// Incident radiance arriving from the light.
    pub li: RGBSpectrum,

    /// Direction from the reference point toward the light.
    pub wi: Vector3f,

    /// Probability of having sampled `wi`.
    pub pdf: Float,

    /// Distance to the light; bounds the shadow ray.
    pub dist: Float,
}

/// The closed set of light kinds a scene dump can name. Angular
/// modulation maps (goniometric and projection image lookups) live with
/// the texture system outside this crate, so those kinds reduce to their
/// positional falloff here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Light {
    Point {
        from: Point3f,
        intensity: RGBSpectrum,
    },
    Spot {
        from: Point3f,
        direction: Vector3f,
        intensity: RGBSpectrum,
        cos_falloff_start: Float,
        cos_total_width: Float,
    },
    Goniometric {
        from: Point3f,
        intensity: RGBSpectrum,
    },
    Projection {
        from: Point3f,
        direction: Vector3f,
        intensity: RGBSpectrum,
        cos_total_width: Float,
    },
    Distant {
        direction: Vector3f,
        radiance: RGBSpectrum,
    },
    Infinite {
        radiance: RGBSpectrum,
    },
}

impl Light {
    /// Sample the incident radiance at a reference point.
    ///
    /// * `p` - The reference point being shaded.
    /// * `u` - A 2D sample for lights that need a sampled direction.
    pub fn sample_li(&self, p: &Point3f, u: &Point2f) -> LightSample {
        match self {
            Light::Point { from, intensity }
            | Light::Goniometric { from, intensity } => {
                point_sample(p, from, intensity, 1.0)
            }
            Light::Spot {
                from,
                direction,
                intensity,
                cos_falloff_start,
                cos_total_width,
            } => {
                let to_point = (*p - *from).normalize();
                let cos_theta = to_point.dot(&direction.normalize());
                let falloff = if cos_theta < *cos_total_width {
                    0.0
                } else if cos_theta > *cos_falloff_start {
                    1.0
                } else {
                    let delta =
                        (cos_theta - cos_total_width) / (cos_falloff_start - cos_total_width);
                    (delta * delta) * (delta * delta)
                };
                point_sample(p, from, intensity, falloff)
            }
            Light::Projection {
                from,
                direction,
                intensity,
                cos_total_width,
            } => {
                let to_point = (*p - *from).normalize();
                let inside = to_point.dot(&direction.normalize()) >= *cos_total_width;
                point_sample(p, from, intensity, if inside { 1.0 } else { 0.0 })
            }
            Light::Distant {
                direction,
                radiance,
            } => LightSample {
                li: *radiance,
                wi: (-*direction).normalize(),
                pdf: 1.0,
                dist: WORLD_RADIUS,
            },
            Light::Infinite { radiance } => {
                // Uniform sphere direction from the 2D sample.
                let z = 1.0 - 2.0 * u.x;
                let r = (1.0 - z * z).max(0.0).sqrt();
                let phi = 2.0 * std::f32::consts::PI * u.y;
                LightSample {
                    li: *radiance,
                    wi: Vector3f::new(r * phi.cos(), r * phi.sin(), z),
                    pdf: 1.0 / (4.0 * std::f32::consts::PI),
                    dist: WORLD_RADIUS,
                }
            }
        }
    }
}

fn point_sample(
    p: &Point3f,
    from: &Point3f,
    intensity: &RGBSpectrum,
    scale: Float,
) -> LightSample {
    let to_light = *from - *p;
    let dist = to_light.length();
    let dist2 = (dist * dist).max(1e-6);
    LightSample {
        li: *intensity * (scale / dist2),
        wi: to_light.normalize(),
        pdf: 1.0,
        dist,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_light_falls_off_with_squared_distance() {
        let light = Light::Point {
            from: Point3f::new(0.0, 0.0, 2.0),
            intensity: RGBSpectrum::new(4.0),
        };
        let s = light.sample_li(&Point3f::new(0.0, 0.0, 0.0), &Point2f::new(0.5, 0.5));
        assert_eq!(s.li.to_rgb()[0], 1.0);
        assert_eq!(s.dist, 2.0);
        assert_eq!(s.wi, Vector3f::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn spot_light_is_dark_outside_the_cone() {
        let light = Light::Spot {
            from: Point3f::new(0.0, 0.0, 0.0),
            direction: Vector3f::new(0.0, 0.0, 1.0),
            intensity: RGBSpectrum::new(1.0),
            cos_falloff_start: 0.9,
            cos_total_width: 0.8,
        };
        let behind = light.sample_li(&Point3f::new(0.0, 0.0, -1.0), &Point2f::new(0.5, 0.5));
        assert!(behind.li.is_black());
        let ahead = light.sample_li(&Point3f::new(0.0, 0.0, 1.0), &Point2f::new(0.5, 0.5));
        assert!(!ahead.li.is_black());
    }

    #[test]
    fn light_names_round_trip_through_serde() {
        let json = r#"{"name":"distant","direction":{"x":0.0,"y":-1.0,"z":0.0},"radiance":{"c":[1.0,1.0,1.0]}}"#;
        let light: Light = serde_json::from_str(json).unwrap();
        assert!(matches!(light, Light::Distant { .. }));
    }
}
