//! Filters

use crate::core::geometry::{Point2f, Vector2f};
use crate::core::common::Float;
use serde::{Deserialize, Serialize};

/// Image reconstruction filter. The closed set of kinds a scene dump can
/// name, with their evaluation functions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Filter {
    /// Box filter; equal weight within the radius.
    Box { radius: Vector2f },

    /// Triangle filter; weight falls off linearly.
    Triangle { radius: Vector2f },

    /// Gaussian filter.
    Gaussian { radius: Vector2f, alpha: Float },

    /// Mitchell-Netravali filter.
    Mitchell { radius: Vector2f, b: Float, c: Float },

    /// Windowed sinc filter.
    Sinc { radius: Vector2f, tau: Float },
}

impl Filter {
    /// Returns the filter's radius of support.
    pub fn radius(&self) -> Vector2f {
        match self {
            Filter::Box { radius }
            | Filter::Triangle { radius }
            | Filter::Gaussian { radius, .. }
            | Filter::Mitchell { radius, .. }
            | Filter::Sinc { radius, .. } => *radius,
        }
    }

    /// Evaluate the filter at a point relative to its center.
    ///
    /// * `p` - The sample point offset.
    pub fn evaluate(&self, p: &Point2f) -> Float {
        match self {
            Filter::Box { .. } => 1.0,
            Filter::Triangle { radius } => {
                (radius.x - p.x.abs()).max(0.0) * (radius.y - p.y.abs()).max(0.0)
            }
            Filter::Gaussian { radius, alpha } => {
                let g = |d: Float, r: Float| {
                    ((-alpha * d * d).exp() - (-alpha * r * r).exp()).max(0.0)
                };
                g(p.x, radius.x) * g(p.y, radius.y)
            }
            Filter::Mitchell { radius, b, c } => {
                mitchell_1d(p.x / radius.x, *b, *c) * mitchell_1d(p.y / radius.y, *b, *c)
            }
            Filter::Sinc { radius, tau } => {
                windowed_sinc(p.x, radius.x, *tau) * windowed_sinc(p.y, radius.y, *tau)
            }
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::Box {
            radius: Vector2f::new(0.5, 0.5),
        }
    }
}

fn mitchell_1d(x: Float, b: Float, c: Float) -> Float {
    let x = (2.0 * x).abs();
    if x > 1.0 {
        ((-b - 6.0 * c) * x * x * x
            + (6.0 * b + 30.0 * c) * x * x
            + (-12.0 * b - 48.0 * c) * x
            + (8.0 * b + 24.0 * c))
            * (1.0 / 6.0)
    } else {
        ((12.0 - 9.0 * b - 6.0 * c) * x * x * x
            + (-18.0 + 12.0 * b + 6.0 * c) * x * x
            + (6.0 - 2.0 * b))
            * (1.0 / 6.0)
    }
}

fn sinc(x: Float) -> Float {
    let x = x.abs();
    if x < 1e-5 {
        1.0
    } else {
        (std::f32::consts::PI * x).sin() / (std::f32::consts::PI * x)
    }
}

fn windowed_sinc(x: Float, radius: Float, tau: Float) -> Float {
    let x = x.abs();
    if x > radius {
        0.0
    } else {
        sinc(x) * sinc(x / tau)
    }
}
