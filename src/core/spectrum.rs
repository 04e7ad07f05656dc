//! RGB spectra.

use crate::core::common::Float;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Mul};

/// An RGB spectrum.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RGBSpectrum {
    c: [Float; 3],
}

impl RGBSpectrum {
    /// The black spectrum.
    pub const BLACK: Self = Self { c: [0.0, 0.0, 0.0] };

    /// Create a spectrum with the same value in all channels.
    ///
    /// * `v` - The value.
    pub fn new(v: Float) -> Self {
        Self { c: [v, v, v] }
    }

    /// Create a spectrum from RGB values.
    ///
    /// * `rgb` - The RGB channel values.
    pub fn from_rgb(rgb: [Float; 3]) -> Self {
        Self { c: rgb }
    }

    /// Returns the RGB channel values.
    pub fn to_rgb(&self) -> [Float; 3] {
        self.c
    }

    /// Returns true if all channels are zero.
    pub fn is_black(&self) -> bool {
        self.c.iter().all(|&v| v == 0.0)
    }

    /// Returns true if any channel is NaN.
    pub fn has_nans(&self) -> bool {
        self.c.iter().any(|v| v.is_nan())
    }

    /// Returns the luminance of the spectrum.
    pub fn y(&self) -> Float {
        const W: [Float; 3] = [0.212671, 0.715160, 0.072169];
        self.c[0] * W[0] + self.c[1] * W[1] + self.c[2] * W[2]
    }
}

impl Add for RGBSpectrum {
    type Output = RGBSpectrum;

    fn add(self, other: Self) -> Self::Output {
        Self {
            c: [
                self.c[0] + other.c[0],
                self.c[1] + other.c[1],
                self.c[2] + other.c[2],
            ],
        }
    }
}

impl AddAssign for RGBSpectrum {
    fn add_assign(&mut self, other: Self) {
        for i in 0..3 {
            self.c[i] += other.c[i];
        }
    }
}

impl Mul for RGBSpectrum {
    type Output = RGBSpectrum;

    fn mul(self, other: Self) -> Self::Output {
        Self {
            c: [
                self.c[0] * other.c[0],
                self.c[1] * other.c[1],
                self.c[2] * other.c[2],
            ],
        }
    }
}

impl Mul<Float> for RGBSpectrum {
    type Output = RGBSpectrum;

    fn mul(self, s: Float) -> Self::Output {
        Self {
            c: [self.c[0] * s, self.c[1] * s, self.c[2] * s],
        }
    }
}

impl Div<Float> for RGBSpectrum {
    type Output = RGBSpectrum;

    fn div(self, s: Float) -> Self::Output {
        Self {
            c: [self.c[0] / s, self.c[1] / s, self.c[2] / s],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn black_is_black() {
        assert!(RGBSpectrum::BLACK.is_black());
        assert!(!RGBSpectrum::new(0.1).is_black());
    }

    #[test]
    fn luminance_of_white_is_one() {
        let y = RGBSpectrum::new(1.0).y();
        assert!((y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn nan_detection() {
        assert!(RGBSpectrum::from_rgb([0.0, Float::NAN, 0.0]).has_nans());
        assert!(!RGBSpectrum::new(1.0).has_nans());
    }
}
