//! Samplers

use crate::core::camera::CameraSample;
use crate::core::geometry::{Point2f, Point2i};
use crate::core::common::Float;
use crate::core::rng::Rng;
use serde::{Deserialize, Serialize};

/// The closed set of sampler kinds a scene dump can name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Halton,
    Sobol,
    Random,
    Stratified,
    MaxMinDist,
    #[serde(rename = "02sequence")]
    ZeroTwoSequence,
}

/// Serialized sampler description from a scene dump.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerDescription {
    /// Which sampler to build.
    pub kind: SamplerKind,

    /// Number of samples per pixel.
    pub samples_per_pixel: u32,
}

/// A pixel sampler. Every kind draws from a PCG stream seeded from
/// (kind, pixel, sample number), so restarting a pixel sample reproduces
/// the same sequence on any worker.
pub struct PixelSampler {
    /// Which sampler this stream stands in for.
    pub kind: SamplerKind,

    /// Number of samples per pixel.
    pub samples_per_pixel: u32,

    current_pixel: Point2i,
    current_sample: u32,
    rng: Rng,
}

impl PixelSampler {
    /// Create a sampler from its dumped description.
    ///
    /// * `desc` - The description.
    pub fn new(desc: &SamplerDescription) -> Self {
        let mut sampler = Self {
            kind: desc.kind,
            samples_per_pixel: desc.samples_per_pixel.max(1),
            current_pixel: Point2i::new(0, 0),
            current_sample: 0,
            rng: Rng::default(),
        };
        sampler.reseed();
        sampler
    }

    /// Start working on a given pixel; resets the sample number to 0.
    ///
    /// * `p` - The pixel.
    pub fn start_pixel(&mut self, p: &Point2i) {
        self.current_pixel = *p;
        self.set_sample_number(0);
    }

    /// Select the sample index within the current pixel.
    ///
    /// * `num` - The sample index.
    pub fn set_sample_number(&mut self, num: u32) {
        self.current_sample = num;
        self.reseed();
    }

    fn reseed(&mut self) {
        let mut seed = (self.kind as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        seed ^= (self.current_pixel.x as u64).wrapping_shl(40);
        seed ^= (self.current_pixel.y as u64).wrapping_shl(20);
        seed ^= self.current_sample as u64;
        self.rng = Rng::new(seed);
    }

    /// Returns the sample value for the next dimension.
    pub fn get_1d(&mut self) -> Float {
        self.rng.uniform_float()
    }

    /// Returns the sample values for the next two dimensions.
    pub fn get_2d(&mut self) -> Point2f {
        Point2f::new(self.rng.uniform_float(), self.rng.uniform_float())
    }

    /// Returns an initialized `CameraSample` for a given pixel.
    ///
    /// * `p_raster` - The pixel.
    pub fn get_camera_sample(&mut self, p_raster: &Point2i) -> CameraSample {
        let film_sample = self.get_2d();
        let p_film = Point2f::new(
            p_raster.x as Float + film_sample.x,
            p_raster.y as Float + film_sample.y,
        );
        let time = self.get_1d();
        let p_lens = self.get_2d();
        CameraSample {
            p_film,
            p_lens,
            time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> PixelSampler {
        PixelSampler::new(&SamplerDescription {
            kind: SamplerKind::Random,
            samples_per_pixel: 4,
        })
    }

    #[test]
    fn restarting_a_sample_reproduces_the_stream() {
        let mut s = sampler();
        s.start_pixel(&Point2i::new(3, 7));
        s.set_sample_number(2);
        let first = (s.get_1d(), s.get_2d());

        s.start_pixel(&Point2i::new(3, 7));
        s.set_sample_number(2);
        assert_eq!(first, (s.get_1d(), s.get_2d()));
    }

    #[test]
    fn different_pixels_get_different_streams() {
        let mut s = sampler();
        s.start_pixel(&Point2i::new(0, 0));
        let a = s.get_2d();
        s.start_pixel(&Point2i::new(1, 0));
        let b = s.get_2d();
        assert_ne!(a, b);
    }

    #[test]
    fn kind_names_round_trip_through_serde() {
        let json = serde_json::to_string(&SamplerKind::ZeroTwoSequence).unwrap();
        assert_eq!(json, "\"02sequence\"");
        let kind: SamplerKind = serde_json::from_str("\"maxmindist\"").unwrap();
        assert_eq!(kind, SamplerKind::MaxMinDist);
    }
}
