//! Film

use crate::core::filter::Filter;
use crate::core::geometry::{Bounds2i, Point2f, Point2i};
use crate::core::common::{clamp, Float, Int};
use crate::core::spectrum::RGBSpectrum;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Serialized film description from a scene dump.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilmDescription {
    /// The overall image resolution in pixels.
    pub resolution: Point2i,

    /// Filter used for image reconstruction from samples.
    pub filter: Filter,

    /// Filename of the output image.
    pub filename: String,
}

/// A single film pixel: running weighted sum of sample contributions and
/// the sum of filter weights.
#[derive(Copy, Clone, Default)]
struct Pixel {
    contrib_sum: RGBSpectrum,
    filter_weight_sum: Float,
}

/// The sensing device of the simulated camera. The coordinator owns the
/// film; workers only ever produce `(p_film, L, weight)` triples.
pub struct Film {
    /// The overall image resolution in pixels.
    pub full_resolution: Point2i,

    /// Filter used for image reconstruction.
    pub filter: Filter,

    /// Filename of the output image.
    pub filename: String,

    pixels: Vec<Pixel>,
}

impl Film {
    /// Create a new film from its dumped description.
    ///
    /// * `desc` - The description.
    pub fn new(desc: &FilmDescription) -> Self {
        let n = (desc.resolution.x * desc.resolution.y).max(0) as usize;
        Self {
            full_resolution: desc.resolution,
            filter: desc.filter.clone(),
            filename: desc.filename.clone(),
            pixels: vec![Pixel::default(); n],
        }
    }

    /// Returns the bounds of pixels for which samples are generated.
    pub fn get_sample_bounds(&self) -> Bounds2i {
        Bounds2i::new(
            Point2i::new(0, 0),
            Point2i::new(self.full_resolution.x, self.full_resolution.y),
        )
    }

    /// Returns a fresh film tile covering the given pixel bounds.
    ///
    /// * `sample_bounds` - The pixel bounds.
    pub fn get_film_tile(&self, sample_bounds: Bounds2i) -> FilmTile {
        FilmTile::new(sample_bounds, self.filter.clone())
    }

    /// Merge a tile's accumulated samples into the film.
    ///
    /// * `tile` - The tile.
    pub fn merge_film_tile(&mut self, tile: FilmTile) {
        for p in tile.pixel_bounds.into_iter() {
            if !self.get_sample_bounds().contains_exclusive(&p) {
                continue;
            }
            let src = tile.pixel(&p);
            let idx = (p.y * self.full_resolution.x + p.x) as usize;
            self.pixels[idx].contrib_sum += src.contrib_sum;
            self.pixels[idx].filter_weight_sum += src.filter_weight_sum;
        }
    }

    /// Write the reconstructed image as a PNG file.
    ///
    /// * `path` - Output path; the film's filename is used when `None`.
    pub fn write_image(&self, path: Option<&Path>) -> Result<()> {
        let mut img = image::RgbImage::new(
            self.full_resolution.x.max(0) as u32,
            self.full_resolution.y.max(0) as u32,
        );
        for (x, y, out) in img.enumerate_pixels_mut() {
            let pixel = &self.pixels[(y * self.full_resolution.x as u32 + x) as usize];
            let rgb = if pixel.filter_weight_sum > 0.0 {
                (pixel.contrib_sum / pixel.filter_weight_sum).to_rgb()
            } else {
                [0.0; 3]
            };
            let to_srgb =
                |v: Float| (clamp(v, 0.0, 1.0).powf(1.0 / 2.2) * 255.0 + 0.5) as u8;
            *out = image::Rgb([to_srgb(rgb[0]), to_srgb(rgb[1]), to_srgb(rgb[2])]);
        }
        let target = path.unwrap_or_else(|| Path::new(&self.filename));
        img.save(target)
            .map_err(|e| crate::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    /// Returns the total filter weight accumulated so far, which is
    /// non-zero once any sample has landed.
    pub fn total_weight(&self) -> Float {
        self.pixels.iter().map(|p| p.filter_weight_sum).sum()
    }
}

/// A rectangular region of the film that samples are accumulated into
/// before being merged.
pub struct FilmTile {
    /// Pixel bounds covered by this tile.
    pub pixel_bounds: Bounds2i,

    filter: Filter,
    pixels: Vec<Pixel>,
}

impl FilmTile {
    fn new(pixel_bounds: Bounds2i, filter: Filter) -> Self {
        let n = pixel_bounds.area().max(0) as usize;
        Self {
            pixel_bounds,
            filter,
            pixels: vec![Pixel::default(); n],
        }
    }

    /// Add a sample's contribution to every pixel the filter support
    /// touches.
    ///
    /// * `p_film`        - Film-space sample position.
    /// * `l`             - Radiance carried by the sample.
    /// * `sample_weight` - Camera weight for the sample.
    pub fn add_sample(&mut self, p_film: Point2f, l: RGBSpectrum, sample_weight: Float) {
        let radius = self.filter.radius();
        let discrete = Point2f::new(p_film.x - 0.5, p_film.y - 0.5);
        let p0 = Point2i::new(
            (discrete.x - radius.x).ceil() as Int,
            (discrete.y - radius.y).ceil() as Int,
        );
        let p1 = Point2i::new(
            (discrete.x + radius.x).floor() as Int + 1,
            (discrete.y + radius.y).floor() as Int + 1,
        );
        let p0 = Point2i::new(p0.x.max(self.pixel_bounds.p_min.x), p0.y.max(self.pixel_bounds.p_min.y));
        let p1 = Point2i::new(p1.x.min(self.pixel_bounds.p_max.x), p1.y.min(self.pixel_bounds.p_max.y));

        for y in p0.y..p1.y {
            for x in p0.x..p1.x {
                let w = self.filter.evaluate(&Point2f::new(
                    x as Float - discrete.x,
                    y as Float - discrete.y,
                ));
                let pixel = self.pixel_mut(&Point2i::new(x, y));
                pixel.contrib_sum += l * sample_weight * w;
                pixel.filter_weight_sum += w;
            }
        }
    }

    fn index(&self, p: &Point2i) -> usize {
        let width = self.pixel_bounds.p_max.x - self.pixel_bounds.p_min.x;
        ((p.y - self.pixel_bounds.p_min.y) * width + (p.x - self.pixel_bounds.p_min.x)) as usize
    }

    fn pixel(&self, p: &Point2i) -> &Pixel {
        &self.pixels[self.index(p)]
    }

    fn pixel_mut(&mut self, p: &Point2i) -> &mut Pixel {
        let i = self.index(p);
        &mut self.pixels[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::Vector2f;

    fn film_desc(width: Int, height: Int) -> FilmDescription {
        FilmDescription {
            resolution: Point2i::new(width, height),
            filter: Filter::Box {
                radius: Vector2f::new(0.5, 0.5),
            },
            filename: "out.png".to_string(),
        }
    }

    #[test]
    fn sample_in_pixel_center_lands_in_that_pixel() {
        let film = Film::new(&film_desc(2, 2));
        let mut tile = film.get_film_tile(film.get_sample_bounds());
        tile.add_sample(Point2f::new(0.5, 0.5), RGBSpectrum::new(1.0), 1.0);
        assert!(tile.pixel(&Point2i::new(0, 0)).filter_weight_sum > 0.0);
        assert_eq!(tile.pixel(&Point2i::new(1, 1)).filter_weight_sum, 0.0);
    }

    #[test]
    fn merged_tile_contributes_weight_to_the_film() {
        let mut film = Film::new(&film_desc(4, 4));
        let mut tile = film.get_film_tile(film.get_sample_bounds());
        tile.add_sample(Point2f::new(2.5, 1.5), RGBSpectrum::new(0.25), 1.0);
        film.merge_film_tile(tile);
        assert!(film.total_weight() > 0.0);
    }
}
