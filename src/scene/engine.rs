//! The local traversal and shading engine.
//!
//! The intersection kernel proper lives outside this crate; workers only
//! depend on the `TraceEngine` seam. The bundled `TreeletGraph` engine
//! traces against dumped treelet payloads that describe, per treelet, the
//! child treelets a ray continues into and an optional surface the ray
//! can intersect, which is enough to exercise the full distributed
//! traversal, shading, and shadow-ray machinery end to end.

use crate::core::light::Light;
use crate::core::common::{Float, INV_PI};
use crate::core::sampler::PixelSampler;
use crate::core::spectrum::RGBSpectrum;
use crate::core::geometry::{RayDifferential, Vector3f};
use crate::error::Result;
use crate::rays::{RayState, TreeletId, TreeletNode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Global render settings from the dumped scene object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneDescription {
    /// Maximum path depth.
    pub max_depth: u32,
}

impl Default for SceneDescription {
    fn default() -> Self {
        Self { max_depth: 5 }
    }
}

/// A surface a ray can intersect inside a treelet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Surface {
    /// Ray parameter at which the surface is hit.
    pub t: Float,

    /// Lambertian albedo.
    pub albedo: RGBSpectrum,
}

/// The dumped payload of one treelet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TreeletPayload {
    /// Treelets a ray continues into after traversing this one.
    #[serde(default)]
    pub children: Vec<TreeletId>,

    /// Surface intersected inside this treelet, if any.
    #[serde(default)]
    pub surface: Option<Surface>,
}

/// The seam between the worker runtime and the intersection kernel.
pub trait TraceEngine {
    /// Advance a ray through the locally held treelets: pops and pushes
    /// traversal frames and records a hit when an intersection is found.
    /// Traversal stops at the first frame naming a treelet this engine
    /// does not hold.
    fn trace(&self, ray: RayState) -> RayState;

    /// Shade a ray whose traversal finished with a hit, producing zero or
    /// more follow-up rays: possibly a continuation bounce and possibly a
    /// shadow ray toward a sampled light.
    fn shade(&self, ray: RayState, lights: &[Light], sampler: &mut PixelSampler)
        -> Vec<RayState>;
}

/// Engine over the dumped treelet graph.
#[derive(Default)]
pub struct TreeletGraph {
    treelets: HashMap<TreeletId, TreeletPayload>,
}

impl TreeletGraph {
    /// Create an engine holding no treelets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a treelet payload to the held set.
    ///
    /// * `id`      - The treelet id.
    /// * `payload` - The payload.
    pub fn add_treelet(&mut self, id: TreeletId, payload: TreeletPayload) {
        self.treelets.insert(id, payload);
    }

    /// Load a treelet payload from a dump file and add it.
    ///
    /// * `id`   - The treelet id.
    /// * `path` - Path to the payload file.
    pub fn load_treelet(&mut self, id: TreeletId, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.add_treelet(id, serde_json::from_slice(&bytes)?);
        Ok(())
    }

    /// Returns true if this engine holds the given treelet.
    pub fn contains(&self, id: TreeletId) -> bool {
        self.treelets.contains_key(&id)
    }
}

impl TraceEngine for TreeletGraph {
    fn trace(&self, mut ray: RayState) -> RayState {
        while let Some(top) = ray.to_visit.last() {
            let Some(treelet) = self.treelets.get(&top.treelet) else {
                break;
            };
            let frame = ray.to_visit.pop().unwrap();

            if let Some(surface) = &treelet.surface {
                if surface.t < ray.ray.t_max {
                    ray.ray.t_max = surface.t;
                    ray.hit = Some(TreeletNode {
                        treelet: frame.treelet,
                        node: frame.node,
                        transform: None,
                    });
                }
            }

            for child in treelet.children.iter().rev() {
                ray.to_visit.push(TreeletNode::new(*child));
            }
        }
        ray
    }

    fn shade(
        &self,
        ray: RayState,
        lights: &[Light],
        sampler: &mut PixelSampler,
    ) -> Vec<RayState> {
        let mut new_rays = Vec::new();

        let hit = ray
            .hit
            .as_ref()
            .expect("shade called without a hit record");
        let Some(surface) = self
            .treelets
            .get(&hit.treelet)
            .and_then(|t| t.surface.as_ref())
        else {
            return new_rays;
        };

        let hit_point = ray.ray.at(ray.ray.t_max);
        let albedo = surface.albedo;

        sampler.start_pixel(&ray.sample.pixel);
        sampler.set_sample_number(ray.sample.num);

        if ray.remaining_bounces > 0 {
            let u = sampler.get_2d();
            let wi = uniform_sphere(u.x, u.y);
            let f = albedo * INV_PI;
            let pdf = 1.0 / (4.0 * std::f32::consts::PI);

            if !f.is_black() && pdf > 0.0 {
                let mut bounce = RayState {
                    sample: ray.sample.clone(),
                    ray: RayDifferential::new(hit_point, wi),
                    beta: ray.beta * f * (wi.z.abs() / pdf),
                    bounces: ray.bounces + 1,
                    remaining_bounces: ray.remaining_bounces - 1,
                    ..RayState::default()
                };
                bounce.start_trace();
                new_rays.push(bounce);
            }
        }

        if !lights.is_empty() && !albedo.is_black() {
            let n_lights = lights.len();
            let light_select_pdf = 1.0 / n_lights as Float;
            let index = ((sampler.get_1d() * n_lights as Float) as usize).min(n_lights - 1);
            let u_light = sampler.get_2d();

            let light_sample = lights[index].sample_li(&hit_point, &u_light);
            if light_sample.pdf > 0.0 && !light_sample.li.is_black() {
                let f = albedo * INV_PI * light_sample.wi.z.abs();
                if !f.is_black() {
                    let mut shadow_ray = RayDifferential::new(hit_point, light_sample.wi);
                    shadow_ray.t_max = light_sample.dist;

                    let mut shadow = RayState {
                        sample: ray.sample.clone(),
                        ray: shadow_ray,
                        beta: ray.beta,
                        ld: f * light_sample.li * (1.0 / light_sample.pdf)
                            * (1.0 / light_select_pdf),
                        bounces: ray.bounces,
                        remaining_bounces: 0,
                        is_shadow_ray: true,
                        ..RayState::default()
                    };
                    shadow.start_trace();
                    new_rays.push(shadow);
                }
            }
        }

        new_rays
    }
}

fn uniform_sphere(u1: Float, u2: Float) -> Vector3f {
    let z = 1.0 - 2.0 * u1;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * std::f32::consts::PI * u2;
    Vector3f::new(r * phi.cos(), r * phi.sin(), z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{Point2i, Point3f};
    use crate::core::sampler::{SamplerDescription, SamplerKind};

    fn camera_ray() -> RayState {
        let mut ray = RayState {
            ray: RayDifferential::new(
                Point3f::new(0.0, 0.0, 0.0),
                Vector3f::new(0.0, 0.0, 1.0),
            ),
            remaining_bounces: 2,
            ..RayState::default()
        };
        ray.sample.pixel = Point2i::new(1, 1);
        ray.start_trace();
        ray
    }

    fn sampler() -> PixelSampler {
        PixelSampler::new(&SamplerDescription {
            kind: SamplerKind::Random,
            samples_per_pixel: 1,
        })
    }

    #[test]
    fn trace_stops_at_a_treelet_the_engine_does_not_hold() {
        let mut engine = TreeletGraph::new();
        engine.add_treelet(
            0,
            TreeletPayload {
                children: vec![1],
                surface: None,
            },
        );

        let traced = engine.trace(camera_ray());
        assert_eq!(traced.current_treelet(), 1);
        assert!(traced.hit.is_none());
    }

    #[test]
    fn trace_records_the_nearest_surface_hit() {
        let mut engine = TreeletGraph::new();
        engine.add_treelet(
            0,
            TreeletPayload {
                children: vec![1, 2],
                surface: None,
            },
        );
        engine.add_treelet(
            1,
            TreeletPayload {
                children: vec![],
                surface: Some(Surface {
                    t: 5.0,
                    albedo: RGBSpectrum::new(0.5),
                }),
            },
        );
        engine.add_treelet(
            2,
            TreeletPayload {
                children: vec![],
                surface: Some(Surface {
                    t: 3.0,
                    albedo: RGBSpectrum::new(0.5),
                }),
            },
        );

        let traced = engine.trace(camera_ray());
        assert!(traced.to_visit.is_empty());
        assert_eq!(traced.hit.as_ref().unwrap().treelet, 2);
        assert_eq!(traced.ray.t_max, 3.0);
    }

    #[test]
    fn shade_produces_a_bounce_and_a_shadow_ray() {
        let mut engine = TreeletGraph::new();
        engine.add_treelet(
            1,
            TreeletPayload {
                children: vec![],
                surface: Some(Surface {
                    t: 2.0,
                    albedo: RGBSpectrum::new(0.8),
                }),
            },
        );

        let mut ray = camera_ray();
        ray.to_visit.clear();
        ray.hit = Some(TreeletNode::new(1));
        ray.ray.t_max = 2.0;

        let lights = vec![Light::Point {
            from: Point3f::new(0.0, 5.0, 2.0),
            intensity: RGBSpectrum::new(10.0),
        }];

        let new_rays = engine.shade(ray, &lights, &mut sampler());
        assert_eq!(new_rays.len(), 2);

        let shadow: Vec<_> = new_rays.iter().filter(|r| r.is_shadow_ray).collect();
        assert_eq!(shadow.len(), 1);
        assert!(!shadow[0].ld.is_black());

        let bounce: Vec<_> = new_rays.iter().filter(|r| !r.is_shadow_ray).collect();
        assert_eq!(bounce.len(), 1);
        assert_eq!(bounce[0].remaining_bounces, 1);
        assert_eq!(bounce[0].current_treelet(), 0);
    }

    #[test]
    fn shade_with_no_remaining_bounces_spawns_no_continuation() {
        let mut engine = TreeletGraph::new();
        engine.add_treelet(
            1,
            TreeletPayload {
                children: vec![],
                surface: Some(Surface {
                    t: 1.0,
                    albedo: RGBSpectrum::new(0.8),
                }),
            },
        );

        let mut ray = camera_ray();
        ray.remaining_bounces = 0;
        ray.to_visit.clear();
        ray.hit = Some(TreeletNode::new(1));

        let new_rays = engine.shade(ray, &[], &mut sampler());
        assert!(new_rays.is_empty());
    }
}
