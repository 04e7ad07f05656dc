//! Ray state: the serialized continuation of an in-flight path sample.

use crate::core::geometry::{
    Matrix4x4, Point2f, Point2i, Point3f, RayDifferential, RayDifferentials, Vector3f,
};
use crate::core::common::Float;
use crate::core::spectrum::RGBSpectrum;
use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Identifier of a treelet; treelet 0 is the shared root placeholder held
/// by every worker.
pub type TreeletId = u32;

/// Identifier of a worker; the coordinator assigns them starting at 1 and
/// reserves 0 for itself.
pub type WorkerId = u64;

/// Stable identity of the path sample a ray belongs to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleState {
    /// Globally unique sample id within the render.
    pub id: u64,

    /// Sample index within the pixel.
    pub num: u32,

    /// The pixel this sample belongs to.
    pub pixel: Point2i,

    /// Film-space sample position.
    pub p_film: Point2f,

    /// Camera weight for the sample.
    pub weight: Float,
}

/// A traversal frame: the treelet this ray must enter next and the node
/// to resume at, with an optional instance transform.
#[derive(Clone, Debug, PartialEq)]
pub struct TreeletNode {
    /// The treelet to visit.
    pub treelet: TreeletId,

    /// Node index within the treelet to resume traversal at.
    pub node: u32,

    /// Local transform for instanced geometry, carried opaquely.
    pub transform: Option<Matrix4x4>,
}

impl TreeletNode {
    /// Create a frame pointing at the start of a treelet.
    ///
    /// * `treelet` - The treelet id.
    pub fn new(treelet: TreeletId) -> Self {
        Self {
            treelet,
            node: 0,
            transform: None,
        }
    }
}

/// The full state of an in-flight path sample. Moved between queues,
/// serialized for forwarding, and destroyed when reported finished; never
/// shared.
#[derive(Clone, Debug, PartialEq)]
pub struct RayState {
    /// Sample identity.
    pub sample: SampleState,

    /// The ray being traced.
    pub ray: RayDifferential,

    /// Stack of traversal frames; the top names the treelet this ray must
    /// be processed by next.
    pub to_visit: Vec<TreeletNode>,

    /// Deferred shading record. A set hit with an empty `to_visit` means
    /// the holder of the hit treelet must shade this ray.
    pub hit: Option<TreeletNode>,

    /// Path throughput.
    pub beta: RGBSpectrum,

    /// Direct-lighting contribution carried by shadow rays.
    pub ld: RGBSpectrum,

    /// Number of bounces completed.
    pub bounces: u32,

    /// Bounces this path may still take.
    pub remaining_bounces: u32,

    /// Shadow rays only test occlusion; a hit clears `ld`.
    pub is_shadow_ray: bool,
}

impl Default for RayState {
    fn default() -> Self {
        Self {
            sample: SampleState::default(),
            ray: RayDifferential::default(),
            to_visit: Vec::new(),
            hit: None,
            beta: RGBSpectrum::new(1.0),
            ld: RGBSpectrum::BLACK,
            bounces: 0,
            remaining_bounces: 0,
            is_shadow_ray: false,
        }
    }
}

impl RayState {
    /// Reset traversal to the root treelet, clearing any previous hit.
    pub fn start_trace(&mut self) {
        self.hit = None;
        self.to_visit = vec![TreeletNode::new(0)];
    }

    /// The treelet this ray must next be processed by: the top of the
    /// traversal stack, or the hit treelet once traversal is done.
    pub fn current_treelet(&self) -> TreeletId {
        if let Some(top) = self.to_visit.last() {
            top.treelet
        } else if let Some(hit) = &self.hit {
            hit.treelet
        } else {
            0
        }
    }

    /// Serialize to the wire record format.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(128);
        w.write_u64::<BigEndian>(self.sample.id).unwrap();
        w.write_u32::<BigEndian>(self.sample.num).unwrap();
        w.write_i32::<BigEndian>(self.sample.pixel.x).unwrap();
        w.write_i32::<BigEndian>(self.sample.pixel.y).unwrap();
        w.write_f32::<BigEndian>(self.sample.p_film.x).unwrap();
        w.write_f32::<BigEndian>(self.sample.p_film.y).unwrap();
        w.write_f32::<BigEndian>(self.sample.weight).unwrap();

        write_point3(&mut w, &self.ray.o);
        write_vector3(&mut w, &self.ray.d);
        w.write_f32::<BigEndian>(self.ray.t_max).unwrap();
        w.write_f32::<BigEndian>(self.ray.time).unwrap();
        match &self.ray.differentials {
            Some(d) => {
                w.write_u8(1).unwrap();
                write_point3(&mut w, &d.rx_origin);
                write_point3(&mut w, &d.ry_origin);
                write_vector3(&mut w, &d.rx_direction);
                write_vector3(&mut w, &d.ry_direction);
            }
            None => w.write_u8(0).unwrap(),
        }

        w.write_u16::<BigEndian>(self.to_visit.len() as u16).unwrap();
        for node in &self.to_visit {
            write_treelet_node(&mut w, node);
        }
        match &self.hit {
            Some(hit) => {
                w.write_u8(1).unwrap();
                write_treelet_node(&mut w, hit);
            }
            None => w.write_u8(0).unwrap(),
        }

        write_spectrum(&mut w, &self.beta);
        write_spectrum(&mut w, &self.ld);
        w.write_u32::<BigEndian>(self.bounces).unwrap();
        w.write_u32::<BigEndian>(self.remaining_bounces).unwrap();
        w.write_u8(self.is_shadow_ray as u8).unwrap();
        w
    }

    /// Deserialize from the wire record format.
    ///
    /// * `bytes` - The record bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        let mut state = RayState::default();

        state.sample.id = read(r.read_u64::<BigEndian>())?;
        state.sample.num = read(r.read_u32::<BigEndian>())?;
        state.sample.pixel.x = read(r.read_i32::<BigEndian>())?;
        state.sample.pixel.y = read(r.read_i32::<BigEndian>())?;
        state.sample.p_film.x = read(r.read_f32::<BigEndian>())?;
        state.sample.p_film.y = read(r.read_f32::<BigEndian>())?;
        state.sample.weight = read(r.read_f32::<BigEndian>())?;

        state.ray.o = read_point3(&mut r)?;
        state.ray.d = read_vector3(&mut r)?;
        state.ray.t_max = read(r.read_f32::<BigEndian>())?;
        state.ray.time = read(r.read_f32::<BigEndian>())?;
        if read(r.read_u8())? != 0 {
            state.ray.differentials = Some(RayDifferentials {
                rx_origin: read_point3(&mut r)?,
                ry_origin: read_point3(&mut r)?,
                rx_direction: read_vector3(&mut r)?,
                ry_direction: read_vector3(&mut r)?,
            });
        }

        let n_visit = read(r.read_u16::<BigEndian>())?;
        state.to_visit = (0..n_visit)
            .map(|_| read_treelet_node(&mut r))
            .collect::<Result<_>>()?;
        if read(r.read_u8())? != 0 {
            state.hit = Some(read_treelet_node(&mut r)?);
        }

        state.beta = read_spectrum(&mut r)?;
        state.ld = read_spectrum(&mut r)?;
        state.bounces = read(r.read_u32::<BigEndian>())?;
        state.remaining_bounces = read(r.read_u32::<BigEndian>())?;
        state.is_shadow_ray = read(r.read_u8())? != 0;
        Ok(state)
    }
}

/// A finished path sample reported back to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedRay {
    /// Film-space sample position.
    pub p_film: Point2f,

    /// Radiance the sample contributes.
    pub l: RGBSpectrum,

    /// Camera weight for the sample.
    pub weight: Float,
}

impl FinishedRay {
    /// Serialize to the wire record format.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(24);
        w.write_f32::<BigEndian>(self.p_film.x).unwrap();
        w.write_f32::<BigEndian>(self.p_film.y).unwrap();
        write_spectrum(&mut w, &self.l);
        w.write_f32::<BigEndian>(self.weight).unwrap();
        w
    }

    /// Deserialize from the wire record format.
    ///
    /// * `bytes` - The record bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        Ok(Self {
            p_film: Point2f::new(
                read(r.read_f32::<BigEndian>())?,
                read(r.read_f32::<BigEndian>())?,
            ),
            l: read_spectrum(&mut r)?,
            weight: read(r.read_f32::<BigEndian>())?,
        })
    }
}

fn read<T>(res: std::io::Result<T>) -> Result<T> {
    res.map_err(|_| Error::Protocol("truncated ray record".to_string()))
}

fn write_point3(w: &mut Vec<u8>, p: &Point3f) {
    w.write_f32::<BigEndian>(p.x).unwrap();
    w.write_f32::<BigEndian>(p.y).unwrap();
    w.write_f32::<BigEndian>(p.z).unwrap();
}

fn read_point3<R: Read>(r: &mut R) -> Result<Point3f> {
    Ok(Point3f::new(
        read(r.read_f32::<BigEndian>())?,
        read(r.read_f32::<BigEndian>())?,
        read(r.read_f32::<BigEndian>())?,
    ))
}

fn write_vector3(w: &mut Vec<u8>, v: &Vector3f) {
    w.write_f32::<BigEndian>(v.x).unwrap();
    w.write_f32::<BigEndian>(v.y).unwrap();
    w.write_f32::<BigEndian>(v.z).unwrap();
}

fn read_vector3<R: Read>(r: &mut R) -> Result<Vector3f> {
    Ok(Vector3f::new(
        read(r.read_f32::<BigEndian>())?,
        read(r.read_f32::<BigEndian>())?,
        read(r.read_f32::<BigEndian>())?,
    ))
}

fn write_spectrum(w: &mut Vec<u8>, s: &RGBSpectrum) {
    for c in s.to_rgb() {
        w.write_f32::<BigEndian>(c).unwrap();
    }
}

fn read_spectrum<R: Read>(r: &mut R) -> Result<RGBSpectrum> {
    Ok(RGBSpectrum::from_rgb([
        read(r.read_f32::<BigEndian>())?,
        read(r.read_f32::<BigEndian>())?,
        read(r.read_f32::<BigEndian>())?,
    ]))
}

fn write_treelet_node(w: &mut impl Write, node: &TreeletNode) {
    w.write_u32::<BigEndian>(node.treelet).unwrap();
    w.write_u32::<BigEndian>(node.node).unwrap();
    match &node.transform {
        Some(t) => {
            w.write_u8(1).unwrap();
            for row in &t.m {
                for v in row {
                    w.write_f32::<BigEndian>(*v).unwrap();
                }
            }
        }
        None => w.write_u8(0).unwrap(),
    }
}

fn read_treelet_node<R: Read>(r: &mut R) -> Result<TreeletNode> {
    let treelet = read(r.read_u32::<BigEndian>())?;
    let node = read(r.read_u32::<BigEndian>())?;
    let transform = if read(r.read_u8())? != 0 {
        let mut m = [[0.0; 4]; 4];
        for row in m.iter_mut() {
            for v in row.iter_mut() {
                *v = read(r.read_f32::<BigEndian>())?;
            }
        }
        Some(Matrix4x4::new(m))
    } else {
        None
    };
    Ok(TreeletNode {
        treelet,
        node,
        transform,
    })
}
