//! Scene object keys.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

/// The kinds of objects a scene dump contains.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    Scene = 0,
    Camera,
    Sampler,
    Lights,
    Treelet,
    Material,
    Texture,
    TriangleMesh,
}

impl ObjectType {
    /// The filename tag for this type.
    pub fn tag(&self) -> &'static str {
        match self {
            ObjectType::Scene => "SCENE",
            ObjectType::Camera => "CAMERA",
            ObjectType::Sampler => "SAMPLER",
            ObjectType::Lights => "LIGHTS",
            ObjectType::Treelet => "T",
            ObjectType::Material => "MAT",
            ObjectType::Texture => "TEX",
            ObjectType::TriangleMesh => "MESH",
        }
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ObjectType::Scene),
            1 => Ok(ObjectType::Camera),
            2 => Ok(ObjectType::Sampler),
            3 => Ok(ObjectType::Lights),
            4 => Ok(ObjectType::Treelet),
            5 => Ok(ObjectType::Material),
            6 => Ok(ObjectType::Texture),
            7 => Ok(ObjectType::TriangleMesh),
            other => Err(Error::Protocol(format!("unknown object type {other}"))),
        }
    }
}

/// Tagged identifier of one scene object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// The object's type.
    pub object_type: ObjectType,

    /// The object's id within its type.
    pub id: u64,
}

impl ObjectKey {
    /// Create a new key.
    ///
    /// * `object_type` - The object's type.
    /// * `id`          - The object's id.
    pub fn new(object_type: ObjectType, id: u64) -> Self {
        Self { object_type, id }
    }

    /// The object's name in storage and in the dump directory, formed
    /// from the type tag and id.
    pub fn object_name(&self) -> String {
        format!("{}{}", self.object_type.tag(), self.id)
    }

    /// Append the key to a wire buffer.
    ///
    /// * `w` - The buffer.
    pub fn encode_to(&self, w: &mut Vec<u8>) {
        w.write_u8(self.object_type as u8).unwrap();
        w.write_u64::<BigEndian>(self.id).unwrap();
    }

    /// Read a key from a wire buffer.
    ///
    /// * `r` - The reader.
    pub fn decode_from<R: Read>(r: &mut R) -> Result<Self> {
        let object_type = ObjectType::try_from(
            r.read_u8()
                .map_err(|_| Error::Protocol("truncated object key".to_string()))?,
        )?;
        let id = r
            .read_u64::<BigEndian>()
            .map_err(|_| Error::Protocol("truncated object key".to_string()))?;
        Ok(Self { object_type, id })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_name())
    }
}
