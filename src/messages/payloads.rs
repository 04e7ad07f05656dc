//! Typed payloads for the control-plane opcodes.

use crate::core::geometry::{Bounds2i, Point2i};
use crate::error::{Error, Result};
use crate::messages::{Message, OpCode};
use crate::rays::{TreeletId, WorkerId};
use crate::scene::ObjectKey;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

fn truncated<T>(res: std::io::Result<T>) -> Result<T> {
    res.map_err(|_| Error::Protocol("truncated payload".to_string()))
}

/// Peer handshake request: "this is who I am, and here is the nonce I
/// believe is yours".
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectRequest {
    pub worker_id: WorkerId,
    pub my_seed: u64,
    pub your_seed: u64,
}

impl ConnectRequest {
    pub fn to_message(&self) -> Message {
        let mut w = Vec::with_capacity(24);
        w.write_u64::<BigEndian>(self.worker_id).unwrap();
        w.write_u64::<BigEndian>(self.my_seed).unwrap();
        w.write_u64::<BigEndian>(self.your_seed).unwrap();
        Message::new(OpCode::ConnectionRequest, w)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            worker_id: truncated(r.read_u64::<BigEndian>())?,
            my_seed: truncated(r.read_u64::<BigEndian>())?,
            your_seed: truncated(r.read_u64::<BigEndian>())?,
        })
    }
}

/// Peer handshake response; carries the responder's held treelet set.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectResponse {
    pub worker_id: WorkerId,
    pub my_seed: u64,
    pub your_seed: u64,
    pub treelet_ids: Vec<TreeletId>,
}

impl ConnectResponse {
    pub fn to_message(&self) -> Message {
        let mut w = Vec::with_capacity(28 + 4 * self.treelet_ids.len());
        w.write_u64::<BigEndian>(self.worker_id).unwrap();
        w.write_u64::<BigEndian>(self.my_seed).unwrap();
        w.write_u64::<BigEndian>(self.your_seed).unwrap();
        w.write_u32::<BigEndian>(self.treelet_ids.len() as u32).unwrap();
        for id in &self.treelet_ids {
            w.write_u32::<BigEndian>(*id).unwrap();
        }
        Message::new(OpCode::ConnectionResponse, w)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        let worker_id = truncated(r.read_u64::<BigEndian>())?;
        let my_seed = truncated(r.read_u64::<BigEndian>())?;
        let your_seed = truncated(r.read_u64::<BigEndian>())?;
        let count = truncated(r.read_u32::<BigEndian>())?;
        let treelet_ids = (0..count)
            .map(|_| truncated(r.read_u32::<BigEndian>()))
            .collect::<Result<_>>()?;
        Ok(Self {
            worker_id,
            my_seed,
            your_seed,
            treelet_ids,
        })
    }
}

/// Coordinator instruction to open a peer connection to another worker.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectTo {
    pub worker_id: WorkerId,
    /// The peer's UDP address as `"ip:port"`.
    pub address: String,
}

impl ConnectTo {
    pub fn to_message(&self) -> Message {
        let mut w = Vec::with_capacity(10 + self.address.len());
        w.write_u64::<BigEndian>(self.worker_id).unwrap();
        w.write_u16::<BigEndian>(self.address.len() as u16).unwrap();
        w.extend_from_slice(self.address.as_bytes());
        Message::new(OpCode::ConnectTo, w)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        let worker_id = truncated(r.read_u64::<BigEndian>())?;
        let len = truncated(r.read_u16::<BigEndian>())? as usize;
        let start = r.position() as usize;
        let bytes = payload
            .get(start..start + len)
            .ok_or_else(|| Error::Protocol("truncated payload".to_string()))?;
        let address = String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Protocol("address is not utf-8".to_string()))?;
        Ok(Self { worker_id, address })
    }
}

/// The set of scene objects a worker must fetch before tracing.
#[derive(Clone, Debug, PartialEq)]
pub struct GetObjects {
    pub object_ids: Vec<ObjectKey>,
}

impl GetObjects {
    pub fn to_message(&self) -> Message {
        let mut w = Vec::with_capacity(4 + 9 * self.object_ids.len());
        w.write_u32::<BigEndian>(self.object_ids.len() as u32).unwrap();
        for key in &self.object_ids {
            key.encode_to(&mut w);
        }
        Message::new(OpCode::GetObjects, w)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        let count = truncated(r.read_u32::<BigEndian>())?;
        let object_ids = (0..count)
            .map(|_| ObjectKey::decode_from(&mut r))
            .collect::<Result<_>>()?;
        Ok(Self { object_ids })
    }
}

/// The crop window a worker generates camera rays for.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateRays {
    pub crop_window: Bounds2i,
}

impl GenerateRays {
    pub fn to_message(&self) -> Message {
        let mut w = Vec::with_capacity(16);
        w.write_i32::<BigEndian>(self.crop_window.p_min.x).unwrap();
        w.write_i32::<BigEndian>(self.crop_window.p_min.y).unwrap();
        w.write_i32::<BigEndian>(self.crop_window.p_max.x).unwrap();
        w.write_i32::<BigEndian>(self.crop_window.p_max.y).unwrap();
        Message::new(OpCode::GenerateRays, w)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        let p_min = Point2i::new(
            truncated(r.read_i32::<BigEndian>())?,
            truncated(r.read_i32::<BigEndian>())?,
        );
        let p_max = Point2i::new(
            truncated(r.read_i32::<BigEndian>())?,
            truncated(r.read_i32::<BigEndian>())?,
        );
        Ok(Self {
            crop_window: Bounds2i::new(p_min, p_max),
        })
    }
}

/// Request for a worker that holds the given treelet.
#[derive(Clone, Debug, PartialEq)]
pub struct GetWorker {
    pub treelet_id: TreeletId,
}

impl GetWorker {
    pub fn to_message(&self) -> Message {
        let mut w = Vec::with_capacity(4);
        w.write_u32::<BigEndian>(self.treelet_id).unwrap();
        Message::new(OpCode::GetWorker, w)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            treelet_id: truncated(r.read_u32::<BigEndian>())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::ObjectType;

    #[test]
    fn connect_request_round_trips() {
        let req = ConnectRequest {
            worker_id: 7,
            my_seed: 0xdead,
            your_seed: 0xbeef,
        };
        let msg = req.to_message();
        assert_eq!(msg.opcode, OpCode::ConnectionRequest);
        assert_eq!(ConnectRequest::decode(&msg.payload).unwrap(), req);
    }

    #[test]
    fn connect_response_round_trips_with_treelets() {
        let resp = ConnectResponse {
            worker_id: 3,
            my_seed: 1,
            your_seed: 2,
            treelet_ids: vec![0, 4, 9],
        };
        assert_eq!(
            ConnectResponse::decode(&resp.to_message().payload).unwrap(),
            resp
        );
    }

    #[test]
    fn connect_to_round_trips_address_strings() {
        let msg = ConnectTo {
            worker_id: 12,
            address: "10.0.0.3:50000".to_string(),
        };
        assert_eq!(ConnectTo::decode(&msg.to_message().payload).unwrap(), msg);
    }

    #[test]
    fn get_objects_round_trips_key_lists() {
        let msg = GetObjects {
            object_ids: vec![
                ObjectKey::new(ObjectType::Scene, 0),
                ObjectKey::new(ObjectType::Treelet, 3),
            ],
        };
        assert_eq!(GetObjects::decode(&msg.to_message().payload).unwrap(), msg);
    }

    #[test]
    fn generate_rays_round_trips_bounds() {
        let msg = GenerateRays {
            crop_window: Bounds2i::new(Point2i::new(0, 0), Point2i::new(64, 32)),
        };
        assert_eq!(
            GenerateRays::decode(&msg.to_message().payload).unwrap(),
            msg
        );
    }

    #[test]
    fn get_worker_round_trips() {
        let msg = GetWorker { treelet_id: 17 };
        assert_eq!(GetWorker::decode(&msg.to_message().payload).unwrap(), msg);
    }
}
