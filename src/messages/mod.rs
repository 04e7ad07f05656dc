//! Control messages and their wire framing.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::collections::VecDeque;

mod payloads;
mod records;

// Re-export.
pub use payloads::*;
pub use records::*;

/// Size of the frame header: 4-byte big-endian payload length plus the
/// opcode byte.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Message opcodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Hey = 0x1,
    Ping,
    Pong,
    GetObjects,
    GenerateRays,
    ConnectTo,
    ConnectionRequest,
    ConnectionResponse,
    SendRays,
    FinishedRays,
    WorkerStats,
    GetWorker,
    Bye,
    RequestDiagnostics,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x1 => Ok(OpCode::Hey),
            0x2 => Ok(OpCode::Ping),
            0x3 => Ok(OpCode::Pong),
            0x4 => Ok(OpCode::GetObjects),
            0x5 => Ok(OpCode::GenerateRays),
            0x6 => Ok(OpCode::ConnectTo),
            0x7 => Ok(OpCode::ConnectionRequest),
            0x8 => Ok(OpCode::ConnectionResponse),
            0x9 => Ok(OpCode::SendRays),
            0xa => Ok(OpCode::FinishedRays),
            0xb => Ok(OpCode::WorkerStats),
            0xc => Ok(OpCode::GetWorker),
            0xd => Ok(OpCode::Bye),
            0xe => Ok(OpCode::RequestDiagnostics),
            other => Err(Error::Protocol(format!("unknown opcode {other:#x}"))),
        }
    }
}

/// A framed control message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// The opcode.
    pub opcode: OpCode,

    /// The payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message.
    ///
    /// * `opcode`  - The opcode.
    /// * `payload` - The payload bytes.
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Total size of the message on the wire, header included.
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Serialize the message with its frame header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, self.payload.len() as u32);
        buf.extend_from_slice(&len);
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Incremental frame parser. Bytes are fed in as they arrive off a socket
/// in arbitrary chunks; complete messages are popped from the front.
#[derive(Default)]
pub struct MessageParser {
    buffer: Vec<u8>,
    completed: VecDeque<Message>,
}

impl MessageParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes into the parser.
    ///
    /// * `data` - The bytes.
    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);

        loop {
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return Ok(());
            }
            let payload_len = BigEndian::read_u32(&self.buffer[0..4]) as usize;
            if self.buffer.len() < FRAME_HEADER_SIZE + payload_len {
                return Ok(());
            }
            let opcode = OpCode::try_from(self.buffer[4])?;
            let payload = self.buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len].to_vec();
            self.buffer.drain(0..FRAME_HEADER_SIZE + payload_len);
            self.completed.push_back(Message::new(opcode, payload));
        }
    }

    /// Returns true if no complete message is ready.
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Pop the oldest complete message.
    pub fn pop(&mut self) -> Option<Message> {
        self.completed.pop_front()
    }

    /// Push a message back for reprocessing on a later pass.
    ///
    /// * `message` - The message.
    pub fn push(&mut self, message: Message) {
        self.completed.push_back(message);
    }
}
