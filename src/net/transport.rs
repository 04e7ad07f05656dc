//! UDP transport with priorities and an optional reliable mode.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Maximum bytes of message payload per datagram.
pub const UDP_MTU_BYTES: usize = 1400;

/// Default deadline before a reliable datagram is retransmitted.
const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(200);

/// Default number of tries before a reliable datagram is dropped.
const MAX_TRIES: u32 = 5;

/// Per-sender window of sequence tags kept for de-duplication.
const SEEN_WINDOW: usize = 1024;

const KIND_UNRELIABLE: u8 = 0;
const KIND_RELIABLE: u8 = 1;
const KIND_ACK: u8 = 2;

/// Send priority; high-priority datagrams drain before normal ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketPriority {
    High,
    Normal,
}

/// Delivery mode for an outbound datagram.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketType {
    Unreliable,
    Reliable,
}

struct Outbound {
    addr: SocketAddr,
    bytes: Vec<u8>,
    seq: Option<u64>,
    priority: PacketPriority,
}

struct Pending {
    addr: SocketAddr,
    bytes: Vec<u8>,
    deadline: Instant,
    tries: u32,
}

#[derive(Default)]
struct SeenWindow {
    set: HashSet<u64>,
    order: VecDeque<u64>,
}

impl SeenWindow {
    /// Returns true if the tag was already recorded.
    fn check_and_record(&mut self, seq: u64) -> bool {
        if self.set.contains(&seq) {
            return true;
        }
        self.set.insert(seq);
        self.order.push_back(seq);
        while self.order.len() > SEEN_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        false
    }
}

/// A non-blocking UDP endpoint. Outbound datagrams are queued and pumped
/// with non-blocking sends so the event loop never stalls; inbound
/// datagrams are handed to the caller one at a time. In reliable mode the
/// transport tags each datagram, retransmits on a deadline, and
/// de-duplicates on the receiving side; ordering is not guaranteed.
pub struct UdpTransport {
    socket: UdpSocket,
    high: VecDeque<Outbound>,
    normal: VecDeque<Outbound>,
    pending: HashMap<u64, Pending>,
    seen: HashMap<SocketAddr, SeenWindow>,
    next_seq: u64,
    retransmit_timeout: Duration,
    max_tries: u32,
    recv_buf: Vec<u8>,

    /// Total bytes handed to the socket.
    pub bytes_sent: u64,

    /// Total bytes received from the socket.
    pub bytes_received: u64,
}

impl UdpTransport {
    /// Bind a transport to a local address.
    ///
    /// * `addr` - The local address, e.g. `0.0.0.0:0`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            high: VecDeque::new(),
            normal: VecDeque::new(),
            pending: HashMap::new(),
            seen: HashMap::new(),
            next_seq: rand::random(),
            retransmit_timeout: RETRANSMIT_TIMEOUT,
            max_tries: MAX_TRIES,
            recv_buf: vec![0u8; 65536],
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Override the retransmit policy.
    ///
    /// * `timeout` - Deadline before retransmitting.
    /// * `tries`   - Tries before giving up.
    pub fn set_retry_policy(&mut self, timeout: Duration, tries: u32) {
        self.retransmit_timeout = timeout;
        self.max_tries = tries;
    }

    /// Queue a datagram for sending.
    ///
    /// * `addr`     - Destination address.
    /// * `payload`  - Message bytes; at most `UDP_MTU_BYTES`.
    /// * `priority` - Drain priority.
    /// * `mode`     - Delivery mode.
    pub fn enqueue(
        &mut self,
        addr: SocketAddr,
        payload: &[u8],
        priority: PacketPriority,
        mode: PacketType,
    ) -> Result<()> {
        if payload.len() > UDP_MTU_BYTES {
            return Err(Error::Protocol(format!(
                "datagram payload of {} bytes exceeds the {} byte MTU",
                payload.len(),
                UDP_MTU_BYTES
            )));
        }

        let (bytes, seq) = match mode {
            PacketType::Unreliable => {
                let mut bytes = Vec::with_capacity(1 + payload.len());
                bytes.push(KIND_UNRELIABLE);
                bytes.extend_from_slice(payload);
                (bytes, None)
            }
            PacketType::Reliable => {
                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);
                let mut bytes = Vec::with_capacity(9 + payload.len());
                bytes.push(KIND_RELIABLE);
                let mut tag = [0u8; 8];
                BigEndian::write_u64(&mut tag, seq);
                bytes.extend_from_slice(&tag);
                bytes.extend_from_slice(payload);
                (bytes, Some(seq))
            }
        };

        let out = Outbound {
            addr,
            bytes,
            seq,
            priority,
        };
        match priority {
            PacketPriority::High => self.high.push_back(out),
            PacketPriority::Normal => self.normal.push_back(out),
        }
        Ok(())
    }

    /// Number of datagrams queued or awaiting acknowledgment.
    pub fn queue_size(&self) -> usize {
        self.high.len() + self.normal.len() + self.pending.len()
    }

    /// Drain the outbound queues with non-blocking sends, stopping when
    /// the socket would block.
    pub fn pump(&mut self) {
        loop {
            let out = match self.high.pop_front().or_else(|| self.normal.pop_front()) {
                Some(out) => out,
                None => return,
            };
            match self.socket.try_send_to(&out.bytes, out.addr) {
                Ok(n) => {
                    self.bytes_sent += n as u64;
                    if let Some(seq) = out.seq {
                        self.pending.insert(
                            seq,
                            Pending {
                                addr: out.addr,
                                bytes: out.bytes,
                                deadline: Instant::now() + self.retransmit_timeout,
                                tries: 1,
                            },
                        );
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    match out.priority {
                        PacketPriority::High => self.high.push_front(out),
                        PacketPriority::Normal => self.normal.push_front(out),
                    }
                    return;
                }
                Err(e) => {
                    warn!("dropping datagram to {}: {}", out.addr, e);
                }
            }
        }
    }

    /// Retransmit reliable datagrams whose deadline passed, dropping any
    /// that exhausted their tries.
    pub fn check_retransmits(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            let pending = self.pending.get_mut(&seq).unwrap();
            if pending.tries >= self.max_tries {
                debug!("giving up on datagram {seq} to {}", pending.addr);
                self.pending.remove(&seq);
                continue;
            }
            pending.tries += 1;
            pending.deadline = now + self.retransmit_timeout;
            match self.socket.try_send_to(&pending.bytes, pending.addr) {
                Ok(n) => self.bytes_sent += n as u64,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("retransmit to {} failed: {}", pending.addr, e),
            }
        }
    }

    /// Wait until the socket is writable. Used as an event-loop wake
    /// condition while datagrams are queued.
    pub async fn writable(&self) -> Result<()> {
        self.socket.writable().await?;
        Ok(())
    }

    /// Receive the next message-bearing datagram, handling acks and
    /// duplicate suppression internally.
    pub async fn recv(&mut self) -> Result<(SocketAddr, Vec<u8>)> {
        loop {
            let (n, addr) = {
                let Self {
                    socket, recv_buf, ..
                } = self;
                socket.recv_from(recv_buf).await?
            };
            self.bytes_received += n as u64;
            if n == 0 {
                continue;
            }

            match self.recv_buf[0] {
                KIND_ACK if n >= 9 => {
                    let seq = BigEndian::read_u64(&self.recv_buf[1..9]);
                    self.pending.remove(&seq);
                }
                KIND_RELIABLE if n >= 9 => {
                    let seq = BigEndian::read_u64(&self.recv_buf[1..9]);
                    let mut ack = [0u8; 9];
                    ack[0] = KIND_ACK;
                    BigEndian::write_u64(&mut ack[1..9], seq);
                    if let Err(e) = self.socket.try_send_to(&ack, addr) {
                        if e.kind() != std::io::ErrorKind::WouldBlock {
                            warn!("ack to {} failed: {}", addr, e);
                        }
                    }
                    let duplicate = self
                        .seen
                        .entry(addr)
                        .or_default()
                        .check_and_record(seq);
                    if !duplicate {
                        return Ok((addr, self.recv_buf[9..n].to_vec()));
                    }
                }
                KIND_UNRELIABLE => {
                    return Ok((addr, self.recv_buf[1..n].to_vec()));
                }
                other => {
                    debug!("ignoring datagram with unknown kind {other} from {addr}");
                }
            }
        }
    }
}
