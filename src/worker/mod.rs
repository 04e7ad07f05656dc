//! The worker runtime: ray engine, peer table, and event loop.

use crate::core::camera::{CameraDescription, PerspectiveCamera};
use crate::core::geometry::Bounds2i;
use crate::core::light::Light;
use crate::core::common::Float;
use crate::core::sampler::{PixelSampler, SamplerDescription};
use crate::core::spectrum::RGBSpectrum;
use crate::error::{Error, Result};
use crate::messages::{
    ConnectRequest, ConnectResponse, ConnectTo, GenerateRays, GetObjects, GetWorker, Message,
    MessageParser, OpCode, RecordReader, RecordWriter, FRAME_HEADER_SIZE, RECORD_HEADER_SIZE,
};
use crate::net::{PacketPriority, PacketType, UdpTransport, UDP_MTU_BYTES};
use crate::rays::{FinishedRay, RayState, TreeletId, WorkerId};
use crate::scene::{
    ObjectType, SceneDescription, TraceEngine, TreeletGraph,
};
use crate::storage::{GetRequest, PutRequest, StorageClient};
use rand::seq::SliceRandom;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;

mod diagnostics;
mod peers;
mod stats;

// Re-export.
pub use diagnostics::*;
pub use peers::*;
pub use stats::*;

/// Rays drained from the ray queue per event-loop wake.
const MAX_RAYS: usize = 20_000;

/// Finished rays accumulate up to this depth before the queue drains.
const FINISHED_QUEUE_THRESHOLD: usize = 1_000;

const PEER_CHECK_INTERVAL: Duration = Duration::from_millis(1_000);
const WORKER_STATS_INTERVAL: Duration = Duration::from_millis(500);
const WORKER_DIAGNOSTICS_INTERVAL: Duration = Duration::from_millis(2_000);
const RETRANSMIT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Environment variable carrying the platform log stream name, forwarded
/// to the coordinator in the `Hey` message.
const LOG_STREAM_ENVAR: &str = "AWS_LAMBDA_LOG_STREAM_NAME";

/// Name of the diagnostics file inside the working directory.
const DIAGNOSTICS_FILE: &str = "worker.DIAG";

/// What to do with rays that produced a sample.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FinishedRayPolicy {
    /// Drop them; samples are accumulated elsewhere.
    Discard,

    /// Batch them into `FinishedRays` messages to the coordinator.
    Forward,
}

/// Worker configuration.
pub struct WorkerConfig {
    /// The coordinator's TCP/UDP address.
    pub coordinator: SocketAddr,

    /// Storage backend URI for scene objects and log upload.
    pub storage_uri: String,

    /// Send ray packets reliably.
    pub send_reliably: bool,

    /// What to do with finished rays.
    pub finished_policy: FinishedRayPolicy,

    /// Scratch directory scene objects are fetched into.
    pub working_dir: PathBuf,

    /// Object-name prefix logs are uploaded under.
    pub log_prefix: String,
}

/// One worker process: ingests rays, advances them through its local
/// treelets, forwards rays whose next treelet lives elsewhere, and
/// reports stats and finished samples to the coordinator.
pub struct Worker {
    config: WorkerConfig,
    storage: StorageClient,

    worker_id: Option<WorkerId>,
    my_seed: u64,

    tcp_reader: OwnedReadHalf,
    tcp_writer: OwnedWriteHalf,
    tcp_parser: MessageParser,
    transport: UdpTransport,

    incoming: VecDeque<Message>,
    stuck_messages: usize,

    engine: TreeletGraph,
    scene: SceneDescription,
    camera: Option<PerspectiveCamera>,
    sampler: Option<PixelSampler>,
    lights: Vec<Light>,
    initialized: bool,

    treelet_ids: HashSet<TreeletId>,
    treelet_to_worker: HashMap<TreeletId, Vec<WorkerId>>,
    peers: HashMap<WorkerId, Peer>,

    ray_queue: VecDeque<RayState>,
    out_queue: HashMap<TreeletId, VecDeque<RayState>>,
    out_queue_size: u64,
    pending_queue: HashMap<TreeletId, VecDeque<RayState>>,
    pending_queue_size: u64,
    finished_queue: VecDeque<RayState>,

    needed_treelets: HashSet<TreeletId>,
    requested_treelets: HashSet<TreeletId>,

    stats: WorkerStats,
    last_stats_bytes: (u64, u64),
    diagnostics: Rc<RefCell<WorkerDiagnostics>>,
    last_diagnostics_bytes: (u64, u64),
    diagnostics_file: std::fs::File,

    terminated: bool,
}

impl Worker {
    /// Connect to the coordinator and set up the UDP endpoint. Sends the
    /// initial `Hey` carrying the platform log stream name.
    ///
    /// * `config` - The worker configuration.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.working_dir)?;
        let storage = StorageClient::from_uri(&config.storage_uri)?;

        let stream = TcpStream::connect(config.coordinator).await?;
        stream.set_nodelay(true)?;
        let (tcp_reader, tcp_writer) = stream.into_split();

        let transport = UdpTransport::bind("0.0.0.0:0").await?;

        let mut my_seed = 0u64;
        while my_seed == 0 {
            my_seed = rand::random();
        }

        let diagnostics = WorkerDiagnostics::new();
        let diagnostics_file =
            std::fs::File::create(config.working_dir.join(DIAGNOSTICS_FILE))?;

        let mut worker = Self {
            config,
            storage,
            worker_id: None,
            my_seed,
            tcp_reader,
            tcp_writer,
            tcp_parser: MessageParser::new(),
            transport,
            incoming: VecDeque::new(),
            stuck_messages: 0,
            engine: TreeletGraph::new(),
            scene: SceneDescription::default(),
            camera: None,
            sampler: None,
            lights: Vec::new(),
            initialized: false,
            treelet_ids: HashSet::new(),
            treelet_to_worker: HashMap::new(),
            peers: HashMap::new(),
            ray_queue: VecDeque::new(),
            out_queue: HashMap::new(),
            out_queue_size: 0,
            pending_queue: HashMap::new(),
            pending_queue_size: 0,
            finished_queue: VecDeque::new(),
            needed_treelets: HashSet::new(),
            requested_treelets: HashSet::new(),
            stats: WorkerStats::default(),
            last_stats_bytes: (0, 0),
            diagnostics,
            last_diagnostics_bytes: (0, 0),
            diagnostics_file,
            terminated: false,
        };

        let log_stream = std::env::var(LOG_STREAM_ENVAR).unwrap_or_default();
        let hey = Message::new(OpCode::Hey, log_stream.into_bytes());
        worker.send_to_coordinator(&hey).await?;

        Ok(worker)
    }

    /// The local UDP address of this worker.
    pub fn udp_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// The assigned worker id, once the coordinator's `Hey` arrived.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    /// Run the event loop until `Bye` arrives, the coordinator
    /// connection dies, or a handler fails.
    pub async fn run(&mut self) -> Result<()> {
        let mut peer_timer = interval_timer(PEER_CHECK_INTERVAL);
        let mut stats_timer = interval_timer(WORKER_STATS_INTERVAL);
        let mut diagnostics_timer = interval_timer(WORKER_DIAGNOSTICS_INTERVAL);
        let mut retransmit_timer = interval_timer(RETRANSMIT_CHECK_INTERVAL);

        let mut read_buf = vec![0u8; 16 * 1024];

        while !self.terminated {
            let work_pending = self.has_queued_work();
            let have_peers = !self.peers.is_empty();

            tokio::select! {
                biased;

                n = self.tcp_reader.read(&mut read_buf) => {
                    let n = n?;
                    if n == 0 {
                        info!("connection to coordinator closed");
                        self.terminated = true;
                        continue;
                    }
                    let _rec = record_interval(&self.diagnostics, "parseTCP");
                    self.tcp_parser.parse(&read_buf[..n])?;
                    while let Some(message) = self.tcp_parser.pop() {
                        self.incoming.push_back(message);
                    }
                }

                datagram = self.transport.recv() => {
                    let (_addr, payload) = datagram?;
                    let _rec = record_interval(&self.diagnostics, "parseUDP");
                    let mut parser = MessageParser::new();
                    parser.parse(&payload)?;
                    while let Some(message) = parser.pop() {
                        self.incoming.push_back(message);
                    }
                }

                _ = peer_timer.tick(), if have_peers => {
                    self.handle_peers()?;
                }

                _ = stats_timer.tick() => {
                    self.handle_worker_stats().await?;
                    self.handle_finished_queue(true).await?;
                }

                _ = diagnostics_timer.tick() => {
                    self.handle_diagnostics()?;
                }

                _ = retransmit_timer.tick() => {
                    self.transport.check_retransmits();
                }

                _ = std::future::ready(()), if work_pending => {}
            }

            self.handle_messages().await?;
            self.handle_ray_queue()?;
            self.handle_out_queue()?;
            self.handle_finished_queue(false).await?;
            self.handle_needed_treelets().await?;
            self.transport.pump();
        }

        Ok(())
    }

    fn has_queued_work(&self) -> bool {
        self.incoming.len() > self.stuck_messages
            || !self.ray_queue.is_empty()
            || self.out_queue_size > 0
            || self.finished_queue.len() > FINISHED_QUEUE_THRESHOLD
            || !self.needed_treelets.is_empty()
    }

    async fn send_to_coordinator(&mut self, message: &Message) -> Result<()> {
        self.tcp_writer.write_all(&message.to_bytes()).await?;
        Ok(())
    }

    fn create_connection_request(&self, peer: &Peer) -> Result<Message> {
        let worker_id = self
            .worker_id
            .ok_or_else(|| Error::Protocol("handshake before Hey".to_string()))?;
        Ok(ConnectRequest {
            worker_id,
            my_seed: self.my_seed,
            your_seed: peer.seed,
        }
        .to_message())
    }

    fn create_connection_response(&self, peer: &Peer) -> Result<Message> {
        let worker_id = self
            .worker_id
            .ok_or_else(|| Error::Protocol("handshake before Hey".to_string()))?;
        let mut treelet_ids: Vec<TreeletId> = self.treelet_ids.iter().copied().collect();
        treelet_ids.sort_unstable();
        Ok(ConnectResponse {
            worker_id,
            my_seed: self.my_seed,
            your_seed: peer.seed,
            treelet_ids,
        }
        .to_message())
    }

    /// Drain up to `MAX_RAYS` rays: trace rays that still have treelets
    /// to visit, shade rays whose traversal found a hit, then route every
    /// resulting ray to the queue its next treelet dictates.
    fn handle_ray_queue(&mut self) -> Result<()> {
        if self.ray_queue.is_empty() {
            return Ok(());
        }
        let _rec = record_interval(&self.diagnostics, "handleRayQueue");
        let mut processed: VecDeque<RayState> = VecDeque::new();

        for _ in 0..MAX_RAYS {
            let Some(ray) = self.pop_ray_queue() else {
                break;
            };

            if !ray.to_visit.is_empty() {
                let mut traced = self.engine.trace(ray);
                let hit = traced.hit.is_some();
                let empty_visit = traced.to_visit.is_empty();

                if traced.is_shadow_ray {
                    if hit || empty_visit {
                        if hit {
                            traced.ld = RGBSpectrum::BLACK;
                        }
                        self.finished_queue.push_back(traced);
                    } else {
                        processed.push_back(traced);
                    }
                } else if !empty_visit || hit {
                    processed.push_back(traced);
                } else {
                    traced.ld = RGBSpectrum::BLACK;
                    self.finished_queue.push_back(traced);
                    self.stats.record_finished_path();
                }
            } else if ray.hit.is_some() {
                // A path out of bounces ends here, whatever Shade spawns.
                let path_ended = ray.remaining_bounces == 0;
                let sampler = self
                    .sampler
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("rays before scene init".to_string()))?;
                let new_rays = self.engine.shade(ray, &self.lights, sampler);
                if path_ended {
                    self.stats.record_finished_path();
                }
                for new_ray in new_rays {
                    processed.push_back(new_ray);
                }
            } else {
                return Err(Error::Protocol(
                    "ray with no traversal state in the ray queue".to_string(),
                ));
            }
        }

        while let Some(ray) = processed.pop_front() {
            let next_treelet = ray.current_treelet();
            self.stats.record_demanded_ray(next_treelet);

            if self.treelet_ids.contains(&next_treelet) {
                self.push_ray_queue(ray);
            } else if self.treelet_to_worker.contains_key(&next_treelet) {
                self.stats.record_sending_ray(next_treelet);
                self.out_queue.entry(next_treelet).or_default().push_back(ray);
                self.out_queue_size += 1;
            } else {
                self.stats.record_pending_ray(next_treelet);
                self.needed_treelets.insert(next_treelet);
                self.pending_queue
                    .entry(next_treelet)
                    .or_default()
                    .push_back(ray);
                self.pending_queue_size += 1;
            }
        }

        Ok(())
    }

    /// Pack each per-treelet out queue into MTU-bounded `SendRays`
    /// datagrams toward a randomly chosen holder.
    fn handle_out_queue(&mut self) -> Result<()> {
        if self.out_queue_size == 0 {
            return Ok(());
        }
        let _rec = record_interval(&self.diagnostics, "handleOutQueue");
        let packet_type = if self.config.send_reliably {
            PacketType::Reliable
        } else {
            PacketType::Unreliable
        };

        let treelets: Vec<TreeletId> = self.out_queue.keys().copied().collect();
        for treelet in treelets {
            let mut queue = match self.out_queue.remove(&treelet) {
                Some(queue) if !queue.is_empty() => queue,
                _ => continue,
            };

            let holders = self.treelet_to_worker.get(&treelet).ok_or_else(|| {
                Error::Protocol(format!("out queue for treelet {treelet} with no holder"))
            })?;
            let holder = *holders.choose(&mut rand::thread_rng()).ok_or_else(|| {
                Error::Protocol(format!("out queue for treelet {treelet} with no holder"))
            })?;
            let peer_addr = self
                .peers
                .get(&holder)
                .ok_or_else(|| Error::Protocol(format!("holder {holder} is not a peer")))?
                .address;

            let mut leftover: Option<Vec<u8>> = None;
            while !queue.is_empty() || leftover.is_some() {
                let mut writer = RecordWriter::new();
                let mut packet_len = FRAME_HEADER_SIZE;

                if let Some(bytes) = leftover.take() {
                    packet_len += bytes.len() + RECORD_HEADER_SIZE;
                    writer.write(&bytes);
                }

                while packet_len < UDP_MTU_BYTES {
                    let Some(ray) = queue.pop_front() else {
                        break;
                    };
                    self.out_queue_size -= 1;
                    self.stats.record_sent_ray(treelet);

                    let bytes = ray.encode();
                    let len = bytes.len() + RECORD_HEADER_SIZE;
                    if packet_len + len > UDP_MTU_BYTES {
                        leftover = Some(bytes);
                        break;
                    }
                    packet_len += len;
                    writer.write(&bytes);
                }

                let message = Message::new(OpCode::SendRays, writer.into_inner());
                self.transport.enqueue(
                    peer_addr,
                    &message.to_bytes(),
                    PacketPriority::Normal,
                    packet_type,
                )?;
            }
        }

        Ok(())
    }

    /// Drain the finished queue when it is deep enough, or on `force`
    /// (the stats tick), applying the configured policy.
    async fn handle_finished_queue(&mut self, force: bool) -> Result<()> {
        if self.finished_queue.is_empty() {
            return Ok(());
        }
        if !force && self.finished_queue.len() <= FINISHED_QUEUE_THRESHOLD {
            return Ok(());
        }
        let _rec = record_interval(&self.diagnostics, "handleFinishedQueue");

        match self.config.finished_policy {
            FinishedRayPolicy::Discard => self.finished_queue.clear(),
            FinishedRayPolicy::Forward => {
                let mut writer = RecordWriter::new();
                while let Some(ray) = self.finished_queue.pop_front() {
                    let mut l = ray.beta * ray.ld;
                    if l.has_nans() || l.y() < -1e-5 || l.y().is_infinite() {
                        l = RGBSpectrum::BLACK;
                    }
                    let finished = FinishedRay {
                        p_film: ray.sample.p_film,
                        l,
                        weight: ray.sample.weight,
                    };
                    writer.write(&finished.encode());
                }
                let message = Message::new(OpCode::FinishedRays, writer.into_inner());
                self.send_to_coordinator(&message).await?;
            }
        }

        Ok(())
    }

    /// Peer upkeep: re-send handshake requests to peers still connecting.
    fn handle_peers(&mut self) -> Result<()> {
        let _rec = record_interval(&self.diagnostics, "handlePeers");
        let mut requests: Vec<(SocketAddr, Message)> = Vec::new();

        for peer in self.peers.values_mut() {
            match peer.state {
                PeerState::Connecting => {
                    peer.tries += 1;
                }
                PeerState::Connected => continue,
            }
        }
        for peer in self.peers.values() {
            if peer.state == PeerState::Connecting {
                requests.push((peer.address, self.create_connection_request(peer)?));
            }
        }
        for (addr, message) in requests {
            self.transport.enqueue(
                addr,
                &message.to_bytes(),
                PacketPriority::High,
                PacketType::Unreliable,
            )?;
        }
        Ok(())
    }

    /// Ask the coordinator for a holder of each treelet we have rays for
    /// but no peer, deduplicated until an answer arrives.
    async fn handle_needed_treelets(&mut self) -> Result<()> {
        if self.needed_treelets.is_empty() {
            return Ok(());
        }
        let _rec = record_interval(&self.diagnostics, "handleNeededTreelets");

        let needed: Vec<TreeletId> = self.needed_treelets.drain().collect();
        for treelet_id in needed {
            if self.requested_treelets.contains(&treelet_id) {
                continue;
            }
            let message = GetWorker { treelet_id }.to_message();
            self.send_to_coordinator(&message).await?;
            self.requested_treelets.insert(treelet_id);
        }
        Ok(())
    }

    /// Publish interval stats to the coordinator and reset them.
    async fn handle_worker_stats(&mut self) -> Result<()> {
        let _rec = record_interval(&self.diagnostics, "handleWorkerStats");

        self.stats.queue_stats = QueueStats {
            ray: self.ray_queue.len() as u64,
            finished: self.finished_queue.len() as u64,
            pending: self.pending_queue_size,
            out: self.out_queue_size,
            connecting: self
                .peers
                .values()
                .filter(|p| p.state == PeerState::Connecting)
                .count() as u64,
            connected: self
                .peers
                .values()
                .filter(|p| p.state == PeerState::Connected)
                .count() as u64,
            outstanding_udp: self.transport.queue_size() as u64,
        };
        self.stats.bytes_sent = self.transport.bytes_sent - self.last_stats_bytes.0;
        self.stats.bytes_received = self.transport.bytes_received - self.last_stats_bytes.1;
        self.last_stats_bytes = (self.transport.bytes_sent, self.transport.bytes_received);

        let message = self.stats.to_message();
        self.send_to_coordinator(&message).await?;
        self.stats.reset();
        Ok(())
    }

    /// Flush one diagnostics line with byte deltas and outstanding UDP.
    fn handle_diagnostics(&mut self) -> Result<()> {
        let line = {
            let mut d = self.diagnostics.borrow_mut();
            d.bytes_sent = self.transport.bytes_sent - self.last_diagnostics_bytes.0;
            d.bytes_received = self.transport.bytes_received - self.last_diagnostics_bytes.1;
            d.outstanding_udp = self.transport.queue_size() as u64;
            self.last_diagnostics_bytes =
                (self.transport.bytes_sent, self.transport.bytes_received);

            let snapshot = DiagnosticsSnapshot {
                timestamp_us: d.elapsed_us(),
                bytes_sent: d.bytes_sent,
                bytes_received: d.bytes_received,
                outstanding_udp: d.outstanding_udp,
                time_per_action: &d.time_per_action,
            };
            let line = serde_json::to_string(&snapshot)?;
            d.reset();
            line
        };
        writeln!(self.diagnostics_file, "{line}")?;
        Ok(())
    }

    /// Dispatch every queued message; messages that cannot be processed
    /// yet are retried on the next pass.
    async fn handle_messages(&mut self) -> Result<()> {
        if self.incoming.is_empty() {
            return Ok(());
        }
        let _rec = record_interval(&self.diagnostics, "handleMessages");

        let mut unprocessed: VecDeque<Message> = VecDeque::new();
        while let Some(message) = self.incoming.pop_front() {
            if !self.process_message(&message).await? {
                unprocessed.push_back(message);
            }
        }
        self.stuck_messages = unprocessed.len();
        self.incoming = unprocessed;
        Ok(())
    }

    /// Process one message. Returns `Ok(false)` when the message must be
    /// retried later (a handshake for a peer we have not been told about
    /// yet).
    async fn process_message(&mut self, message: &Message) -> Result<bool> {
        match message.opcode {
            OpCode::Hey => {
                let id: WorkerId = String::from_utf8_lossy(&message.payload)
                    .parse()
                    .map_err(|_| Error::Protocol("malformed Hey payload".to_string()))?;
                self.worker_id = Some(id);
                info!("assigned worker id {id}");

                // Register the coordinator as peer 0 and bind our UDP
                // address on its side with a handshake request.
                self.peers
                    .entry(0)
                    .or_insert_with(|| Peer::new(0, self.config.coordinator));
                let request = self.create_connection_request(&self.peers[&0])?;
                self.transport.enqueue(
                    self.config.coordinator,
                    &request.to_bytes(),
                    PacketPriority::High,
                    PacketType::Unreliable,
                )?;
            }

            OpCode::Ping => {
                let pong = Message::new(OpCode::Pong, Vec::new());
                self.send_to_coordinator(&pong).await?;
            }

            OpCode::Pong => {}

            OpCode::GetObjects => {
                let objects = GetObjects::decode(&message.payload)?;
                self.get_objects(&objects).await?;
                self.initialize_scene()?;
            }

            OpCode::GenerateRays => {
                let _rec = record_interval(&self.diagnostics, "generateRays");
                let generate = GenerateRays::decode(&message.payload)?;
                self.generate_rays(generate.crop_window)?;
            }

            OpCode::ConnectTo => {
                let connect = ConnectTo::decode(&message.payload)?;
                if !self.peers.contains_key(&connect.worker_id) {
                    let address: SocketAddr = connect
                        .address
                        .parse()
                        .map_err(|_| Error::Address(connect.address.clone()))?;
                    self.peers
                        .insert(connect.worker_id, Peer::new(connect.worker_id, address));
                }
            }

            OpCode::ConnectionRequest => {
                let request = ConnectRequest::decode(&message.payload)?;
                let Some(peer) = self.peers.get(&request.worker_id) else {
                    // The coordinator has not told us about this peer
                    // yet; retry once the ConnectTo arrives.
                    return Ok(false);
                };
                let response = self.create_connection_response(peer)?;
                let address = peer.address;
                self.transport.enqueue(
                    address,
                    &response.to_bytes(),
                    PacketPriority::High,
                    PacketType::Unreliable,
                )?;
            }

            OpCode::ConnectionResponse => {
                let response = ConnectResponse::decode(&message.payload)?;
                self.process_connection_response(&response);
            }

            OpCode::SendRays => {
                for record in RecordReader::new(&message.payload) {
                    let ray = RayState::decode(record)?;
                    self.stats.record_received_ray(ray.current_treelet());
                    self.push_ray_queue(ray);
                }
            }

            OpCode::RequestDiagnostics => {
                let mut snapshot = self.stats.clone();
                snapshot.time_per_action = self.diagnostics.borrow().time_per_action.clone();
                let message = snapshot.to_message();
                self.send_to_coordinator(&message).await?;
            }

            OpCode::Bye => {
                self.terminated = true;
            }

            other => {
                return Err(Error::Protocol(format!(
                    "unhandled opcode {other:?} on the worker"
                )));
            }
        }

        Ok(true)
    }

    fn process_connection_response(&mut self, response: &ConnectResponse) {
        let Some(peer) = self.peers.get_mut(&response.worker_id) else {
            // A response from a worker we know nothing about; swallow it.
            return;
        };

        peer.seed = response.my_seed;
        if peer.state == PeerState::Connected || response.your_seed != self.my_seed {
            return;
        }
        peer.state = PeerState::Connected;
        debug!("peer {} connected", response.worker_id);

        for treelet_id in &response.treelet_ids {
            peer.treelets.insert(*treelet_id);
            self.treelet_to_worker
                .entry(*treelet_id)
                .or_default()
                .push(response.worker_id);
            self.requested_treelets.remove(treelet_id);

            if let Some(mut pending) = self.pending_queue.remove(treelet_id) {
                self.pending_queue_size -= pending.len() as u64;
                let out = self.out_queue.entry(*treelet_id).or_default();
                while let Some(ray) = pending.pop_front() {
                    self.stats.record_sending_ray(*treelet_id);
                    self.out_queue_size += 1;
                    out.push_back(ray);
                }
            }
        }
    }

    /// Fetch the assigned objects from storage. Triangle meshes are
    /// packed inside treelet payloads and skipped; treelet payloads are
    /// loaded into the trace engine.
    async fn get_objects(&mut self, objects: &GetObjects) -> Result<()> {
        let mut requests = Vec::new();
        let mut new_treelets = Vec::new();

        for key in &objects.object_ids {
            if key.object_type == ObjectType::TriangleMesh {
                continue;
            }
            if key.object_type == ObjectType::Treelet {
                let id = key.id as TreeletId;
                if self.treelet_ids.insert(id) {
                    new_treelets.push(id);
                }
            }
            let name = key.object_name();
            requests.push(GetRequest {
                file_path: self.config.working_dir.join(&name),
                object_name: name,
            });
        }

        self.storage.get(&requests).await?;

        for id in new_treelets {
            let path = self
                .config
                .working_dir
                .join(crate::scene::ObjectKey::new(ObjectType::Treelet, id as u64).object_name());
            self.engine.load_treelet(id, &path)?;
        }
        Ok(())
    }

    fn initialize_scene(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let dir = &self.config.working_dir;

        let camera: CameraDescription =
            serde_json::from_slice(&std::fs::read(dir.join("CAMERA0"))?)?;
        self.camera = Some(PerspectiveCamera::new(camera));

        let sampler: SamplerDescription =
            serde_json::from_slice(&std::fs::read(dir.join("SAMPLER0"))?)?;
        self.sampler = Some(PixelSampler::new(&sampler));

        self.lights = serde_json::from_slice(&std::fs::read(dir.join("LIGHTS0"))?)?;
        self.scene = serde_json::from_slice(&std::fs::read(dir.join("SCENE0"))?)?;

        self.initialized = true;
        Ok(())
    }

    /// Generate camera rays for the assigned tile, one per (pixel,
    /// sample) pair.
    ///
    /// * `bounds` - The tile's pixel bounds.
    fn generate_rays(&mut self, bounds: Bounds2i) -> Result<()> {
        let camera = self
            .camera
            .as_ref()
            .ok_or_else(|| Error::Protocol("GenerateRays before scene init".to_string()))?;
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| Error::Protocol("GenerateRays before scene init".to_string()))?;

        let sample_bounds = Bounds2i::new(
            crate::core::geometry::Point2i::new(0, 0),
            camera.desc.film.resolution,
        );
        let sample_extent = sample_bounds.diagonal();
        let samples_per_pixel = sampler.samples_per_pixel;
        let max_depth = self.scene.max_depth;
        let ray_scale = 1.0 / (samples_per_pixel as Float).sqrt();

        let mut new_rays = Vec::new();
        for sample in 0..samples_per_pixel {
            for pixel in bounds.into_iter() {
                sampler.start_pixel(&pixel);
                if !sample_bounds.contains_exclusive(&pixel) {
                    continue;
                }
                sampler.set_sample_number(sample);
                let camera_sample = sampler.get_camera_sample(&pixel);

                let mut state = RayState::default();
                state.sample.id = (pixel.x + pixel.y * sample_extent.x) as u64
                    * samples_per_pixel as u64
                    + sample as u64;
                state.sample.num = sample;
                state.sample.pixel = pixel;
                state.sample.p_film = camera_sample.p_film;

                let (ray, weight) = camera.generate_ray_differential(&camera_sample);
                state.sample.weight = weight;
                state.ray = ray;
                state.ray.scale_differentials(ray_scale);
                state.remaining_bounces = max_depth;
                state.start_trace();

                new_rays.push(state);
            }
        }

        for state in new_rays {
            self.push_ray_queue(state);
        }
        Ok(())
    }

    fn push_ray_queue(&mut self, state: RayState) {
        self.stats.record_waiting_ray(state.current_treelet());
        self.ray_queue.push_back(state);
    }

    fn pop_ray_queue(&mut self) -> Option<RayState> {
        let state = self.ray_queue.pop_front()?;
        self.stats.record_processed_ray(state.current_treelet());
        Some(state)
    }

    /// Upload the diagnostics (and log file, if present) to storage
    /// under the configured prefix. Called after the event loop exits.
    pub async fn upload_logs(&mut self) -> Result<()> {
        let Some(worker_id) = self.worker_id else {
            return Ok(());
        };
        self.diagnostics_file.flush()?;

        let mut requests = vec![PutRequest {
            file_path: self.config.working_dir.join(DIAGNOSTICS_FILE),
            object_name: format!("{}{}.DIAG", self.config.log_prefix, worker_id),
        }];
        let log_path = self.config.working_dir.join("worker.log");
        if log_path.exists() {
            requests.push(PutRequest {
                file_path: log_path,
                object_name: format!("{}{}", self.config.log_prefix, worker_id),
            });
        }
        self.storage.put(&requests).await
    }
}

fn interval_timer(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Surface, TreeletPayload};
    use tokio::net::TcpListener;

    async fn test_worker() -> (Worker, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = crate::storage::scratch_dir("cirrus-worker-test").unwrap();
        let config = WorkerConfig {
            coordinator: addr,
            storage_uri: format!("file://{}", dir.display()),
            send_reliably: false,
            finished_policy: FinishedRayPolicy::Forward,
            working_dir: dir,
            log_prefix: "logs/".to_string(),
        };

        let (worker, server) = tokio::join!(Worker::new(config), async {
            listener.accept().await.unwrap().0
        });
        let mut worker = worker.unwrap();
        worker.worker_id = Some(1);
        (worker, server)
    }

    fn ray_to(treelet: TreeletId) -> RayState {
        let mut ray = RayState::default();
        ray.to_visit = vec![crate::rays::TreeletNode::new(treelet)];
        ray
    }

    #[tokio::test]
    async fn rays_for_known_holders_go_out_and_unknown_ones_go_pending() {
        let (mut worker, _server) = test_worker().await;
        worker.treelet_ids.insert(1);
        worker
            .peers
            .insert(5, Peer::new(5, "127.0.0.1:9999".parse().unwrap()));
        worker.treelet_to_worker.insert(2, vec![5]);

        worker.push_ray_queue(ray_to(2));
        worker.push_ray_queue(ray_to(3));
        worker.handle_ray_queue().unwrap();

        // Treelet 2 has a holder: out queue. Treelet 3 does not: pending.
        assert_eq!(worker.out_queue_size, 1);
        assert!(worker.out_queue.contains_key(&2));
        assert_eq!(worker.pending_queue_size, 1);
        assert!(worker.pending_queue.contains_key(&3));
        assert!(worker.needed_treelets.contains(&3));

        // Queue invariants: every out-queue treelet has a holder, every
        // pending-queue treelet has none.
        for treelet in worker.out_queue.keys() {
            assert!(worker.treelet_to_worker.contains_key(treelet));
        }
        for treelet in worker.pending_queue.keys() {
            assert!(!worker.treelet_to_worker.contains_key(treelet));
        }
    }

    #[tokio::test]
    async fn locally_held_treelets_are_traced_not_forwarded() {
        let (mut worker, _server) = test_worker().await;
        worker.treelet_ids.insert(0);
        worker.treelet_ids.insert(1);
        worker.engine.add_treelet(
            0,
            TreeletPayload {
                children: vec![1],
                surface: None,
            },
        );
        worker.engine.add_treelet(
            1,
            TreeletPayload {
                children: vec![],
                surface: None,
            },
        );

        let mut ray = RayState::default();
        ray.start_trace();
        worker.push_ray_queue(ray);
        worker.handle_ray_queue().unwrap();

        // The ray escaped: traced through both local treelets, no
        // forwarding, one finished path.
        assert_eq!(worker.out_queue_size, 0);
        assert_eq!(worker.finished_queue.len(), 1);
        assert_eq!(worker.stats.finished_paths, 1);
    }

    #[tokio::test]
    async fn shadow_ray_hit_clears_ld_and_finishes() {
        let (mut worker, _server) = test_worker().await;
        worker.treelet_ids.insert(0);
        worker.engine.add_treelet(
            0,
            TreeletPayload {
                children: vec![],
                surface: Some(Surface {
                    t: 1.0,
                    albedo: RGBSpectrum::new(0.5),
                }),
            },
        );

        let mut shadow = RayState::default();
        shadow.is_shadow_ray = true;
        shadow.ld = RGBSpectrum::new(1.0);
        shadow.ray.t_max = 10.0;
        shadow.start_trace();

        worker.push_ray_queue(shadow);
        worker.handle_ray_queue().unwrap();

        assert_eq!(worker.finished_queue.len(), 1);
        assert!(worker.finished_queue[0].ld.is_black());
    }

    #[tokio::test]
    async fn stale_seed_keeps_the_peer_connecting_and_retries() {
        let (mut worker, _server) = test_worker().await;
        worker
            .peers
            .insert(2, Peer::new(2, "127.0.0.1:9998".parse().unwrap()));

        let response = ConnectResponse {
            worker_id: 2,
            my_seed: 4242,
            your_seed: worker.my_seed.wrapping_add(1),
            treelet_ids: vec![7],
        };
        worker.process_connection_response(&response);

        let peer = &worker.peers[&2];
        assert_eq!(peer.state, PeerState::Connecting);
        assert_eq!(peer.seed, 4242);
        assert!(worker.treelet_to_worker.is_empty());

        worker.handle_peers().unwrap();
        assert_eq!(worker.peers[&2].tries, 1);
    }

    #[tokio::test]
    async fn matching_seed_connects_and_drains_the_pending_queue() {
        let (mut worker, _server) = test_worker().await;
        worker
            .peers
            .insert(2, Peer::new(2, "127.0.0.1:9998".parse().unwrap()));
        worker.pending_queue.insert(7, vec![ray_to(7)].into());
        worker.pending_queue_size = 1;
        worker.requested_treelets.insert(7);

        let response = ConnectResponse {
            worker_id: 2,
            my_seed: 4242,
            your_seed: worker.my_seed,
            treelet_ids: vec![7],
        };
        worker.process_connection_response(&response);

        assert_eq!(worker.peers[&2].state, PeerState::Connected);
        assert_eq!(worker.pending_queue_size, 0);
        assert_eq!(worker.out_queue_size, 1);
        assert_eq!(worker.treelet_to_worker[&7], vec![2]);
        assert!(worker.requested_treelets.is_empty());
    }

    #[tokio::test]
    async fn response_from_an_unknown_worker_is_swallowed() {
        let (mut worker, _server) = test_worker().await;
        let response = ConnectResponse {
            worker_id: 99,
            my_seed: 1,
            your_seed: worker.my_seed,
            treelet_ids: vec![3],
        };
        worker.process_connection_response(&response);
        assert!(worker.peers.is_empty());
        assert!(worker.treelet_to_worker.is_empty());
    }

    #[tokio::test]
    async fn connection_request_for_an_unknown_peer_is_retried() {
        let (mut worker, _server) = test_worker().await;
        let request = ConnectRequest {
            worker_id: 3,
            my_seed: 5,
            your_seed: 0,
        }
        .to_message();
        let processed = worker.process_message(&request).await.unwrap();
        assert!(!processed);
    }

    #[tokio::test]
    async fn out_queue_flush_respects_the_datagram_mtu() {
        let (mut worker, _server) = test_worker().await;
        worker
            .peers
            .insert(5, Peer::new(5, "127.0.0.1:9999".parse().unwrap()));
        worker.treelet_to_worker.insert(9, vec![5]);

        let mut rays = VecDeque::new();
        let mut record_len = 0;
        for _ in 0..100 {
            let mut ray = ray_to(9);
            // Pad the traversal stack so each record is a few hundred
            // bytes, the size of a typical mid-path ray.
            for _ in 0..12 {
                ray.to_visit.push(crate::rays::TreeletNode::new(9));
            }
            record_len = ray.encode().len() + RECORD_HEADER_SIZE;
            rays.push_back(ray);
        }
        worker.out_queue_size = rays.len() as u64;
        worker.out_queue.insert(9, rays);

        worker.handle_out_queue().unwrap();

        let per_datagram = (UDP_MTU_BYTES - FRAME_HEADER_SIZE) / record_len;
        let expected = (100 + per_datagram - 1) / per_datagram;
        assert_eq!(worker.transport.queue_size(), expected);
        assert_eq!(worker.out_queue_size, 0);
        assert_eq!(worker.stats.aggregate.sent_rays, 100);
    }

    #[tokio::test]
    async fn generate_rays_produces_one_ray_per_pixel_sample() {
        let (mut worker, _server) = test_worker().await;
        worker.camera = Some(crate::core::camera::PerspectiveCamera::new(
            crate::core::camera::CameraDescription {
                fov: 60.0,
                shutter_open: 0.0,
                shutter_close: 1.0,
                film: crate::core::film::FilmDescription {
                    resolution: crate::core::geometry::Point2i::new(2, 2),
                    filter: crate::core::filter::Filter::default(),
                    filename: "out.png".to_string(),
                },
            },
        ));
        worker.sampler = Some(PixelSampler::new(&SamplerDescription {
            kind: crate::core::sampler::SamplerKind::Random,
            samples_per_pixel: 2,
        }));

        let bounds = Bounds2i::new(
            crate::core::geometry::Point2i::new(0, 0),
            crate::core::geometry::Point2i::new(2, 2),
        );
        worker.generate_rays(bounds).unwrap();

        assert_eq!(worker.ray_queue.len(), 8);
        let mut ids: Vec<u64> = worker.ray_queue.iter().map(|r| r.sample.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        for ray in &worker.ray_queue {
            assert_eq!(ray.remaining_bounces, 5);
            assert_eq!(ray.current_treelet(), 0);
            assert!(ray.ray.differentials.is_some());
        }
    }

    #[tokio::test]
    async fn needed_treelet_requests_are_deduplicated() {
        let (mut worker, mut server) = test_worker().await;
        worker.needed_treelets.insert(11);
        worker.handle_needed_treelets().await.unwrap();
        worker.needed_treelets.insert(11);
        worker.handle_needed_treelets().await.unwrap();

        // Drain the server side: one Hey plus exactly one GetWorker.
        let mut parser = MessageParser::new();
        let mut buf = vec![0u8; 4096];
        let mut messages = Vec::new();
        while messages.iter().filter(|m: &&Message| m.opcode == OpCode::GetWorker).count() < 1 {
            let n = server.read(&mut buf).await.unwrap();
            parser.parse(&buf[..n]).unwrap();
            while let Some(m) = parser.pop() {
                messages.push(m);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let get_workers = messages
            .iter()
            .filter(|m| m.opcode == OpCode::GetWorker)
            .count();
        assert_eq!(get_workers, 1);
        assert!(worker.requested_treelets.contains(&11));
    }
}
