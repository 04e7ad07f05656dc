//! The coordinator: worker lifecycle, topology, assignment, and film
//! accumulation.

use crate::core::camera::CameraDescription;
use crate::core::film::{Film, FilmTile};
use crate::core::geometry::Bounds2i;
use crate::core::sampler::SamplerDescription;
use crate::error::{Error, Result};
use crate::messages::{
    ConnectRequest, ConnectResponse, ConnectTo, GenerateRays, GetObjects, GetWorker, Message,
    MessageParser, OpCode, RecordReader,
};
use crate::net::UdpTransport;
use crate::rays::{FinishedRay, TreeletId, WorkerId};
use crate::scene::{Manifest, ObjectKey, ObjectType};
use crate::worker::WorkerStats;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

mod assignment;
mod estimators;
mod invoke;
mod registry;

// Re-export.
pub use assignment::*;
pub use estimators::*;
pub use invoke::*;
pub use registry::*;

/// Initial per-worker memory budget debited by assignments.
const WORKER_FREE_SPACE: u64 = 200 * 1024 * 1024;

/// Seed the coordinator answers every handshake with.
const COORDINATOR_SEED: u64 = 121_212;

/// Tile count used when the worker count is not known up front.
const DEFAULT_TILE_COUNT: u32 = 4;

/// Fraction of workers that must have bound their UDP address before
/// worker requests are brokered.
const WORKER_REQUEST_GATE: f64 = 0.90;

/// Treelet assignment mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Weighted placement from profiled treelet probabilities.
    Static,

    /// Worker `w` gets treelet `1 + (w mod (T - 1))`.
    Uniform,

    /// Unheld treelets first, then the treelet with the highest unmet
    /// demand that fits in the worker's free space.
    Dynamic,
}

/// Periodic-work intervals; tests shrink these.
#[derive(Copy, Clone, Debug)]
pub struct CoordinatorTimers {
    pub worker_request: Duration,
    pub status: Duration,
    pub write_output: Duration,
}

impl Default for CoordinatorTimers {
    fn default() -> Self {
        Self {
            worker_request: Duration::from_millis(250),
            status: Duration::from_millis(1_000),
            write_output: Duration::from_millis(10_000),
        }
    }
}

/// Coordinator configuration.
pub struct CoordinatorConfig {
    /// Path to the scene dump directory.
    pub scene_path: PathBuf,

    /// TCP and UDP listen port; 0 picks an ephemeral port.
    pub listen_port: u16,

    /// Public `"ip:port"` workers connect back to.
    pub public_address: String,

    /// Storage backend URI passed to invoked workers.
    pub storage_uri: String,

    /// Function-service region workers are launched in.
    pub aws_region: String,

    /// Number of workers to launch; 0 means workers join on their own.
    pub num_workers: u32,

    /// Treelet assignment mode.
    pub assignment: Assignment,

    /// Print the per-treelet table on each status tick.
    pub treelet_stats: bool,

    /// Print the per-worker table on each status tick.
    pub worker_stats: bool,

    /// Collect worker diagnostics before exiting.
    pub collect_diagnostics: bool,

    /// Eagerly connect every pair of workers.
    pub complete_topology: bool,

    /// Issue invocation requests at startup.
    pub launch_workers: bool,

    /// Periodic-work intervals.
    pub timers: CoordinatorTimers,
}

/// A pending request from a worker for a holder of some treelet.
#[derive(Copy, Clone, Debug)]
struct WorkerRequest {
    worker: WorkerId,
    treelet: TreeletId,
}

enum WorkerEvent {
    Message(WorkerId, Message),
    Disconnected(WorkerId),
}

/// Coordinator-side record of one connected worker.
struct WorkerRecord {
    id: WorkerId,
    writer: OwnedWriteHalf,
    udp_address: Option<SocketAddr>,
    tile: Option<Bounds2i>,
    objects: BTreeSet<ObjectKey>,
    free_space: u64,
    stats: WorkerStats,
}

/// The coordinator process.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: SceneRegistry,

    film: Film,
    film_tile: FilmTile,
    sample_bounds: Bounds2i,
    total_paths: u64,
    static_assignments: Vec<Vec<TreeletId>>,

    listener: TcpListener,
    transport: UdpTransport,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,

    workers: HashMap<WorkerId, WorkerRecord>,
    next_worker_id: WorkerId,
    initialized_workers: BTreeSet<WorkerId>,
    pending_worker_requests: VecDeque<WorkerRequest>,

    demand: DemandTracker,
    processed_ray_rates: HashMap<WorkerId, RateEstimator>,
    received_ray_rates: HashMap<WorkerId, RateEstimator>,
    received_byte_rates: HashMap<WorkerId, RateEstimator>,
    sent_byte_rates: HashMap<WorkerId, RateEstimator>,
    bytes_sent_rate: RateEstimator,
    bytes_received_rate: RateEstimator,
    global_stats: WorkerStats,
    treelet_priority: Vec<(u64, TreeletId)>,
    diagnostics_received: usize,

    start_time: Instant,
}

impl Coordinator {
    /// Load the scene, compute assignments, and bind the listeners. The
    /// treelet id set is closed from here on.
    ///
    /// * `config` - The coordinator configuration.
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        let manifest = Manifest::load(&config.scene_path)?;
        let registry = SceneRegistry::from_manifest(&manifest)?;

        let camera: CameraDescription =
            serde_json::from_slice(&std::fs::read(config.scene_path.join("CAMERA0"))?)?;
        let film = Film::new(&camera.film);
        let sample_bounds = film.get_sample_bounds();
        let film_tile = film.get_film_tile(sample_bounds);

        let sampler: SamplerDescription =
            serde_json::from_slice(&std::fs::read(config.scene_path.join("SAMPLER0"))?)?;
        let total_paths = sample_bounds.area() as u64 * sampler.samples_per_pixel as u64;

        let static_assignments = match config.assignment {
            Assignment::Static => {
                let probs = registry.treelet_probs.clone().ok_or_else(|| {
                    Error::Protocol(
                        "static assignment requires treelet_probs in the manifest".to_string(),
                    )
                })?;
                static_assignments(config.num_workers, &probs)?
            }
            Assignment::Uniform | Assignment::Dynamic => Vec::new(),
        };

        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let port = listener.local_addr()?.port();
        let transport = UdpTransport::bind(&format!("0.0.0.0:{port}")).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            registry,
            film,
            film_tile,
            sample_bounds,
            total_paths,
            static_assignments,
            listener,
            transport,
            events_tx,
            events_rx,
            workers: HashMap::new(),
            next_worker_id: 1,
            initialized_workers: BTreeSet::new(),
            pending_worker_requests: VecDeque::new(),
            demand: DemandTracker::new(),
            processed_ray_rates: HashMap::new(),
            received_ray_rates: HashMap::new(),
            received_byte_rates: HashMap::new(),
            sent_byte_rates: HashMap::new(),
            bytes_sent_rate: RateEstimator::default(),
            bytes_received_rate: RateEstimator::default(),
            global_stats: WorkerStats::default(),
            treelet_priority: Vec::new(),
            diagnostics_received: 0,
            start_time: Instant::now(),
        })
    }

    /// The bound TCP listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Paths finished across all workers so far.
    pub fn finished_paths(&self) -> u64 {
        self.global_stats.finished_paths
    }

    /// Launch the workers and run the control plane until interrupted.
    pub async fn run(&mut self) -> Result<()> {
        if self.config.launch_workers && self.config.num_workers > 0 {
            info!("launching {} worker(s)...", self.config.num_workers);
            let payload = InvocationPayload {
                storage_backend: self.config.storage_uri.clone(),
                coordinator: self.config.public_address.clone(),
            };
            launch_workers(
                self.config.num_workers,
                &invocation_endpoint(&self.config.aws_region),
                &payload,
            );
        }

        let result = self.run_loop().await;
        if result.is_ok() {
            self.shutdown().await?;
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut request_timer = interval_timer(self.config.timers.worker_request);
        let mut status_timer = interval_timer(self.config.timers.status);
        let mut output_timer = interval_timer(self.config.timers.write_output);

        loop {
            tokio::select! {
                biased;

                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    return Ok(());
                }

                res = self.listener.accept() => {
                    let (stream, addr) = res?;
                    self.handle_accept(stream, addr)?;
                }

                Some(event) = self.events_rx.recv() => match event {
                    WorkerEvent::Message(worker_id, message) => {
                        self.process_message(worker_id, &message).await?;
                    }
                    WorkerEvent::Disconnected(worker_id) => {
                        return Err(Error::WorkerDied(worker_id));
                    }
                },

                datagram = self.transport.recv() => {
                    let (addr, payload) = datagram?;
                    self.handle_udp(addr, &payload).await?;
                }

                _ = request_timer.tick(), if !self.pending_worker_requests.is_empty() => {
                    self.handle_worker_requests().await?;
                }

                _ = output_timer.tick() => {
                    self.handle_write_output()?;
                }

                _ = status_timer.tick() => {
                    self.update_status();
                }
            }

            self.transport.pump();
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        info!("incoming connection from {addr}, assigned worker id {worker_id}");

        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(reader_task(worker_id, read_half, self.events_tx.clone()));

        let mut record = WorkerRecord {
            id: worker_id,
            writer: write_half,
            udp_address: None,
            tile: None,
            objects: BTreeSet::new(),
            free_space: WORKER_FREE_SPACE,
            stats: WorkerStats::default(),
        };

        self.assign_base_objects(&mut record);

        let tile_count = if self.config.num_workers == 0 {
            DEFAULT_TILE_COUNT
        } else {
            self.config.num_workers
        };
        let tile_index = (worker_id - 1) as u32;
        if tile_index < tile_count {
            let tile = get_tile(tile_index, tile_count, self.sample_bounds)?;
            info!(
                "worker {worker_id}/{tile_count} was assigned tile {tile} from bounds {}",
                self.sample_bounds
            );
            record.tile = Some(tile);
        }

        match self.config.assignment {
            Assignment::Static => {
                self.assign_treelet(&mut record, 0);
                let treelets = self
                    .static_assignments
                    .get(tile_index as usize)
                    .cloned()
                    .unwrap_or_default();
                for treelet in treelets {
                    self.assign_treelet(&mut record, treelet);
                }
            }
            Assignment::Uniform => {
                self.assign_treelets_uniformly(&mut record);
            }
            Assignment::Dynamic => {
                self.assign_treelets_by_demand(&mut record);
            }
        }

        self.workers.insert(worker_id, record);
        Ok(())
    }

    fn assign_object(&mut self, worker: &mut WorkerRecord, key: ObjectKey) {
        if worker.objects.contains(&key) {
            return;
        }
        if let Some(info) = self.registry.scene_objects.get_mut(&key) {
            info.workers.insert(worker.id);
            worker.free_space = worker.free_space.saturating_sub(info.size);
        }
        worker.objects.insert(key);
    }

    fn assign_treelet(&mut self, worker: &mut WorkerRecord, treelet_id: TreeletId) {
        self.assign_object(worker, ObjectKey::new(ObjectType::Treelet, treelet_id as u64));
        let deps = self
            .registry
            .treelet_dependencies
            .get(&treelet_id)
            .cloned()
            .unwrap_or_default();
        for dep in deps {
            self.assign_object(worker, dep);
        }
    }

    fn assign_base_objects(&mut self, worker: &mut WorkerRecord) {
        self.assign_object(worker, ObjectKey::new(ObjectType::Scene, 0));
        self.assign_object(worker, ObjectKey::new(ObjectType::Camera, 0));
        self.assign_object(worker, ObjectKey::new(ObjectType::Sampler, 0));
        self.assign_object(worker, ObjectKey::new(ObjectType::Lights, 0));
    }

    fn assign_treelets_uniformly(&mut self, worker: &mut WorkerRecord) {
        self.assign_treelet(worker, 0);
        let n_non_root = self.registry.treelet_ids.len().saturating_sub(1) as u32;
        if n_non_root > 0 {
            let wid = worker.id as u32;
            self.assign_treelet(worker, 1 + wid % n_non_root);
        }
    }

    fn assign_treelets_by_demand(&mut self, worker: &mut WorkerRecord) {
        self.assign_treelet(worker, 0);

        let fits = |registry: &SceneRegistry, treelet: TreeletId, free_space: u64| {
            registry
                .treelet_total_sizes
                .get(&treelet)
                .copied()
                .unwrap_or(0)
                < free_space
        };

        // Treelets nobody holds yet take precedence.
        let unheld = self.registry.treelet_ids.iter().copied().find(|treelet| {
            *treelet != 0
                && fits(&self.registry, *treelet, worker.free_space)
                && self
                    .registry
                    .treelet_holders(*treelet)
                    .map_or(true, |holders| holders.is_empty())
        });
        if let Some(treelet) = unheld {
            self.assign_treelet(worker, treelet);
            return;
        }

        // Otherwise the treelet with the largest backlog of waiting rays
        // that fits; without any load information, a random treelet.
        let by_load = self
            .treelet_priority
            .iter()
            .find(|(load, treelet)| {
                *load > 0 && fits(&self.registry, *treelet, worker.free_space)
            })
            .map(|(_, treelet)| *treelet);
        let choice = by_load.or_else(|| {
            let candidates: Vec<TreeletId> = self
                .registry
                .treelet_ids
                .iter()
                .copied()
                .filter(|treelet| *treelet != 0)
                .collect();
            candidates.choose(&mut rand::thread_rng()).copied()
        });
        if let Some(treelet) = choice {
            self.assign_treelet(worker, treelet);
        }
    }

    /// Handle a datagram on the coordinator's UDP endpoint. Only
    /// `ConnectionRequest` is accepted here; its source address becomes
    /// the worker's UDP address, fanned out to peers later.
    async fn handle_udp(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        let mut parser = MessageParser::new();
        parser.parse(payload)?;
        let Some(message) = parser.pop() else {
            return Ok(());
        };
        if message.opcode != OpCode::ConnectionRequest {
            return Ok(());
        }

        let request = ConnectRequest::decode(&message.payload)?;
        let worker_id = request.worker_id;

        let newly_bound = {
            let worker = self
                .workers
                .get_mut(&worker_id)
                .ok_or(Error::UnexpectedWorker(worker_id))?;
            if worker.udp_address != Some(addr) {
                worker.udp_address = Some(addr);
                self.initialized_workers.insert(worker_id);
                true
            } else {
                false
            }
        };

        if newly_bound && self.config.complete_topology {
            let others: Vec<WorkerId> = self
                .initialized_workers
                .iter()
                .copied()
                .filter(|id| *id != worker_id)
                .collect();
            for other in others {
                if !self.connect_workers(worker_id, other).await? {
                    return Err(Error::Protocol(format!(
                        "could not connect workers {worker_id} and {other}"
                    )));
                }
            }
        }

        let response = ConnectResponse {
            worker_id: 0,
            my_seed: COORDINATOR_SEED,
            your_seed: request.my_seed,
            treelet_ids: Vec::new(),
        }
        .to_message();
        self.send_to_worker(worker_id, &response).await
    }

    async fn send_to_worker(&mut self, worker_id: WorkerId, message: &Message) -> Result<()> {
        let worker = self
            .workers
            .get_mut(&worker_id)
            .ok_or(Error::UnexpectedWorker(worker_id))?;
        worker.writer.write_all(&message.to_bytes()).await?;
        Ok(())
    }

    /// Exchange `ConnectTo` messages so two workers can handshake.
    /// Returns false when either side has no UDP address yet.
    async fn connect_workers(&mut self, a: WorkerId, b: WorkerId) -> Result<bool> {
        let addr_of = |workers: &HashMap<WorkerId, WorkerRecord>, id: WorkerId| {
            workers.get(&id).and_then(|w| w.udp_address)
        };
        let (Some(addr_a), Some(addr_b)) =
            (addr_of(&self.workers, a), addr_of(&self.workers, b))
        else {
            return Ok(false);
        };

        let to_b = ConnectTo {
            worker_id: b,
            address: addr_b.to_string(),
        }
        .to_message();
        let to_a = ConnectTo {
            worker_id: a,
            address: addr_a.to_string(),
        }
        .to_message();

        self.send_to_worker(a, &to_b).await?;
        self.send_to_worker(b, &to_a).await?;
        Ok(true)
    }

    async fn process_message(&mut self, worker_id: WorkerId, message: &Message) -> Result<()> {
        match message.opcode {
            OpCode::Hey => {
                let hey_back =
                    Message::new(OpCode::Hey, worker_id.to_string().into_bytes());
                self.send_to_worker(worker_id, &hey_back).await?;

                let objects = {
                    let worker = self
                        .workers
                        .get(&worker_id)
                        .ok_or(Error::UnexpectedWorker(worker_id))?;
                    GetObjects {
                        object_ids: worker.objects.iter().copied().collect(),
                    }
                    .to_message()
                };
                self.send_to_worker(worker_id, &objects).await?;

                let tile = self.workers.get(&worker_id).and_then(|w| w.tile);
                if let Some(tile) = tile {
                    let generate = GenerateRays { crop_window: tile }.to_message();
                    self.send_to_worker(worker_id, &generate).await?;
                }
            }

            OpCode::Ping => {
                let pong = Message::new(OpCode::Pong, Vec::new());
                self.send_to_worker(worker_id, &pong).await?;
            }

            OpCode::Pong => {}

            OpCode::GetWorker => {
                let request = GetWorker::decode(&message.payload)?;
                self.pending_worker_requests.push_back(WorkerRequest {
                    worker: worker_id,
                    treelet: request.treelet_id,
                });
            }

            OpCode::WorkerStats => {
                let stats = WorkerStats::decode(&message.payload)?;
                self.handle_worker_stats(worker_id, stats)?;
            }

            OpCode::FinishedRays => {
                for record in RecordReader::new(&message.payload) {
                    let finished = FinishedRay::decode(record)?;
                    self.film_tile
                        .add_sample(finished.p_film, finished.l, finished.weight);
                }
            }

            other => {
                return Err(Error::Protocol(format!(
                    "unhandled opcode {other:?} on the coordinator"
                )));
            }
        }
        Ok(())
    }

    fn handle_worker_stats(&mut self, worker_id: WorkerId, stats: WorkerStats) -> Result<()> {
        if !stats.time_per_action.is_empty() {
            self.diagnostics_received += 1;
        }

        self.demand.submit(worker_id, &stats);
        self.processed_ray_rates
            .entry(worker_id)
            .or_default()
            .update(stats.aggregate.processed_rays as f64);
        self.received_ray_rates
            .entry(worker_id)
            .or_default()
            .update(stats.aggregate.received_rays as f64);
        self.received_byte_rates
            .entry(worker_id)
            .or_default()
            .update(stats.bytes_received as f64);
        self.sent_byte_rates
            .entry(worker_id)
            .or_default()
            .update(stats.bytes_sent as f64);
        self.bytes_received_rate.update(stats.bytes_received as f64);
        self.bytes_sent_rate.update(stats.bytes_sent as f64);

        self.global_stats.merge(&stats);
        self.workers
            .get_mut(&worker_id)
            .ok_or(Error::UnexpectedWorker(worker_id))?
            .stats
            .merge(&stats);

        let mut loads: Vec<(u64, TreeletId)> = self
            .global_stats
            .object_stats
            .iter()
            .map(|(treelet, s)| (s.waiting_rays.saturating_sub(s.processed_rays), *treelet))
            .collect();
        loads.sort_unstable_by(|a, b| b.cmp(a));
        self.treelet_priority = loads;
        Ok(())
    }

    /// Broker queued worker requests once enough of the fleet has bound
    /// its UDP address. Requests whose treelet has no holder yet are
    /// re-queued for a later batch.
    async fn handle_worker_requests(&mut self) -> Result<()> {
        let gate = self.config.num_workers as f64 * WORKER_REQUEST_GATE;
        if (self.initialized_workers.len() as f64) < gate {
            return Ok(());
        }

        let mut unprocessed = VecDeque::new();
        while let Some(request) = self.pending_worker_requests.pop_front() {
            if !self.process_worker_request(&request).await? {
                unprocessed.push_back(request);
            }
        }
        self.pending_worker_requests = unprocessed;
        Ok(())
    }

    async fn process_worker_request(&mut self, request: &WorkerRequest) -> Result<bool> {
        let holders = self
            .registry
            .treelet_holders(request.treelet)
            .ok_or_else(|| {
                Error::UnknownObject(
                    ObjectKey::new(ObjectType::Treelet, request.treelet as u64).object_name(),
                )
            })?;
        if holders.is_empty() {
            return Ok(false);
        }

        let candidates: Vec<WorkerId> = holders.iter().copied().collect();
        let selected = *candidates
            .choose(&mut rand::thread_rng())
            .expect("candidate list is non-empty");
        self.connect_workers(request.worker, selected).await
    }

    /// Merge the film tile into the film, write the image, and start a
    /// fresh tile. Idempotent across ticks.
    fn handle_write_output(&mut self) -> Result<()> {
        let tile = std::mem::replace(
            &mut self.film_tile,
            self.film.get_film_tile(self.sample_bounds),
        );
        self.film.merge_film_tile(tile);
        self.film.write_image(None)?;
        Ok(())
    }

    fn update_status(&mut self) {
        self.global_stats.queue_stats = Default::default();
        for worker in self.workers.values() {
            let q = &worker.stats.queue_stats;
            let total = &mut self.global_stats.queue_stats;
            total.ray += q.ray;
            total.finished += q.finished;
            total.pending += q.pending;
            total.out += q.out;
            total.connecting += q.connecting;
            total.connected += q.connected;
            total.outstanding_udp += q.outstanding_udp;
        }

        let elapsed = self.start_time.elapsed().as_secs();
        let finished = self.global_stats.finished_paths;
        let percent = if self.total_paths > 0 {
            100.0 * finished as f64 / self.total_paths as f64
        } else {
            0.0
        };
        let sent = self.global_stats.aggregate.sent_rays;
        let received = self.global_stats.aggregate.received_rays;
        info!(
            "done paths: {finished} ({percent:.1}%) | workers: {} ({}) | requests: {} | \u{2191} {sent} | \u{2193} {received} | time: {:02}:{:02}",
            self.workers.len(),
            self.initialized_workers.len(),
            self.pending_worker_requests.len(),
            elapsed / 60,
            elapsed % 60,
        );

        if self.config.treelet_stats {
            println!("net demand (rays/s): {:.1}", self.demand.net_demand());
            for treelet in &self.registry.treelet_ids {
                let holders = self
                    .registry
                    .treelet_holders(*treelet)
                    .map(|h| h.len())
                    .unwrap_or(0);
                println!(
                    "  T{treelet}: demand {:8.1} rays/s, allocations {holders}",
                    self.demand.treelet_demand(*treelet)
                );
            }
        }

        if self.config.worker_stats {
            for (id, worker) in &self.workers {
                let q = &worker.stats.queue_stats;
                println!(
                    "  worker {id}: processed {:8.0}/s, received {:8.0}/s, \u{2193} {:10.0} b/s, \u{2191} {:10.0} b/s, ray {} / pending {} / out {} / udp {}",
                    self.processed_ray_rates.get(id).map(|r| r.get_rate()).unwrap_or(0.0),
                    self.received_ray_rates.get(id).map(|r| r.get_rate()).unwrap_or(0.0),
                    8.0 * self.received_byte_rates.get(id).map(|r| r.get_rate()).unwrap_or(0.0),
                    8.0 * self.sent_byte_rates.get(id).map(|r| r.get_rate()).unwrap_or(0.0),
                    q.ray,
                    q.pending,
                    q.out,
                    q.outstanding_udp,
                );
            }
            println!(
                "  net: {} bytes sent, {} bytes received, send rate {:.0} b/s, receive rate {:.0} b/s",
                self.global_stats.bytes_sent,
                self.global_stats.bytes_received,
                8.0 * self.bytes_sent_rate.get_rate(),
                8.0 * self.bytes_received_rate.get_rate(),
            );
        }
    }

    /// Clean shutdown: optionally gather diagnostics from every worker,
    /// send `Bye`, and write the final image.
    async fn shutdown(&mut self) -> Result<()> {
        if self.config.collect_diagnostics && !self.workers.is_empty() {
            info!("waiting for diagnostics from {} worker(s)", self.workers.len());
            self.diagnostics_received = 0;
            let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
            let request = Message::new(OpCode::RequestDiagnostics, Vec::new());
            for id in &ids {
                self.send_to_worker(*id, &request).await?;
            }

            let deadline = Instant::now() + Duration::from_secs(10);
            while self.diagnostics_received < ids.len() && Instant::now() < deadline {
                match tokio::time::timeout(Duration::from_millis(250), self.events_rx.recv())
                    .await
                {
                    Ok(Some(WorkerEvent::Message(id, message))) => {
                        self.process_message(id, &message).await?;
                    }
                    Ok(Some(WorkerEvent::Disconnected(_))) | Ok(None) => break,
                    Err(_) => {}
                }
            }
        }

        let bye = Message::new(OpCode::Bye, Vec::new());
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            // Workers may already be gone on shutdown.
            let _ = self.send_to_worker(id, &bye).await;
        }

        self.handle_write_output()?;

        let elapsed = self.start_time.elapsed().as_secs();
        info!(
            "summary: finished paths: {} ({:.1}%) | workers: {} | time: {:02}:{:02}",
            self.global_stats.finished_paths,
            if self.total_paths > 0 {
                100.0 * self.global_stats.finished_paths as f64 / self.total_paths as f64
            } else {
                0.0
            },
            self.workers.len(),
            elapsed / 60,
            elapsed % 60,
        );
        Ok(())
    }
}

async fn reader_task(
    worker_id: WorkerId,
    mut read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut parser = MessageParser::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send(WorkerEvent::Disconnected(worker_id));
                return;
            }
            Ok(n) => {
                if parser.parse(&buf[..n]).is_err() {
                    let _ = events.send(WorkerEvent::Disconnected(worker_id));
                    return;
                }
                while let Some(message) = parser.pop() {
                    if events.send(WorkerEvent::Message(worker_id, message)).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn interval_timer(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
