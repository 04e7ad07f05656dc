//! End-to-end scenarios: a real coordinator and real workers talking
//! over localhost sockets against a `file://` scene dump.

use cirrus::coordinator::{Assignment, Coordinator, CoordinatorConfig, CoordinatorTimers};
use cirrus::core::camera::CameraDescription;
use cirrus::core::film::FilmDescription;
use cirrus::core::filter::Filter;
use cirrus::core::geometry::{Point2i, Point3f, Vector2f};
use cirrus::core::light::Light;
use cirrus::core::sampler::{SamplerDescription, SamplerKind};
use cirrus::core::spectrum::RGBSpectrum;
use cirrus::messages::{ConnectRequest, ConnectTo, Message, MessageParser, OpCode};
use cirrus::net::{PacketPriority, PacketType, UdpTransport};
use cirrus::rays::TreeletId;
use cirrus::scene::{
    Manifest, ManifestObject, ObjectKey, ObjectType, SceneDescription, Surface, TreeletPayload,
};
use cirrus::storage::scratch_dir;
use cirrus::worker::{FinishedRayPolicy, Worker, WorkerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::LocalSet;

/// Write a complete scene dump: manifest, scene, camera, sampler,
/// lights, and the given treelet payloads.
fn write_scene_dump(
    dir: &Path,
    resolution: Point2i,
    treelets: &[(TreeletId, TreeletPayload)],
    lights: &[Light],
) -> PathBuf {
    let output = dir.join("out.png");

    let scene = SceneDescription { max_depth: 5 };
    let camera = CameraDescription {
        fov: 60.0,
        shutter_open: 0.0,
        shutter_close: 1.0,
        film: FilmDescription {
            resolution,
            filter: Filter::Box {
                radius: Vector2f::new(0.5, 0.5),
            },
            filename: output.display().to_string(),
        },
    };
    let sampler = SamplerDescription {
        kind: SamplerKind::Random,
        samples_per_pixel: 1,
    };

    let mut objects = Vec::new();
    let mut write_object = |key: ObjectKey, bytes: Vec<u8>| {
        std::fs::write(dir.join(key.object_name()), &bytes).unwrap();
        objects.push(ManifestObject {
            key,
            size: bytes.len() as u64,
        });
    };

    write_object(
        ObjectKey::new(ObjectType::Scene, 0),
        serde_json::to_vec(&scene).unwrap(),
    );
    write_object(
        ObjectKey::new(ObjectType::Camera, 0),
        serde_json::to_vec(&camera).unwrap(),
    );
    write_object(
        ObjectKey::new(ObjectType::Sampler, 0),
        serde_json::to_vec(&sampler).unwrap(),
    );
    write_object(
        ObjectKey::new(ObjectType::Lights, 0),
        serde_json::to_vec(&lights).unwrap(),
    );
    for (id, payload) in treelets {
        write_object(
            ObjectKey::new(ObjectType::Treelet, *id as u64),
            serde_json::to_vec(payload).unwrap(),
        );
    }

    Manifest {
        objects,
        dependencies: Vec::new(),
        treelet_probs: None,
    }
    .save(dir)
    .unwrap();

    output
}

fn coordinator_config(dump: &Path, num_workers: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        scene_path: dump.to_path_buf(),
        listen_port: 0,
        public_address: "127.0.0.1:0".to_string(),
        storage_uri: format!("file://{}", dump.display()),
        aws_region: "us-west-2".to_string(),
        num_workers,
        assignment: Assignment::Uniform,
        treelet_stats: false,
        worker_stats: false,
        collect_diagnostics: false,
        complete_topology: false,
        launch_workers: false,
        timers: CoordinatorTimers {
            worker_request: Duration::from_millis(50),
            status: Duration::from_millis(500),
            write_output: Duration::from_millis(200),
        },
    }
}

fn worker_config(coordinator: SocketAddr, dump: &Path) -> WorkerConfig {
    WorkerConfig {
        coordinator,
        storage_uri: format!("file://{}", dump.display()),
        send_reliably: false,
        finished_policy: FinishedRayPolicy::Forward,
        working_dir: scratch_dir("cirrus-e2e-worker").unwrap(),
        log_prefix: "logs/".to_string(),
    }
}

fn local_addr_of(coordinator: &Coordinator) -> SocketAddr {
    let port = coordinator.listen_addr().unwrap().port();
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Wait until the output image exists and contains a non-black pixel.
async fn wait_for_lit_image(output: &Path) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if output.exists() {
            if let Ok(img) = image::open(output) {
                let lit = img
                    .to_rgb8()
                    .pixels()
                    .any(|p| p.0[0] > 0 || p.0[1] > 0 || p.0[2] > 0);
                if lit {
                    return;
                }
            }
        }
        assert!(
            Instant::now() < deadline,
            "no lit output image at {}",
            output.display()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn single_worker_single_treelet_resolves_a_sample() {
    let dump = scratch_dir("cirrus-e2e-single").unwrap();
    // The root forwards into treelet 1, whose surface sits at t = 2; the
    // light is closer than the surface so shadow rays escape.
    let output = write_scene_dump(
        &dump,
        Point2i::new(1, 1),
        &[
            (
                0,
                TreeletPayload {
                    children: vec![1],
                    surface: None,
                },
            ),
            (
                1,
                TreeletPayload {
                    children: vec![],
                    surface: Some(Surface {
                        t: 2.0,
                        albedo: RGBSpectrum::new(0.8),
                    }),
                },
            ),
        ],
        &[Light::Point {
            from: Point3f::new(0.0, 0.0, 1.5),
            intensity: RGBSpectrum::new(1.0),
        }],
    );

    let local = LocalSet::new();
    local
        .run_until(async {
            let coordinator = Coordinator::bind(coordinator_config(&dump, 1)).await.unwrap();
            let coordinator_addr = local_addr_of(&coordinator);
            tokio::task::spawn_local(async move {
                let mut coordinator = coordinator;
                let _ = coordinator.run().await;
            });

            let worker = Worker::new(worker_config(coordinator_addr, &dump))
                .await
                .unwrap();
            tokio::task::spawn_local(async move {
                let mut worker = worker;
                let _ = worker.run().await;
            });

            wait_for_lit_image(&output).await;
        })
        .await;
}

#[tokio::test]
async fn two_workers_forward_rays_between_treelets() {
    let dump = scratch_dir("cirrus-e2e-forward").unwrap();
    // Only treelet 2 carries a surface, and uniform assignment puts
    // treelet 1 and treelet 2 on different workers, so no sample can
    // resolve without at least one SendRays hop.
    let output = write_scene_dump(
        &dump,
        Point2i::new(2, 2),
        &[
            (
                0,
                TreeletPayload {
                    children: vec![1],
                    surface: None,
                },
            ),
            (
                1,
                TreeletPayload {
                    children: vec![2],
                    surface: None,
                },
            ),
            (
                2,
                TreeletPayload {
                    children: vec![],
                    surface: Some(Surface {
                        t: 2.0,
                        albedo: RGBSpectrum::new(0.8),
                    }),
                },
            ),
        ],
        &[Light::Point {
            from: Point3f::new(0.0, 0.0, 1.5),
            intensity: RGBSpectrum::new(1.0),
        }],
    );

    let local = LocalSet::new();
    local
        .run_until(async {
            let coordinator = Coordinator::bind(coordinator_config(&dump, 2)).await.unwrap();
            let coordinator_addr = local_addr_of(&coordinator);
            tokio::task::spawn_local(async move {
                let mut coordinator = coordinator;
                let _ = coordinator.run().await;
            });

            for _ in 0..2 {
                let worker = Worker::new(worker_config(coordinator_addr, &dump))
                    .await
                    .unwrap();
                tokio::task::spawn_local(async move {
                    let mut worker = worker;
                    let _ = worker.run().await;
                });
            }

            wait_for_lit_image(&output).await;
        })
        .await;
}

/// A protocol-level stand-in for a worker, used to observe exactly what
/// the coordinator sends.
struct FakeWorker {
    tcp: TcpStream,
    parser: MessageParser,
    transport: UdpTransport,
    buf: Vec<u8>,
}

impl FakeWorker {
    async fn connect(coordinator: SocketAddr) -> Self {
        let mut tcp = TcpStream::connect(coordinator).await.unwrap();
        let hey = Message::new(OpCode::Hey, b"log-stream".to_vec());
        tcp.write_all(&hey.to_bytes()).await.unwrap();
        Self {
            tcp,
            parser: MessageParser::new(),
            transport: UdpTransport::bind("127.0.0.1:0").await.unwrap(),
            buf: vec![0u8; 16 * 1024],
        }
    }

    async fn next_message(&mut self) -> Message {
        loop {
            if let Some(message) = self.parser.pop() {
                return message;
            }
            let n = self.tcp.read(&mut self.buf).await.unwrap();
            assert!(n > 0, "coordinator closed the connection");
            self.parser.parse(&self.buf[..n]).unwrap();
        }
    }

    async fn next_message_timeout(&mut self, wait: Duration) -> Option<Message> {
        tokio::time::timeout(wait, self.next_message()).await.ok()
    }

    /// Read the assignment handshake: Hey, GetObjects, and (for workers
    /// inside the tile partition) GenerateRays. Returns the assigned
    /// worker id.
    async fn read_assignment(&mut self, expect_tile: bool) -> u64 {
        let hey = self.next_message().await;
        assert_eq!(hey.opcode, OpCode::Hey);
        let id: u64 = String::from_utf8(hey.payload).unwrap().parse().unwrap();

        let objects = self.next_message().await;
        assert_eq!(objects.opcode, OpCode::GetObjects);
        if expect_tile {
            let rays = self.next_message().await;
            assert_eq!(rays.opcode, OpCode::GenerateRays);
        }
        id
    }

    /// Bind our UDP address on the coordinator with a handshake request
    /// and wait for its response.
    async fn initialize(&mut self, coordinator: SocketAddr, worker_id: u64) {
        let request = ConnectRequest {
            worker_id,
            my_seed: 7_000 + worker_id,
            your_seed: 0,
        }
        .to_message();
        self.transport
            .enqueue(
                coordinator,
                &request.to_bytes(),
                PacketPriority::High,
                PacketType::Unreliable,
            )
            .unwrap();
        self.transport.pump();

        let response = self
            .next_message_timeout(Duration::from_secs(5))
            .await
            .expect("no ConnectionResponse from the coordinator");
        assert_eq!(response.opcode, OpCode::ConnectionResponse);
    }
}

#[tokio::test]
async fn missing_holder_requests_are_requeued_until_assignment() {
    let dump = scratch_dir("cirrus-e2e-requeue").unwrap();
    // Three non-root treelets and two launched workers: uniform
    // assignment maps worker ids 1, 2, 3 to treelets 2, 3, 1, so treelet
    // 1 has no holder until a third worker joins.
    let treelets: Vec<(TreeletId, TreeletPayload)> = (0..4)
        .map(|id| (id, TreeletPayload::default()))
        .collect();
    write_scene_dump(&dump, Point2i::new(4, 4), &treelets, &[]);

    let coordinator = Coordinator::bind(coordinator_config(&dump, 2)).await.unwrap();
    let coordinator_addr = local_addr_of(&coordinator);
    let udp_addr = coordinator_addr;
    tokio::spawn(async move {
        let mut coordinator = coordinator;
        let _ = coordinator.run().await;
    });

    // Workers 1 and 2 join and initialize; uniform assignment gives
    // them treelets 2 and 3.
    let mut worker1 = FakeWorker::connect(coordinator_addr).await;
    let id1 = worker1.read_assignment(true).await;
    worker1.initialize(udp_addr, id1).await;

    let mut worker2 = FakeWorker::connect(coordinator_addr).await;
    let id2 = worker2.read_assignment(true).await;
    worker2.initialize(udp_addr, id2).await;

    // Worker 1 asks for a holder of treelet 1; nobody holds it yet, so
    // the request parks in the batch queue.
    let get_worker = cirrus::messages::GetWorker { treelet_id: 1 }.to_message();
    worker1.tcp.write_all(&get_worker.to_bytes()).await.unwrap();
    assert!(
        worker1
            .next_message_timeout(Duration::from_millis(400))
            .await
            .is_none(),
        "got a ConnectTo before any worker held treelet 1"
    );

    // A third worker joins and is assigned treelet 1; the next batch
    // connects the two peers.
    let mut worker3 = FakeWorker::connect(coordinator_addr).await;
    let id3 = worker3.read_assignment(false).await;
    worker3.initialize(udp_addr, id3).await;

    let message = worker1
        .next_message_timeout(Duration::from_secs(5))
        .await
        .expect("no ConnectTo after treelet 1 was assigned");
    assert_eq!(message.opcode, OpCode::ConnectTo);
    let connect = ConnectTo::decode(&message.payload).unwrap();
    assert_eq!(connect.worker_id, id3);

    // The other side of the pairing gets the mirror ConnectTo.
    let mirror = worker3
        .next_message_timeout(Duration::from_secs(5))
        .await
        .expect("no mirror ConnectTo for the new holder");
    assert_eq!(mirror.opcode, OpCode::ConnectTo);
    let mirror = ConnectTo::decode(&mirror.payload).unwrap();
    assert_eq!(mirror.worker_id, id1);
}
