//! The worker binary.

#[macro_use]
extern crate log;

use cirrus::worker::{FinishedRayPolicy, Worker, WorkerConfig};
use clap::Parser;
use std::net::ToSocketAddrs;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about = "Worker for the cirrus distributed path tracer")]
struct Options {
    /// IP of the coordinator.
    #[arg(long, short = 'i', value_name = "IPSTRING")]
    ip: String,

    /// Port of the coordinator.
    #[arg(long, short = 'p', value_name = "PORT", default_value_t = 50_000)]
    port: u16,

    /// Storage backend URI.
    #[arg(long = "storage-backend", short = 's', value_name = "URI")]
    storage_backend: String,

    /// Send ray packets reliably.
    #[arg(long = "reliable-udp", short = 'R')]
    reliable_udp: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let options = Options::parse();

    let working_dir = std::env::temp_dir().join(format!("cirrus-worker-{}", std::process::id()));
    if let Err(e) = std::fs::create_dir_all(&working_dir) {
        eprintln!("cannot create working directory: {e}");
        return ExitCode::FAILURE;
    }

    // Log to a file inside the working directory so the log can be
    // uploaded next to the diagnostics on exit.
    let log_file = match std::fs::File::create(working_dir.join("worker.log")) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("cannot create log file: {e}");
            return ExitCode::FAILURE;
        }
    };
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();

    info!("starting worker in {}", working_dir.display());

    let coordinator = match (options.ip.as_str(), options.port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
    {
        Some(addr) => addr,
        None => {
            error!("cannot resolve coordinator address {}:{}", options.ip, options.port);
            return ExitCode::FAILURE;
        }
    };

    let config = WorkerConfig {
        coordinator,
        storage_uri: options.storage_backend,
        send_reliably: options.reliable_udp,
        finished_policy: FinishedRayPolicy::Forward,
        working_dir,
        log_prefix: "logs/".to_string(),
    };

    let mut worker = match Worker::new(config).await {
        Ok(worker) => worker,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let status = match worker.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    };

    if let Err(e) = worker.upload_logs().await {
        error!("log upload failed: {e}");
    }
    status
}
