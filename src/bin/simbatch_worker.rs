//! simbatch remote worker
//!
//! Serves `SimWorker.ExecuteBatch` over gRPC using the standard operation
//! registry.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use simbatch::transport::SimWorkerService;
use simbatch::{BatchWorker, OperationRegistry};

const DEFAULT_PORT: u16 = 50061;

/// Worker configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
        }
    }
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    if let Some(value) = args.get(i + 1) {
        value.clone()
    } else {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                let raw = value_of(&args, i, "--port");
                let port: u16 = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid port number: {raw}");
                    std::process::exit(1);
                });
                config.addr.set_port(port);
                i += 2;
            }
            "--host" => {
                let raw = value_of(&args, i, "--host");
                let ip: IpAddr = raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid host address: {raw}");
                    std::process::exit(1);
                });
                config.addr.set_ip(ip);
                i += 2;
            }
            "--help" | "-h" => {
                println!("simbatch-worker - remote batch worker");
                println!();
                println!("USAGE:");
                println!("    simbatch-worker [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --port <PORT>         Port to listen on [default: {DEFAULT_PORT}]");
                println!("        --host <ADDR>         Address to bind [default: 127.0.0.1]");
                println!("    -h, --help                Print help information");
                println!();
                println!("Log verbosity follows RUST_LOG (default: info).");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = Arc::new(OperationRegistry::standard());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        operations = ?registry.names(),
        "simbatch worker starting"
    );

    let svc = SimWorkerService::new(Arc::new(BatchWorker::new(registry))).into_server();

    tracing::info!(addr = %config.addr, "serving SimWorker over gRPC");
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("worker shut down");
    Ok(())
}
