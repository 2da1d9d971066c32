//! EmberKV - An Event-Driven In-Memory Key-Value Server
//!
//! This is the main entry point for the EmberKV server.
//! It parses the command line, sets up logging, and runs the reactor until
//! Ctrl+C is pressed.

use anyhow::Context;
use emberkv::concurrency::ExecutorConfig;
use emberkv::server::{Server, ServerConfig};
use emberkv::storage::StorageEngine;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Worker threads kept alive when idle
    min_workers: usize,
    /// Upper bound on worker threads
    max_workers: usize,
    /// Pending callbacks before the executor pushes back
    queue_size: usize,
    /// Idle time before a surplus worker retires
    idle_timeout_ms: u64,
    /// Per-connection read buffer size
    read_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        let executor = ExecutorConfig::default();
        Self {
            host: emberkv::DEFAULT_HOST.to_string(),
            port: emberkv::DEFAULT_PORT,
            min_workers: executor.low_watermark,
            max_workers: executor.high_watermark,
            queue_size: executor.max_queue_size,
            idle_timeout_ms: executor.idle_timeout.as_millis() as u64,
            read_buffer: emberkv::connection::DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => config.host = value(&args, i, "--host"),
                "--port" | "-p" => config.port = value(&args, i, "--port"),
                "--min-workers" => config.min_workers = value(&args, i, "--min-workers"),
                "--max-workers" => config.max_workers = value(&args, i, "--max-workers"),
                "--queue-size" => config.queue_size = value(&args, i, "--queue-size"),
                "--idle-timeout-ms" => {
                    config.idle_timeout_ms = value(&args, i, "--idle-timeout-ms")
                }
                "--read-buffer" => config.read_buffer = value(&args, i, "--read-buffer"),
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("EmberKV version {}", emberkv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
            // Every option except the exiting ones takes a value.
            i += 2;
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let addr: SocketAddr = self
            .bind_address()
            .to_socket_addrs()
            .with_context(|| format!("invalid address {}", self.bind_address()))?
            .next()
            .with_context(|| format!("{} did not resolve", self.bind_address()))?;

        let executor = ExecutorConfig::new(
            self.min_workers,
            self.max_workers,
            self.queue_size,
            Duration::from_millis(self.idle_timeout_ms),
        );

        Ok(ServerConfig::new(addr)
            .with_executor(executor)
            .with_read_buffer_size(self.read_buffer))
    }
}

/// Reads the value following the flag at `args[i]`, exiting on error.
fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> T {
    let Some(raw) = args.get(i + 1) else {
        eprintln!("Error: {} requires a value", flag);
        std::process::exit(1);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}: {}", flag, raw);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
EmberKV - An Event-Driven In-Memory Key-Value Server

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>             Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>             Port to listen on (default: 11211)
        --min-workers <N>         Worker threads kept when idle (default: 4)
        --max-workers <N>         Maximum worker threads (default: 16)
        --queue-size <N>          Pending callbacks before back-pressure (default: 1024)
        --idle-timeout-ms <MS>    Idle time before a surplus worker retires (default: 2000)
        --read-buffer <BYTES>     Per-connection read buffer (default: 4096)
    -v, --version                 Print version information
        --help                    Print this help message

EXAMPLES:
    emberkv                                  # Start on 127.0.0.1:11211
    emberkv --port 11311                     # Start on port 11311
    emberkv --min-workers 2 --max-workers 8  # Smaller worker pool

CONNECTING:
    Any line-based TCP client works:
    $ nc 127.0.0.1 11211
    set name 0 0 4
    Ariz
    STORED
    get name
    VALUE name 0 4
    Ariz
    END
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    // Create the storage engine (shared across all connections)
    let storage = Arc::new(StorageEngine::new());
    info!("Storage engine initialized with 64 shards");

    let server = Server::bind(config.server_config()?, storage)
        .with_context(|| format!("failed to start server on {}", config.bind_address()))?;
    info!(
        "EmberKV v{} listening on {}",
        emberkv::VERSION,
        server.local_addr()?
    );

    let shutdown = server.shutdown_handle();

    // The reactor blocks its thread, so it gets one of its own
    let mut reactor = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        result = &mut reactor => {
            result??;
            return Ok(());
        }
        signal = signal::ctrl_c() => {
            signal.context("failed to install Ctrl+C handler")?;
            info!("Shutdown signal received, stopping server...");
        }
    }

    shutdown.shutdown()?;
    if let Err(e) = reactor.await? {
        error!(error = %e, "Server stopped with an error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
