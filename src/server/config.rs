//! Server configuration.

use crate::concurrency::ExecutorConfig;
use crate::connection::{DEFAULT_MAX_PENDING_OUTPUT, DEFAULT_READ_BUFFER_SIZE};
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for a [`Server`](crate::server::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: SocketAddr,
    /// Worker pool that runs connection callbacks
    pub executor: ExecutorConfig,
    /// Read buffer capacity of each connection
    pub read_buffer_size: usize,
    /// Unsent reply bytes at which a connection stops reading
    pub max_pending_output: usize,
    /// How often expired keys are swept out of storage
    pub expiry_interval: Duration,
    /// Readiness events fetched per poll
    pub max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let ip = DEFAULT_HOST
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        Self {
            addr: SocketAddr::new(ip, DEFAULT_PORT),
            executor: ExecutorConfig::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_pending_output: DEFAULT_MAX_PENDING_OUTPUT,
            expiry_interval: Duration::from_secs(1),
            max_events: 1024,
        }
    }
}

impl ServerConfig {
    /// Creates the default configuration for `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_pending_output(mut self, limit: usize) -> Self {
        self.max_pending_output = limit;
        self
    }

    pub fn with_expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }
}
