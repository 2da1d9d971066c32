//! # EmberKV - An Event-Driven In-Memory Key-Value Server
//!
//! EmberKV is an in-memory key-value server written in Rust. It speaks a
//! small line-based text protocol and is built around two pieces of
//! concurrency machinery: an elastic worker-thread pool and a non-blocking
//! per-connection state machine driven by readiness events.
//!
//! ## Features
//!
//! - **Elastic Executor**: threads grow under load up to a high watermark and
//!   retire when idle, with a bounded queue that fails fast when full
//! - **Non-blocking Connections**: incremental parsing, pipelining and
//!   scatter-gather writes over `mio`
//! - **Sharded Storage**: 64 independently locked shards with lazy and
//!   periodic expiry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              EmberKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Reactor    │───>│  Executor   │───>│ Connection  │                  │
//! │  │ (mio Poll)  │    │ (threads)   │    │ state mach. │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │ Parser -> Command       │
//! │                                               ▼                         │
//! │                     ┌──────────────────────────────────────────────┐   │
//! │                     │              StorageEngine                   │   │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │                     │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │   │
//! │                     │  │RwLock  │ │RwLock  │ │RwLock  │ │shards  │ │   │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use emberkv::server::{Server, ServerConfig};
//! use emberkv::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(StorageEngine::new());
//! let server = Server::bind(ServerConfig::default(), storage).unwrap();
//! server.run().unwrap();
//! ```
//!
//! ## Supported Commands
//!
//! - `set|add|replace|append|prepend <key> <flags> <exptime> <bytes>` followed
//!   by a `<bytes>`-long data block and `\r\n`
//! - `get <key> [<key> ...]`
//! - `delete <key>`
//! - `version`
//!
//! ## Module Overview
//!
//! - [`concurrency`]: The elastic worker pool
//! - [`connection`]: Per-socket state machine and its buffers
//! - [`protocol`]: Text protocol parser, commands and replies
//! - [`server`]: The `mio` reactor tying everything together
//! - [`storage`]: Thread-safe storage engine with TTL support

pub mod concurrency;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use concurrency::{ExecuteError, Executor, ExecutorConfig};
pub use connection::{Connection, ConnectionError, InterestMask};
pub use protocol::{Command, ParseError, Parser, TextParser};
pub use server::{Server, ServerConfig, ShutdownHandle};
pub use storage::{Storage, StorageEngine};

/// The default port EmberKV listens on
pub const DEFAULT_PORT: u16 = 11211;

/// The default host EmberKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
