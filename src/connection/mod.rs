//! Connection Module
//!
//! This module holds the per-socket state machine of EmberKV. The reactor
//! owns the sockets' registrations; each [`Connection`] owns the socket
//! itself together with its buffers, and turns readiness callbacks into
//! executed requests and queued replies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Reactor (server)                        │
//! │        poll() ──> readiness event ──> Executor task         │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ do_read / do_write / on_error / on_close
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Connection                              │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ ReadBuffer  │───>│   Parser    │───>│  Command    │     │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      ┌───────────────┐      │
//! │                                      │ OutboundQueue │      │
//! │                                      └───────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Incremental parsing**: requests may arrive split at any byte
//! - **Pipelining**: any number of requests per read, answered in order
//! - **Scatter-gather writes**: queued replies leave in one vectored write
//! - **Statistics**: per-connection byte and command counters

pub mod buffer;
pub mod handler;
pub mod interest;
pub mod outbound;

// Re-export commonly used types
pub use buffer::{ReadBuffer, DEFAULT_READ_BUFFER_SIZE};
pub use handler::{Connection, ConnectionError, ConnectionStats};
pub use interest::InterestMask;
pub use outbound::{OutboundQueue, DEFAULT_MAX_PENDING_OUTPUT, MAX_IOVECS};
