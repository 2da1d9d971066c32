//! Server Module
//!
//! Ties the pieces together: a `mio` reactor thread accepts clients and
//! watches their sockets, the [`Executor`](crate::concurrency::Executor)
//! runs connection callbacks, and a periodic task sweeps expired keys out of
//! the shared [`StorageEngine`](crate::storage::StorageEngine).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────────────────┐
//! │  Reactor thread      │ tasks  │  Executor                        │
//! │  mio::Poll           │───────>│  worker ─ conn.do_read()         │
//! │  accept / dispatch   │        │  worker ─ conn.do_write()        │
//! │  expiry timer        │        │  worker ─ storage.cleanup_expired│
//! └──────────┬───────────┘        └──────────────────────────────────┘
//!            │ reregister / deregister
//!            ▼
//!   HashMap<Token, Arc<Connection>>
//! ```

pub mod config;
pub mod reactor;

pub use config::ServerConfig;
pub use reactor::{Server, ServerError, ServerStats, ShutdownHandle};
