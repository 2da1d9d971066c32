//! Storage Module
//!
//! The key-value backend commands execute against. Connections never talk
//! to storage directly: a parsed command receives `&dyn Storage` and does
//! its work through this trait, so any thread-safe backend can be plugged in.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ cleanup_expired()
//!              ┌─────────────┴─────────────┐
//!              │  periodic sweep task      │
//!              │  (submitted to Executor)  │
//!              └───────────────────────────┘
//! ```

pub mod engine;

use bytes::Bytes;
use thiserror::Error;

// Re-export commonly used types
pub use engine::{Entry, StorageEngine, StorageStats, DEFAULT_MAX_VALUE_SIZE};

/// Errors a storage backend can report for an operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },
}

/// A thread-safe key-value backend.
///
/// The `bool` results report whether the operation's precondition held
/// (`add` on a missing key, `replace`/`append`/`prepend` on a present one).
pub trait Storage: Send + Sync {
    /// Stores the entry unconditionally.
    fn set(&self, key: Bytes, entry: Entry) -> Result<(), StorageError>;

    /// Stores the entry only if the key is absent.
    fn add(&self, key: Bytes, entry: Entry) -> Result<bool, StorageError>;

    /// Stores the entry only if the key is present.
    fn replace(&self, key: Bytes, entry: Entry) -> Result<bool, StorageError>;

    /// Appends bytes to an existing value.
    fn append(&self, key: &[u8], suffix: &[u8]) -> Result<bool, StorageError>;

    /// Prepends bytes to an existing value.
    fn prepend(&self, key: &[u8], prefix: &[u8]) -> Result<bool, StorageError>;

    /// Looks a key up.
    fn get(&self, key: &[u8]) -> Option<Entry>;

    /// Removes a key, returning whether a live entry was removed.
    fn delete(&self, key: &[u8]) -> bool;
}
