//! Thread-Safe Storage Engine with Expiry Support
//!
//! This module implements the in-memory backend commands execute against.
//! It is a concurrent HashMap with TTL support, shared by every connection.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Instead of one big lock, we use multiple shards to reduce contention.
//! 2. **Lazy Expiry**: Keys are checked for expiry on access, plus a periodic sweep.
//! 3. **RwLock**: Allows multiple concurrent readers with exclusive writers.
//! 4. **Size Cap**: Values above `max_value_size` are refused instead of stored.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are distributed across shards using a hash function.
//! This allows multiple threads to read/write different keys concurrently.

use crate::storage::{Storage, StorageError};
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Number of shards for the storage engine.
/// More shards = less lock contention, but more memory overhead.
const NUM_SHARDS: usize = 64;

/// Default upper bound for a single value (1 MiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Represents a stored value with its client flags and optional expiry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// Opaque flags supplied by the client and returned on retrieval
    pub flags: u32,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
}

impl Entry {
    /// Creates a new entry without flags or expiry.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            flags: 0,
            expires_at: None,
        }
    }

    /// Sets the client flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Makes the entry expire `ttl` from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Instant::now().checked_add(ttl);
        self
    }

    /// Makes the entry expire at the given instant.
    pub fn expiring_at(mut self, at: Instant) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }
}

/// A single shard containing a portion of the key-value pairs.
#[derive(Debug, Default)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

impl Shard {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Bytes, Entry>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Bytes, Entry>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The in-memory storage engine.
///
/// # Thread Safety
///
/// This struct is designed to be wrapped in an `Arc` and shared across
/// all connections. All operations are thread-safe.
///
/// # Example
///
/// ```
/// use emberkv::storage::{Entry, Storage, StorageEngine};
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Entry::new("Ariz")).unwrap();
/// let entry = engine.get(b"name").unwrap();
/// assert_eq!(entry.value, Bytes::from("Ariz"));
/// ```
pub struct StorageEngine {
    /// Sharded storage for reduced lock contention
    shards: Vec<Shard>,

    /// Largest value accepted
    max_value_size: usize,

    /// Statistics: total number of keys (approximate)
    key_count: AtomicU64,

    /// Statistics: total GET operations
    get_count: AtomicU64,

    /// Statistics: total store operations
    set_count: AtomicU64,

    /// Statistics: total DELETE operations
    del_count: AtomicU64,

    /// Statistics: number of expired keys cleaned up
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("max_value_size", &self.max_value_size)
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates a new storage engine with default settings.
    pub fn new() -> Self {
        Self::with_max_value_size(DEFAULT_MAX_VALUE_SIZE)
    }

    /// Creates a storage engine that refuses values larger than `max_value_size`.
    pub fn with_max_value_size(max_value_size: usize) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            max_value_size,
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    /// Determines which shard a key belongs to.
    #[inline]
    fn get_shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    fn check_size(&self, size: usize) -> Result<(), StorageError> {
        if size > self.max_value_size {
            return Err(StorageError::ValueTooLarge {
                size,
                max: self.max_value_size,
            });
        }
        Ok(())
    }

    /// Inserts or overwrites `key` according to `insert_if`, which is given
    /// whether a live entry already exists.
    fn store(
        &self,
        key: Bytes,
        entry: Entry,
        insert_if: impl FnOnce(bool) -> bool,
    ) -> Result<bool, StorageError> {
        self.check_size(entry.value.len())?;
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(&key);
        let mut data = shard.write();

        let live = match data.get(&key) {
            Some(existing) if existing.is_expired() => {
                data.remove(&key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(_) => true,
            None => false,
        };

        if !insert_if(live) {
            return Ok(false);
        }

        if data.insert(key, entry).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    /// Concatenates `piece` onto a live value, before or after it.
    fn concat(&self, key: &[u8], piece: &[u8], at_front: bool) -> Result<bool, StorageError> {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);
        let mut data = shard.write();

        let entry = match data.get_mut(key) {
            Some(entry) if !entry.is_expired() => entry,
            _ => return Ok(false),
        };

        let new_len = entry.value.len() + piece.len();
        self.check_size(new_len)?;

        let mut value = Vec::with_capacity(new_len);
        if at_front {
            value.extend_from_slice(piece);
            value.extend_from_slice(&entry.value);
        } else {
            value.extend_from_slice(&entry.value);
            value.extend_from_slice(piece);
        }
        entry.value = Bytes::from(value);
        Ok(true)
    }

    /// Largest value this engine accepts.
    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    /// Returns the approximate number of keys in the database.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Returns true if the database is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns database statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired keys from all shards.
    ///
    /// Returns the number of keys that were cleaned up.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.write();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired());
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }
}

impl Storage for StorageEngine {
    fn set(&self, key: Bytes, entry: Entry) -> Result<(), StorageError> {
        self.store(key, entry, |_| true).map(|_| ())
    }

    fn add(&self, key: Bytes, entry: Entry) -> Result<bool, StorageError> {
        self.store(key, entry, |live| !live)
    }

    fn replace(&self, key: Bytes, entry: Entry) -> Result<bool, StorageError> {
        self.store(key, entry, |live| live)
    }

    fn append(&self, key: &[u8], suffix: &[u8]) -> Result<bool, StorageError> {
        self.concat(key, suffix, false)
    }

    fn prepend(&self, key: &[u8], prefix: &[u8]) -> Result<bool, StorageError> {
        self.concat(key, prefix, true)
    }

    /// Returns `None` if the key doesn't exist or has expired.
    /// Expired keys are removed on access.
    fn get(&self, key: &[u8]) -> Option<Entry> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);

        // Fast path under the read lock
        {
            let data = shard.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut data = shard.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            // Race: another thread may have updated the key
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);
        let mut data = shard.write();

        match data.remove(key) {
            Some(entry) => {
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                !entry.is_expired()
            }
            None => false,
        }
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total store operations
    pub set_ops: u64,
    /// Total DELETE operations
    pub del_ops: u64,
    /// Total expired keys cleaned up
    pub expired: u64,
}
