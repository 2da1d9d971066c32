//! Commands
//!
//! A [`Command`] is what a parser builds from a complete request line. It
//! runs against a [`Storage`] backend together with the argument bytes the
//! connection accumulated for it, and produces the reply bytes.
//!
//! [`TextCommand`] is the command set of the built-in text protocol:
//!
//! - `set|add|replace|append|prepend <key> <flags> <exptime> <bytes>` + data block
//! - `get <key> [<key> ...]`
//! - `delete <key>`
//! - `version`

use crate::protocol::types::{Reply, Value};
use crate::storage::{Entry, Storage, StorageError};
use bytes::Bytes;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Expiration times above this many seconds are absolute Unix timestamps.
const MAX_RELATIVE_EXPTIME: i64 = 60 * 60 * 24 * 30;

/// Errors raised while executing a command. These become error replies,
/// never connection failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("argument length mismatch: expected {expected} bytes, got {actual}")]
    ArgumentLength { expected: usize, actual: usize },
}

/// A built request, ready to run.
pub trait Command: Send {
    /// Executes the command. `argument` holds exactly the argument bytes the
    /// parser announced, without the framing terminator.
    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> Result<Bytes, CommandError>;
}

/// How a storage command treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    pub fn name(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }
}

/// A command of the text protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextCommand {
    Store {
        mode: StoreMode,
        key: Bytes,
        flags: u32,
        exptime: i64,
        bytes: usize,
    },
    Get {
        keys: Vec<Bytes>,
    },
    Delete {
        key: Bytes,
    },
    Version,
}

impl TextCommand {
    /// Number of argument bytes that follow the request line.
    pub fn argument_len(&self) -> usize {
        match self {
            TextCommand::Store { bytes, .. } => *bytes,
            _ => 0,
        }
    }

    fn run(&self, storage: &dyn Storage, argument: &[u8]) -> Result<Reply, CommandError> {
        let expected = self.argument_len();
        if argument.len() != expected {
            return Err(CommandError::ArgumentLength {
                expected,
                actual: argument.len(),
            });
        }

        let reply = match self {
            TextCommand::Store {
                mode,
                key,
                flags,
                exptime,
                ..
            } => {
                let stored = match mode {
                    StoreMode::Append => storage.append(key, argument)?,
                    StoreMode::Prepend => storage.prepend(key, argument)?,
                    StoreMode::Set | StoreMode::Add | StoreMode::Replace => {
                        let mut entry =
                            Entry::new(Bytes::copy_from_slice(argument)).with_flags(*flags);
                        entry.expires_at = expiry_instant(*exptime);

                        match mode {
                            StoreMode::Add => storage.add(key.clone(), entry)?,
                            StoreMode::Replace => storage.replace(key.clone(), entry)?,
                            _ => {
                                storage.set(key.clone(), entry)?;
                                true
                            }
                        }
                    }
                };

                if stored {
                    Reply::Stored
                } else {
                    Reply::NotStored
                }
            }
            TextCommand::Get { keys } => Reply::Values(
                keys.iter()
                    .filter_map(|key| {
                        storage.get(key).map(|entry| Value {
                            key: key.clone(),
                            flags: entry.flags,
                            data: entry.value,
                        })
                    })
                    .collect(),
            ),
            TextCommand::Delete { key } => {
                if storage.delete(key) {
                    Reply::Deleted
                } else {
                    Reply::NotFound
                }
            }
            TextCommand::Version => Reply::Version(crate::VERSION.to_string()),
        };

        Ok(reply)
    }
}

impl Command for TextCommand {
    fn execute(&self, storage: &dyn Storage, argument: &[u8]) -> Result<Bytes, CommandError> {
        self.run(storage, argument).map(|reply| reply.serialize())
    }
}

/// Converts a protocol expiration time into an instant.
///
/// `0` never expires, negative values are already expired, values up to
/// thirty days are relative seconds and anything larger is a Unix timestamp.
fn expiry_instant(exptime: i64) -> Option<Instant> {
    let now = Instant::now();

    if exptime == 0 {
        return None;
    }
    if exptime < 0 {
        return Some(now);
    }

    let seconds = if exptime <= MAX_RELATIVE_EXPTIME {
        exptime as u64
    } else {
        let unix_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        (exptime as u64).saturating_sub(unix_now)
    };

    Some(now.checked_add(Duration::from_secs(seconds)).unwrap_or(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;

    fn store(mode: StoreMode, key: &str, bytes: usize) -> TextCommand {
        TextCommand::Store {
            mode,
            key: Bytes::from(key.to_string()),
            flags: 3,
            exptime: 0,
            bytes,
        }
    }

    fn get(keys: &[&str]) -> TextCommand {
        TextCommand::Get {
            keys: keys.iter().map(|k| Bytes::from(k.to_string())).collect(),
        }
    }

    #[test]
    fn test_set_then_get() {
        let storage = StorageEngine::new();

        let reply = store(StoreMode::Set, "name", 4)
            .execute(&storage, b"Ariz")
            .unwrap();
        assert_eq!(reply, Bytes::from("STORED"));

        let reply = get(&["name", "missing"]).execute(&storage, b"").unwrap();
        assert_eq!(reply, Bytes::from("VALUE name 3 4\r\nAriz\r\nEND"));
    }

    #[test]
    fn test_add_and_replace_preconditions() {
        let storage = StorageEngine::new();

        let replace = store(StoreMode::Replace, "k", 1);
        assert_eq!(replace.execute(&storage, b"x").unwrap(), Bytes::from("NOT_STORED"));

        let add = store(StoreMode::Add, "k", 1);
        assert_eq!(add.execute(&storage, b"x").unwrap(), Bytes::from("STORED"));
        assert_eq!(add.execute(&storage, b"y").unwrap(), Bytes::from("NOT_STORED"));
        assert_eq!(replace.execute(&storage, b"z").unwrap(), Bytes::from("STORED"));
    }

    #[test]
    fn test_append_prepend() {
        let storage = StorageEngine::new();

        store(StoreMode::Set, "k", 1).execute(&storage, b"b").unwrap();
        store(StoreMode::Append, "k", 1).execute(&storage, b"c").unwrap();
        store(StoreMode::Prepend, "k", 1).execute(&storage, b"a").unwrap();

        let reply = get(&["k"]).execute(&storage, b"").unwrap();
        assert_eq!(reply, Bytes::from("VALUE k 3 3\r\nabc\r\nEND"));
    }

    #[test]
    fn test_delete() {
        let storage = StorageEngine::new();
        let delete = TextCommand::Delete {
            key: Bytes::from("k"),
        };

        assert_eq!(delete.execute(&storage, b"").unwrap(), Bytes::from("NOT_FOUND"));
        store(StoreMode::Set, "k", 1).execute(&storage, b"v").unwrap();
        assert_eq!(delete.execute(&storage, b"").unwrap(), Bytes::from("DELETED"));
    }

    #[test]
    fn test_storage_error_is_reported() {
        let storage = StorageEngine::with_max_value_size(2);

        let err = store(StoreMode::Set, "k", 3)
            .execute(&storage, b"abc")
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::Storage(StorageError::ValueTooLarge { size: 3, max: 2 })
        );
        assert_eq!(err.to_string(), "value too large: 3 bytes (max: 2)");
    }

    #[test]
    fn test_argument_length_mismatch() {
        let storage = StorageEngine::new();
        let err = store(StoreMode::Set, "k", 3)
            .execute(&storage, b"ab")
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::ArgumentLength {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_negative_exptime_expires_immediately() {
        let storage = StorageEngine::new();
        let command = TextCommand::Store {
            mode: StoreMode::Set,
            key: Bytes::from("k"),
            flags: 0,
            exptime: -1,
            bytes: 1,
        };

        assert_eq!(command.execute(&storage, b"v").unwrap(), Bytes::from("STORED"));
        assert_eq!(get(&["k"]).execute(&storage, b"").unwrap(), Bytes::from("END"));
    }

    #[test]
    fn test_expiry_instant() {
        assert_eq!(expiry_instant(0), None);

        let relative = expiry_instant(60).unwrap();
        assert!(relative > Instant::now() + Duration::from_secs(50));

        // An absolute timestamp in the past is already expired.
        let past = expiry_instant(MAX_RELATIVE_EXPTIME + 1).unwrap();
        assert!(past <= Instant::now());
    }

    #[test]
    fn test_version() {
        let storage = StorageEngine::new();
        let reply = TextCommand::Version.execute(&storage, b"").unwrap();
        assert_eq!(reply, Bytes::from(format!("VERSION {}", crate::VERSION)));
    }
}
