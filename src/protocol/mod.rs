//! Text Protocol Implementation
//!
//! This module turns request bytes into runnable commands and commands into
//! reply bytes.
//!
//! ## Modules
//!
//! - `parser`: The [`Parser`] contract and the incremental [`TextParser`]
//! - `command`: The [`Command`] contract and the [`TextCommand`] set
//! - `types`: The [`Reply`] enum and serialization
//!
//! ## Example
//!
//! ```ignore
//! use emberkv::protocol::{Command, Parser, TextParser};
//! use emberkv::storage::StorageEngine;
//!
//! let storage = StorageEngine::new();
//! let mut parser = TextParser::new();
//!
//! let parsed = parser.parse(b"set name 0 0 4\r\n").unwrap();
//! assert!(parsed.complete);
//!
//! let (command, argument_len) = parser.build().unwrap();
//! assert_eq!(argument_len, 4);
//!
//! let reply = command.execute(&storage, b"Ariz").unwrap();
//! assert_eq!(&reply[..], b"STORED");
//! ```

pub mod command;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use command::{Command, CommandError, StoreMode, TextCommand};
pub use parser::{
    ParseError, Parsed, Parser, TextParser, DEFAULT_MAX_ARGUMENT_LENGTH, MAX_LINE_LENGTH,
};
pub use types::{Reply, Value, CRLF};
