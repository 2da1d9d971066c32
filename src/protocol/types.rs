//! Text Protocol Replies
//!
//! This module defines the replies a command can produce and their wire form.
//!
//! ## Protocol Format
//!
//! Every reply is one or more CRLF-terminated lines. A reply is serialized
//! *without* its final terminator: the connection appends it when the reply
//! is queued for sending.
//!
//! ## Examples
//!
//! Store: `STORED`
//! Miss: `NOT_FOUND`
//! Retrieval: `VALUE name 0 4\r\nAriz\r\nEND`
//! Empty retrieval: `END`

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used by the text protocol
pub const CRLF: &[u8] = b"\r\n";

/// One item of a retrieval reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub key: Bytes,
    pub flags: u32,
    pub data: Bytes,
}

/// A command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The item was stored
    Stored,

    /// A store precondition did not hold (`add` on an existing key, etc.)
    NotStored,

    /// The item was removed
    Deleted,

    /// The item to remove did not exist
    NotFound,

    /// Retrieved items, possibly none. Format:
    /// `VALUE <key> <flags> <bytes>\r\n<data>\r\n` per item, then `END`
    Values(Vec<Value>),

    /// Server version
    Version(String),
}

impl Reply {
    /// Serializes the reply, leaving off the final CRLF.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            Reply::Stored => buf.put_slice(b"STORED"),
            Reply::NotStored => buf.put_slice(b"NOT_STORED"),
            Reply::Deleted => buf.put_slice(b"DELETED"),
            Reply::NotFound => buf.put_slice(b"NOT_FOUND"),
            Reply::Values(values) => {
                for value in values {
                    buf.put_slice(b"VALUE ");
                    buf.put_slice(&value.key);
                    buf.put_slice(format!(" {} {}", value.flags, value.data.len()).as_bytes());
                    buf.put_slice(CRLF);
                    buf.put_slice(&value.data);
                    buf.put_slice(CRLF);
                }
                buf.put_slice(b"END");
            }
            Reply::Version(version) => {
                buf.put_slice(b"VERSION ");
                buf.put_slice(version.as_bytes());
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Values(values) => write!(f, "({} values)", values.len()),
            other => write!(f, "{}", String::from_utf8_lossy(&other.serialize())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_replies() {
        assert_eq!(Reply::Stored.serialize(), Bytes::from("STORED"));
        assert_eq!(Reply::NotStored.serialize(), Bytes::from("NOT_STORED"));
        assert_eq!(Reply::Deleted.serialize(), Bytes::from("DELETED"));
        assert_eq!(Reply::NotFound.serialize(), Bytes::from("NOT_FOUND"));
    }

    #[test]
    fn test_values_serialize() {
        let reply = Reply::Values(vec![
            Value {
                key: Bytes::from("a"),
                flags: 0,
                data: Bytes::from("one"),
            },
            Value {
                key: Bytes::from("b"),
                flags: 42,
                data: Bytes::from(""),
            },
        ]);
        assert_eq!(
            reply.serialize(),
            Bytes::from("VALUE a 0 3\r\none\r\nVALUE b 42 0\r\n\r\nEND")
        );
    }

    #[test]
    fn test_empty_values_serialize() {
        assert_eq!(Reply::Values(vec![]).serialize(), Bytes::from("END"));
    }

    #[test]
    fn test_version_serialize() {
        let reply = Reply::Version("0.1.0".to_string());
        assert_eq!(reply.serialize(), Bytes::from("VERSION 0.1.0"));
        assert_eq!(reply.to_string(), "VERSION 0.1.0");
    }
}
