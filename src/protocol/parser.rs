//! Incremental Request Parser
//!
//! This module defines the [`Parser`] contract a connection drives and the
//! line-oriented [`TextParser`] that implements it.
//!
//! ## How the Parser Works
//!
//! The connection hands the parser whatever unconsumed bytes it holds. The
//! parser reports how many of them it took and whether a request line is now
//! complete:
//!
//! - `Parsed { consumed: n, complete: false }` - progress, need more data
//! - `Parsed { consumed: 0, .. }` - no progress possible, need more data
//! - `Parsed { complete: true, .. }` - call `build()` to get the command
//! - `Err(e)` - the stream cannot be parsed any further; the connection dies
//!
//! `build()` turns the completed line into a command plus the number of
//! argument bytes that follow it. A malformed line is a `build()` error,
//! which the connection answers with an error reply before moving on.
//!
//! The text parser keeps partial lines in its own state, so a request split
//! across any number of reads parses the same as one delivered whole.

use crate::protocol::command::{StoreMode, TextCommand};
use crate::storage::DEFAULT_MAX_VALUE_SIZE;
use bytes::Bytes;
use thiserror::Error;

/// Longest accepted request line, terminator included.
pub const MAX_LINE_LENGTH: usize = 2048;

/// Longest accepted key.
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest data block a storage command may announce unless configured
/// otherwise. Matches the storage engine's default value cap.
pub const DEFAULT_MAX_ARGUMENT_LENGTH: usize = DEFAULT_MAX_VALUE_SIZE;

/// Errors that can occur while parsing requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request line exceeds the maximum length
    #[error("line too long: more than {max} bytes")]
    LineTooLong { max: usize },

    /// A storage command announced an unreasonably large data block
    #[error("argument too large: {size} bytes (max: {max})")]
    ArgumentTooLarge { size: usize, max: usize },

    /// The verb is not a known command
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The line does not match the command's grammar
    #[error("bad command line format: {0}")]
    BadFormat(String),

    /// `build()` was called before a line was complete
    #[error("no complete command line")]
    Incomplete,
}

/// Progress report of a single [`Parser::parse`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parsed {
    /// Bytes taken from the front of the input
    pub consumed: usize,
    /// Whether a full request line has been recognized
    pub complete: bool,
}

/// An incremental request parser owned by one connection.
pub trait Parser: Send {
    type Command: crate::protocol::Command;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Consumes bytes from the front of `input`. Errors are fatal for the
    /// stream.
    fn parse(&mut self, input: &[u8]) -> Result<Parsed, Self::Error>;

    /// Builds the recognized command and reports how many argument bytes
    /// follow it on the wire (0 if none).
    fn build(&mut self) -> Result<(Self::Command, usize), Self::Error>;

    /// The verb of the current command, for diagnostics.
    fn name(&self) -> &str;

    /// Clears all progress so the next command can be parsed.
    fn reset(&mut self);

    /// The reply sent for a request line that could not be built.
    fn error_reply(&self, error: &Self::Error) -> Bytes {
        Bytes::from(format!("CLIENT_ERROR {}", error))
    }
}

/// Parser for the line-based text protocol.
#[derive(Debug)]
pub struct TextParser {
    /// Bytes of the current line collected so far
    line: Vec<u8>,
    /// Result of tokenizing a completed line
    ready: Option<Result<TextCommand, ParseError>>,
    /// Verb of the completed line
    verb: String,
    /// Largest data block a storage command may announce
    max_argument_length: usize,
}

impl Default for TextParser {
    fn default() -> Self {
        Self::with_max_argument_length(DEFAULT_MAX_ARGUMENT_LENGTH)
    }
}

impl TextParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a parser that treats any announced data block above
    /// `max_argument_length` bytes as a fatal error. Servers pass the
    /// storage value cap here so nothing larger is ever buffered.
    pub fn with_max_argument_length(max_argument_length: usize) -> Self {
        Self {
            line: Vec::new(),
            ready: None,
            verb: String::new(),
            max_argument_length,
        }
    }

    pub fn max_argument_length(&self) -> usize {
        self.max_argument_length
    }

    fn take_line(&mut self) -> Result<TextCommand, ParseError> {
        let line = trim_terminator(&self.line);
        let mut tokens = line
            .split(|&b| b == b' ')
            .filter(|token| !token.is_empty());

        let verb = tokens
            .next()
            .ok_or_else(|| ParseError::BadFormat("empty command line".to_string()))?;
        self.verb = String::from_utf8_lossy(verb).to_ascii_lowercase();

        let args: Vec<&[u8]> = tokens.collect();

        match self.verb.as_str() {
            "set" => parse_store(StoreMode::Set, &args),
            "add" => parse_store(StoreMode::Add, &args),
            "replace" => parse_store(StoreMode::Replace, &args),
            "append" => parse_store(StoreMode::Append, &args),
            "prepend" => parse_store(StoreMode::Prepend, &args),
            "get" | "gets" => {
                if args.is_empty() {
                    return Err(ParseError::BadFormat("get requires a key".to_string()));
                }
                let keys = args
                    .iter()
                    .map(|key| parse_key(key))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TextCommand::Get { keys })
            }
            "delete" => match args.as_slice() {
                [key] => Ok(TextCommand::Delete {
                    key: parse_key(key)?,
                }),
                _ => Err(ParseError::BadFormat("usage: delete <key>".to_string())),
            },
            "version" => Ok(TextCommand::Version),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

impl Parser for TextParser {
    type Command = TextCommand;
    type Error = ParseError;

    fn parse(&mut self, input: &[u8]) -> Result<Parsed, ParseError> {
        if self.ready.is_some() {
            return Ok(Parsed {
                consumed: 0,
                complete: true,
            });
        }

        let (take, complete) = match input.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (input.len(), false),
        };

        if self.line.len() + take > MAX_LINE_LENGTH {
            return Err(ParseError::LineTooLong {
                max: MAX_LINE_LENGTH,
            });
        }
        self.line.extend_from_slice(&input[..take]);

        if !complete {
            return Ok(Parsed {
                consumed: take,
                complete: false,
            });
        }

        // Blank lines carry no request, e.g. the terminator after an empty data block.
        if trim_terminator(&self.line).is_empty() {
            self.line.clear();
            return Ok(Parsed {
                consumed: take,
                complete: false,
            });
        }

        let command = self.take_line();
        if let Ok(TextCommand::Store { bytes, .. }) = &command {
            if *bytes > self.max_argument_length {
                return Err(ParseError::ArgumentTooLarge {
                    size: *bytes,
                    max: self.max_argument_length,
                });
            }
        }
        self.ready = Some(command);

        Ok(Parsed {
            consumed: take,
            complete: true,
        })
    }

    fn build(&mut self) -> Result<(TextCommand, usize), ParseError> {
        let command = self.ready.take().ok_or(ParseError::Incomplete)??;
        let argument_len = command.argument_len();
        Ok((command, argument_len))
    }

    fn name(&self) -> &str {
        &self.verb
    }

    fn reset(&mut self) {
        self.line.clear();
        self.ready = None;
        self.verb.clear();
    }

    fn error_reply(&self, error: &ParseError) -> Bytes {
        match error {
            ParseError::UnknownCommand(_) => Bytes::from_static(b"ERROR"),
            other => Bytes::from(format!("CLIENT_ERROR {}", other)),
        }
    }
}

fn trim_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_key(token: &[u8]) -> Result<Bytes, ParseError> {
    if token.len() > MAX_KEY_LENGTH {
        return Err(ParseError::BadFormat(format!(
            "key longer than {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if token.iter().any(|b| b.is_ascii_control()) {
        return Err(ParseError::BadFormat(
            "key contains control characters".to_string(),
        ));
    }
    Ok(Bytes::copy_from_slice(token))
}

fn parse_number<T: std::str::FromStr>(token: &[u8], what: &str) -> Result<T, ParseError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::BadFormat(format!("invalid {}", what)))
}

/// `<key> <flags> <exptime> <bytes>`
fn parse_store(mode: StoreMode, args: &[&[u8]]) -> Result<TextCommand, ParseError> {
    match args {
        [key, flags, exptime, bytes] => Ok(TextCommand::Store {
            mode,
            key: parse_key(key)?,
            flags: parse_number(flags, "flags")?,
            exptime: parse_number(exptime, "exptime")?,
            bytes: parse_number(bytes, "data length")?,
        }),
        _ => Err(ParseError::BadFormat(format!(
            "usage: {} <key> <flags> <exptime> <bytes>",
            mode.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut TextParser, input: &[u8]) -> Parsed {
        parser.parse(input).unwrap()
    }

    #[test]
    fn test_parse_get() {
        let mut parser = TextParser::new();
        let parsed = parse_all(&mut parser, b"get a b\r\n");
        assert_eq!(
            parsed,
            Parsed {
                consumed: 9,
                complete: true
            }
        );
        assert_eq!(parser.name(), "get");

        let (command, argument_len) = parser.build().unwrap();
        assert_eq!(
            command,
            TextCommand::Get {
                keys: vec![Bytes::from("a"), Bytes::from("b")]
            }
        );
        assert_eq!(argument_len, 0);
    }

    #[test]
    fn test_parse_set_reports_argument_length() {
        let mut parser = TextParser::new();
        let input = b"set name 5 0 4\r\nAriz\r\n";

        let parsed = parse_all(&mut parser, input);
        assert_eq!(parsed.consumed, 16);
        assert!(parsed.complete);

        let (command, argument_len) = parser.build().unwrap();
        assert_eq!(argument_len, 4);
        assert_eq!(
            command,
            TextCommand::Store {
                mode: StoreMode::Set,
                key: Bytes::from("name"),
                flags: 5,
                exptime: 0,
                bytes: 4,
            }
        );
    }

    #[test]
    fn test_partial_line_is_consumed_into_state() {
        let mut parser = TextParser::new();

        let first = parse_all(&mut parser, b"dele");
        assert_eq!(
            first,
            Parsed {
                consumed: 4,
                complete: false
            }
        );

        let second = parse_all(&mut parser, b"te key\r\nget");
        assert_eq!(
            second,
            Parsed {
                consumed: 8,
                complete: true
            }
        );

        let (command, _) = parser.build().unwrap();
        assert_eq!(
            command,
            TextCommand::Delete {
                key: Bytes::from("key")
            }
        );
    }

    #[test]
    fn test_empty_input_consumes_nothing() {
        let mut parser = TextParser::new();
        assert_eq!(
            parse_all(&mut parser, b""),
            Parsed {
                consumed: 0,
                complete: false
            }
        );
    }

    #[test]
    fn test_complete_line_waits_for_build() {
        let mut parser = TextParser::new();
        parse_all(&mut parser, b"version\r\n");

        // Nothing more is consumed until the command is built.
        let again = parse_all(&mut parser, b"get a\r\n");
        assert_eq!(
            again,
            Parsed {
                consumed: 0,
                complete: true
            }
        );
    }

    #[test]
    fn test_blank_line_is_skipped() {
        let mut parser = TextParser::new();
        assert_eq!(
            parse_all(&mut parser, b"\r\n"),
            Parsed {
                consumed: 2,
                complete: false
            }
        );
        assert_eq!(parse_all(&mut parser, b"version\n").consumed, 8);
        assert_eq!(parser.build().unwrap().0, TextCommand::Version);
    }

    #[test]
    fn test_unknown_command() {
        let mut parser = TextParser::new();
        parse_all(&mut parser, b"FLY away\r\n");
        assert_eq!(parser.name(), "fly");
        assert_eq!(
            parser.build().unwrap_err(),
            ParseError::UnknownCommand("fly".to_string())
        );
    }

    #[test]
    fn test_bad_store_format() {
        let mut parser = TextParser::new();
        parse_all(&mut parser, b"set k notanumber 0 1\r\n");
        assert!(matches!(parser.build(), Err(ParseError::BadFormat(_))));

        parser.reset();
        parse_all(&mut parser, b"set k 0 0\r\n");
        assert!(matches!(parser.build(), Err(ParseError::BadFormat(_))));
    }

    #[test]
    fn test_key_too_long() {
        let mut parser = TextParser::new();
        let line = format!("get {}\r\n", "k".repeat(MAX_KEY_LENGTH + 1));
        parse_all(&mut parser, line.as_bytes());
        assert!(matches!(parser.build(), Err(ParseError::BadFormat(_))));
    }

    #[test]
    fn test_line_too_long_is_fatal() {
        let mut parser = TextParser::new();
        let long = vec![b'a'; MAX_LINE_LENGTH + 1];
        assert_eq!(
            parser.parse(&long),
            Err(ParseError::LineTooLong {
                max: MAX_LINE_LENGTH
            })
        );
    }

    #[test]
    fn test_argument_too_large_is_fatal() {
        let mut parser = TextParser::new();
        let line = format!("set k 0 0 {}\r\n", DEFAULT_MAX_ARGUMENT_LENGTH + 1);
        assert_eq!(
            parser.parse(line.as_bytes()),
            Err(ParseError::ArgumentTooLarge {
                size: DEFAULT_MAX_ARGUMENT_LENGTH + 1,
                max: DEFAULT_MAX_ARGUMENT_LENGTH,
            })
        );
    }

    #[test]
    fn test_argument_limit_is_configurable() {
        let mut parser = TextParser::with_max_argument_length(16);
        assert_eq!(parser.max_argument_length(), 16);

        parse_all(&mut parser, b"set k 0 0 16\r\n");
        assert_eq!(parser.build().unwrap().1, 16);

        parser.reset();
        assert_eq!(
            parser.parse(b"append k 0 0 17\r\n"),
            Err(ParseError::ArgumentTooLarge { size: 17, max: 16 })
        );
    }

    #[test]
    fn test_default_limit_matches_storage_cap() {
        assert_eq!(TextParser::new().max_argument_length(), DEFAULT_MAX_VALUE_SIZE);
    }

    #[test]
    fn test_error_replies() {
        let parser = TextParser::new();
        assert_eq!(
            parser.error_reply(&ParseError::UnknownCommand("fly".to_string())),
            Bytes::from("ERROR")
        );
        assert_eq!(
            parser.error_reply(&ParseError::BadFormat("invalid flags".to_string())),
            Bytes::from("CLIENT_ERROR bad command line format: invalid flags")
        );
    }

    #[test]
    fn test_build_without_line() {
        let mut parser = TextParser::new();
        assert_eq!(parser.build().unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut parser = TextParser::new();
        parse_all(&mut parser, b"get par");
        parser.reset();

        parse_all(&mut parser, b"version\r\n");
        assert_eq!(parser.build().unwrap().0, TextCommand::Version);
    }
}
