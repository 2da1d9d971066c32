//! Connection State Machine
//!
//! A [`Connection`] owns one non-blocking socket. It never blocks and never
//! drives itself: the reactor calls its callbacks when the poller reports
//! readiness, and reads [`Connection::interest`] afterwards to decide what to
//! wait for next.
//!
//! ## Request Lifecycle
//!
//! ```text
//!          bytes from socket
//!                 │
//!                 ▼
//!   ┌───────────────────────────┐  parse()   ┌───────────────────────────┐
//!   │ 1. Parsing request line   │──────────> │ 2. Accumulating argument  │
//!   │    (parser holds partial) │ complete,  │    (n bytes + "\r\n")     │
//!   └───────────────────────────┘  build()   └─────────────┬─────────────┘
//!                 ▲                                        │ all bytes in
//!                 │                                        ▼
//!                 │      reset()            ┌───────────────────────────┐
//!                 └──────────────────────── │ 3. Execute against storage│
//!                                           │    queue reply + "\r\n"   │
//!                                           └───────────────────────────┘
//! ```
//!
//! A command with no argument goes from 1 straight to 3. Requests execute
//! strictly in arrival order on the thread that runs `do_read`.
//!
//! ## Output
//!
//! Replies wait in an [`OutboundQueue`]. `do_write` hands as many of them as
//! fit to one vectored write and keeps `WRITABLE` interest until the queue
//! drains.
//!
//! A client that pipelines requests without reading replies cannot grow the
//! queue without bound. Once the unsent bytes reach the output limit the
//! connection stops parsing and drops `READABLE` interest. `do_write` lifts
//! the pause when the queue falls back below the limit and works through
//! whatever was left in the read buffer.
//!
//! ## Failure
//!
//! I/O failures, peer close and unrecoverable framing problems mark the
//! connection dead. A dead connection performs no further I/O; the reactor
//! notices through [`Connection::is_alive`] and tears it down. Errors that
//! concern one request (bad command line, bad data chunk, command failure)
//! are answered with an error reply and the connection carries on.

use crate::connection::buffer::{ReadBuffer, DEFAULT_READ_BUFFER_SIZE};
use crate::connection::interest::InterestMask;
use crate::connection::outbound::{OutboundQueue, DEFAULT_MAX_PENDING_OUTPUT, MAX_IOVECS};
use crate::protocol::{Command, Parser, TextParser, CRLF};
use crate::storage::Storage;
use bytes::{BufMut, Bytes, BytesMut};
use mio::{Registry, Token};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, trace, warn, Span};

/// Reply for an argument that is not followed by the terminator.
const BAD_DATA_CHUNK: &[u8] = b"CLIENT_ERROR bad data chunk";

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed its end of the stream
    #[error("Peer closed the connection")]
    PeerClosed,

    /// The socket accepted no bytes of a non-empty write
    #[error("Socket accepted zero bytes")]
    WriteZero,

    /// The read buffer filled up before the parser could make progress
    #[error("Request exceeds the {capacity} byte read buffer")]
    RequestTooLarge { capacity: usize },

    /// The stream can no longer be parsed
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Bytes read from the socket
    pub bytes_read: u64,
    /// Bytes the socket accepted
    pub bytes_written: u64,
    /// Commands executed, error replies excluded
    pub commands_executed: u64,
}

/// State guarded by the connection lock.
struct Inner<S, P: Parser> {
    stream: S,
    alive: bool,
    interest: InterestMask,
    read_buffer: ReadBuffer,
    parser: P,
    /// Built command waiting for its argument
    pending: Option<P::Command>,
    /// Argument bytes, terminator included, still to arrive
    argument_remaining: usize,
    argument: BytesMut,
    outbound: OutboundQueue,
    /// Unsent reply bytes at which reading pauses
    max_pending_output: usize,
    reading_paused: bool,
    stats: ConnectionStats,
}

impl<S, P: Parser> Inner<S, P> {
    fn output_backlogged(&self) -> bool {
        self.outbound.pending_bytes() >= self.max_pending_output
    }
}

/// A client connection driven by readiness callbacks.
pub struct Connection<S, P: Parser = TextParser> {
    id: u64,
    storage: Arc<dyn Storage>,
    span: Span,
    inner: Mutex<Inner<S, P>>,
}

impl<S, P: Parser> std::fmt::Debug for Connection<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("interest", &self.interest())
            .finish()
    }
}

impl<S, P: Parser> Connection<S, P> {
    /// Creates a connection over `stream`.
    ///
    /// The span is the connection's only logger; every event it emits is
    /// recorded under it.
    pub fn new(id: u64, stream: S, parser: P, storage: Arc<dyn Storage>, span: Span) -> Self {
        Self {
            id,
            storage,
            span,
            inner: Mutex::new(Inner {
                stream,
                alive: true,
                interest: InterestMask::NONE,
                read_buffer: ReadBuffer::new(DEFAULT_READ_BUFFER_SIZE),
                parser,
                pending: None,
                argument_remaining: 0,
                argument: BytesMut::new(),
                outbound: OutboundQueue::new(),
                max_pending_output: DEFAULT_MAX_PENDING_OUTPUT,
                reading_paused: false,
                stats: ConnectionStats::default(),
            }),
        }
    }

    /// Replaces the read buffer with one of `capacity` bytes.
    pub fn with_read_buffer_size(mut self, capacity: usize) -> Self {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        inner.read_buffer = ReadBuffer::new(capacity.max(1));
        self
    }

    /// Pauses reading while more than `limit` reply bytes are unsent.
    pub fn with_max_pending_output(mut self, limit: usize) -> Self {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        inner.max_pending_output = limit.max(1);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S, P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms read, error and hang-up interest. Performs no I/O.
    pub fn start(&self) {
        let mut inner = self.lock();
        inner.interest = InterestMask::READABLE | InterestMask::ERROR | InterestMask::HANGUP;
        debug!(parent: &self.span, "Connection started");
    }

    /// The poller reported an error on the socket.
    pub fn on_error(&self) {
        let mut inner = self.lock();
        if inner.alive {
            warn!(parent: &self.span, "Socket error reported");
            Self::shut(&mut inner);
        }
    }

    /// The peer hung up.
    pub fn on_close(&self) {
        let mut inner = self.lock();
        if inner.alive {
            debug!(parent: &self.span, "Peer hung up");
            Self::shut(&mut inner);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.lock().alive
    }

    pub fn interest(&self) -> InterestMask {
        self.lock().interest
    }

    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats
    }

    fn shut(inner: &mut Inner<S, P>) {
        inner.alive = false;
        inner.interest = InterestMask::NONE;
    }

    fn fail(&self, inner: &mut Inner<S, P>, err: &ConnectionError) {
        match err {
            ConnectionError::PeerClosed => debug!(parent: &self.span, "Peer closed the connection"),
            ConnectionError::Io(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(parent: &self.span, "Connection reset by peer")
            }
            _ => error!(parent: &self.span, error = %err, "Connection failed"),
        }
        Self::shut(inner);
    }

    /// Works through the read buffer until it runs dry or the parser stalls.
    /// No new command is parsed while the output is backlogged.
    fn process(&self, inner: &mut Inner<S, P>) -> Result<(), ConnectionError> {
        loop {
            if inner.pending.is_some() && inner.argument_remaining == 0 {
                self.execute_pending(inner);
                continue;
            }
            if inner.read_buffer.is_empty() {
                break;
            }

            if inner.pending.is_none() {
                if inner.output_backlogged() {
                    break;
                }
                let parsed = inner
                    .parser
                    .parse(inner.read_buffer.as_slice())
                    .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
                inner.read_buffer.consume(parsed.consumed);

                if parsed.complete {
                    self.build_command(inner);
                } else if parsed.consumed == 0 {
                    break;
                }
            } else {
                let available = inner.read_buffer.as_slice();
                let take = inner.argument_remaining.min(available.len());
                inner.argument.extend_from_slice(&available[..take]);
                inner.read_buffer.consume(take);
                inner.argument_remaining -= take;
            }
        }

        if inner.read_buffer.is_full() && !inner.output_backlogged() {
            return Err(ConnectionError::RequestTooLarge {
                capacity: inner.read_buffer.capacity(),
            });
        }
        Ok(())
    }

    fn build_command(&self, inner: &mut Inner<S, P>) {
        match inner.parser.build() {
            Ok((command, argument_len)) => {
                trace!(
                    parent: &self.span,
                    command = inner.parser.name(),
                    argument_len,
                    "Command built"
                );
                inner.argument_remaining = if argument_len > 0 {
                    argument_len + CRLF.len()
                } else {
                    0
                };
                inner.argument.clear();
                // Grows with the bytes that actually arrive.
                let reserve = inner.argument_remaining.min(inner.read_buffer.capacity());
                inner.argument.reserve(reserve);
                inner.pending = Some(command);
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Bad command line");
                let reply = inner.parser.error_reply(&e);
                Self::queue_reply(inner, &reply);
                inner.parser.reset();
            }
        }
    }

    fn execute_pending(&self, inner: &mut Inner<S, P>) {
        let Some(command) = inner.pending.take() else {
            return;
        };
        let mut argument = inner.argument.split();

        let reply = if !argument.is_empty() && !argument.ends_with(CRLF) {
            warn!(parent: &self.span, command = inner.parser.name(), "Bad data chunk");
            Bytes::from_static(BAD_DATA_CHUNK)
        } else {
            argument.truncate(argument.len().saturating_sub(CRLF.len()));
            match command.execute(self.storage.as_ref(), &argument) {
                Ok(reply) => {
                    inner.stats.commands_executed += 1;
                    trace!(parent: &self.span, command = inner.parser.name(), "Command executed");
                    reply
                }
                Err(e) => {
                    warn!(parent: &self.span, command = inner.parser.name(), error = %e, "Command failed");
                    Bytes::from(format!("SERVER_ERROR {}", e))
                }
            }
        };

        Self::queue_reply(inner, &reply);
        inner.parser.reset();
    }

    fn pause_reading(&self, inner: &mut Inner<S, P>) {
        inner.reading_paused = true;
        inner.interest.remove(InterestMask::READABLE);
        debug!(
            parent: &self.span,
            pending = inner.outbound.pending_bytes(),
            "Output backlog full, reading paused"
        );
    }

    fn resume_reading(&self, inner: &mut Inner<S, P>) {
        inner.reading_paused = false;
        inner.interest.insert(InterestMask::READABLE);
        debug!(parent: &self.span, "Reading resumed");
    }

    fn queue_reply(inner: &mut Inner<S, P>, reply: &[u8]) {
        let mut framed = BytesMut::with_capacity(reply.len() + CRLF.len());
        framed.put_slice(reply);
        framed.put_slice(CRLF);
        inner.outbound.push(framed.freeze());
        inner.interest.insert(InterestMask::WRITABLE);
    }
}

impl<S: Read + Write, P: Parser> Connection<S, P> {
    /// Reads until the socket would block, executing every complete request.
    pub fn do_read(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.alive || inner.reading_paused {
            return;
        }

        loop {
            let n = match inner.read_buffer.fill_from(&mut inner.stream) {
                Ok(0) => {
                    self.fail(inner, &ConnectionError::PeerClosed);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(inner, &ConnectionError::Io(e));
                    return;
                }
            };

            inner.stats.bytes_read += n as u64;
            trace!(parent: &self.span, bytes = n, "Read data");

            if let Err(e) = self.process(inner) {
                self.fail(inner, &e);
                return;
            }
            if inner.output_backlogged() {
                self.pause_reading(inner);
                return;
            }
        }
    }

    /// Writes as much of the outbound queue as the socket takes in one
    /// vectored write.
    pub fn do_write(&self) -> Result<(), ConnectionError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.alive {
            return Ok(());
        }
        if inner.outbound.is_empty() {
            inner.interest.remove(InterestMask::WRITABLE);
            return Ok(());
        }

        let result = {
            let slices = inner.outbound.io_slices(MAX_IOVECS);
            inner.stream.write_vectored(&slices)
        };

        match result {
            Ok(0) => {
                let err = ConnectionError::WriteZero;
                self.fail(inner, &err);
                Err(err)
            }
            Ok(n) => {
                let removed = inner.outbound.advance(n);
                inner.stats.bytes_written += n as u64;
                trace!(parent: &self.span, bytes = n, removed, "Wrote data");

                if inner.outbound.is_empty() {
                    inner.interest.remove(InterestMask::WRITABLE);
                }

                if inner.reading_paused && !inner.output_backlogged() {
                    self.resume_reading(inner);
                    if let Err(e) = self.process(inner) {
                        self.fail(inner, &e);
                        return Err(e);
                    }
                    if inner.output_backlogged() {
                        self.pause_reading(inner);
                    }
                }
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(())
            }
            Err(e) => {
                error!(parent: &self.span, error = %e, "Write failed");
                Self::shut(inner);
                Err(ConnectionError::Io(e))
            }
        }
    }
}

impl<S: mio::event::Source, P: Parser> Connection<S, P> {
    /// Registers the socket with the poller under the current interest.
    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut inner = self.lock();
        let interest = inner.interest.to_mio().unwrap_or(mio::Interest::READABLE);
        registry.register(&mut inner.stream, token, interest)
    }

    /// Re-arms the socket with the current interest.
    pub fn reregister(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut inner = self.lock();
        let interest = inner.interest.to_mio().unwrap_or(mio::Interest::READABLE);
        registry.reregister(&mut inner.stream, token, interest)
    }

    pub fn deregister(&self, registry: &Registry) -> io::Result<()> {
        let mut inner = self.lock();
        registry.deregister(&mut inner.stream)
    }
}
