//! Readiness Reactor
//!
//! One thread owns the [`mio::Poll`]. It accepts sockets, and for every
//! readiness event on a connection it submits a task to the [`Executor`]
//! that runs the matching callback, then re-arms or tears down the socket.
//!
//! ```text
//!   poll() ──┬── LISTENER ──> accept until WouldBlock, register
//!            ├── WAKER    ──> shutdown requested? leave the loop
//!            └── conn     ──> Executor task:
//!                               on_error | do_read, do_write, on_close
//!                               alive? reregister : deregister + drop
//! ```
//!
//! When the Executor refuses a task the reactor runs it inline, so no event
//! is lost under back-pressure.

use crate::concurrency::{Executor, ExecutorError};
use crate::connection::Connection;
use crate::protocol::TextParser;
use crate::server::ServerConfig;
use crate::storage::{Storage, StorageEngine};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, info_span, trace, warn, Span};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

type Conn = Connection<TcpStream, TextParser>;

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Server-wide counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// Callbacks run on the reactor thread because the executor was full
    pub inline_dispatches: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Requests a graceful stop of a running server from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Asks the server to stop. Returns once the reactor has been woken;
    /// `Server::run` returns after queued work has drained.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Readiness flags of one event, detached from the event buffer.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    error: bool,
    readable: bool,
    writable: bool,
    hangup: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            error: event.is_error(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() && event.is_write_closed(),
        }
    }
}

/// What connection tasks share with the reactor thread.
struct Reactor {
    registry: Registry,
    connections: Mutex<HashMap<Token, Arc<Conn>>>,
    stats: Arc<ServerStats>,
    span: Span,
}

impl Reactor {
    fn connections(&self) -> MutexGuard<'_, HashMap<Token, Arc<Conn>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the callbacks for one event, then re-arms or tears down.
    fn handle(&self, token: Token, conn: &Conn, readiness: Readiness) {
        if readiness.error {
            conn.on_error();
        } else {
            if readiness.readable {
                conn.do_read();
            }
            if readiness.writable {
                if let Err(e) = conn.do_write() {
                    trace!(parent: &self.span, conn = conn.id(), error = %e, "Write ended connection");
                }
            }
            if readiness.hangup {
                conn.on_close();
            }
        }

        self.update(token, conn);
    }

    fn update(&self, token: Token, conn: &Conn) {
        let mut connections = self.connections();
        if !connections.contains_key(&token) {
            return;
        }

        if conn.is_alive() {
            match conn.reregister(&self.registry, token) {
                Ok(()) => return,
                Err(e) => {
                    warn!(parent: &self.span, conn = conn.id(), error = %e, "Failed to re-arm connection");
                    conn.on_error();
                }
            }
        }

        connections.remove(&token);
        drop(connections);
        self.close(conn);
    }

    fn close(&self, conn: &Conn) {
        if let Err(e) = conn.deregister(&self.registry) {
            trace!(parent: &self.span, conn = conn.id(), error = %e, "Deregister failed");
        }
        self.stats.connection_closed();
        debug!(parent: &self.span, conn = conn.id(), stats = ?conn.stats(), "Connection closed");
    }
}

/// A TCP server speaking the text protocol.
///
/// # Example
///
/// ```no_run
/// use emberkv::server::{Server, ServerConfig};
/// use emberkv::storage::StorageEngine;
/// use std::sync::Arc;
///
/// let server = Server::bind(ServerConfig::default(), Arc::new(StorageEngine::new())).unwrap();
/// let handle = server.shutdown_handle();
///
/// let thread = std::thread::spawn(move || server.run());
/// handle.shutdown().unwrap();
/// thread.join().unwrap().unwrap();
/// ```
pub struct Server {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    storage: Arc<StorageEngine>,
    executor: Executor,
    reactor: Arc<Reactor>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    next_token: usize,
}

impl Server {
    /// Binds the listener and starts the worker pool. No connection is
    /// accepted until [`Server::run`].
    pub fn bind(config: ServerConfig, storage: Arc<StorageEngine>) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.addr).map_err(|source| ServerError::Bind {
            addr: config.addr,
            source,
        })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let executor = Executor::new(config.executor.clone())?;

        let span = info_span!("server", addr = %listener.local_addr()?);
        let reactor = Arc::new(Reactor {
            registry: poll.registry().try_clone()?,
            connections: Mutex::new(HashMap::new()),
            stats: Arc::new(ServerStats::new()),
            span,
        });

        Ok(Self {
            config,
            poll,
            listener,
            storage,
            executor,
            reactor,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_token: FIRST_CONNECTION,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            requested: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.reactor.stats)
    }

    /// Runs the event loop until shutdown is requested, then stops the
    /// worker pool, waiting for queued callbacks, and closes every
    /// remaining connection.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(parent: &self.reactor.span, "Server started");

        let result = self.event_loop();
        if let Err(e) = &result {
            error!(parent: &self.reactor.span, error = %e, "Event loop failed");
        }

        self.executor.stop(true);

        let remaining: Vec<Arc<Conn>> = self
            .reactor
            .connections()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &remaining {
            self.reactor.close(conn);
        }

        info!(parent: &self.reactor.span, closed = remaining.len(), "Server stopped");
        result
    }

    fn event_loop(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(self.config.max_events.max(1));
        let mut last_sweep = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = self
                .config
                .expiry_interval
                .saturating_sub(last_sweep.elapsed());

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => self.dispatch(token, Readiness::from(event)),
                }
            }

            if last_sweep.elapsed() >= self.config.expiry_interval {
                self.schedule_sweep();
                last_sweep = Instant::now();
            }
        }

        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.open(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(parent: &self.reactor.span, error = %e, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    fn open(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(parent: &self.reactor.span, client = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        let id = token.0 as u64;
        let span = info_span!(parent: &self.reactor.span, "connection", conn = id, client = %peer);
        let parser = TextParser::with_max_argument_length(self.storage.max_value_size());
        let storage: Arc<dyn Storage> = self.storage.clone();
        let conn = Connection::new(id, stream, parser, storage, span)
            .with_read_buffer_size(self.config.read_buffer_size)
            .with_max_pending_output(self.config.max_pending_output);
        conn.start();

        if let Err(e) = conn.register(&self.reactor.registry, token) {
            warn!(parent: &self.reactor.span, client = %peer, error = %e, "Failed to register connection");
            return;
        }

        self.reactor.connections().insert(token, Arc::new(conn));
        self.reactor.stats.connection_opened();
        debug!(parent: &self.reactor.span, conn = id, client = %peer, "Client connected");
    }

    fn dispatch(&self, token: Token, readiness: Readiness) {
        let Some(conn) = self.reactor.connections().get(&token).cloned() else {
            return;
        };

        let reactor = Arc::clone(&self.reactor);
        let task_conn = Arc::clone(&conn);
        let submitted = self
            .executor
            .execute(move || reactor.handle(token, &task_conn, readiness));

        if let Err(e) = submitted {
            trace!(parent: &self.reactor.span, conn = conn.id(), error = %e, "Running callback inline");
            self.reactor
                .stats
                .inline_dispatches
                .fetch_add(1, Ordering::Relaxed);
            self.reactor.handle(token, &conn, readiness);
        }
    }

    fn schedule_sweep(&self) {
        let storage = Arc::clone(&self.storage);
        let submitted = self.executor.execute(move || {
            let removed = storage.cleanup_expired();
            if removed > 0 {
                debug!(removed, "Expired keys swept");
            }
        });

        if let Err(e) = submitted {
            trace!(parent: &self.reactor.span, error = %e, "Expiry sweep skipped");
        }
    }
}
