//! Poll-driven server loop.
//!
//! `Server` owns a non-blocking listener and a poll set. [`Server::start`]
//! accepts connections, hands each to the acceptor and dispatches received
//! messages to the callbacks the acceptor installed.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::connection::ServerConnection;
use crate::core::constants::{DEFAULT_BACKLOG, SERVER_POLL_INTERVAL};
use crate::core::{SrtError, SrtResult};
use crate::engine::{Context, SocketId};
use crate::poll::{Interest, PollSet};
use crate::socket::{IntoPort, SocketHandle, SocketOptions};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listener backlog.
    pub backlog: usize,
    /// Longest single wait of the loop; bounds how long `close` takes to
    /// be noticed.
    pub poll_interval: Duration,
    /// Messages read from one connection per wakeup.
    pub max_reads_per_wakeup: usize,
    /// Options of the listener, inherited by accepted connections.
    /// Blocking is always switched off.
    pub socket_options: SocketOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            poll_interval: SERVER_POLL_INTERVAL,
            max_reads_per_wakeup: 64,
            socket_options: SocketOptions::new(),
        }
    }
}

/// Builder for a [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listener backlog.
    pub fn backlog(mut self, backlog: usize) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the per-wakeup read limit.
    pub fn max_reads_per_wakeup(mut self, reads: usize) -> Self {
        self.config.max_reads_per_wakeup = reads.max(1);
        self
    }

    /// Set the listener options.
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.config.socket_options = options;
        self
    }

    /// Bind and start listening.
    pub fn bind(self, context: &Context, host: &str, port: impl IntoPort) -> SrtResult<Server> {
        Server::with_config(context, host, port, self.config)
    }
}

/// Poll-driven server.
///
/// ```rust,no_run
/// use srt_session::Context;
/// use srt_session::server::Server;
///
/// # fn main() -> srt_session::SrtResult<()> {
/// let context = Context::new()?;
/// let server = Server::bind(&context, "0.0.0.0", 9000)?;
/// server.start(|connection| {
///     connection.on_data(|socket, data| {
///         let _ = socket.send_message(data);
///     });
///     true
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: SocketHandle,
    poll: PollSet,
    config: ServerConfig,
    running: AtomicBool,
    connections: Mutex<HashMap<SocketId, ServerConnection>>,
    connection_count: AtomicUsize,
}

impl Server {
    /// Bind with the default configuration.
    pub fn bind(context: &Context, host: &str, port: impl IntoPort) -> SrtResult<Self> {
        ServerBuilder::new().bind(context, host, port)
    }

    /// Builder for a customized server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    fn with_config(
        context: &Context,
        host: &str,
        port: impl IntoPort,
        config: ServerConfig,
    ) -> SrtResult<Self> {
        let options = config.socket_options.clone().blocking(false);
        let listener = context.socket_with(options)?;
        listener.bind(host, port)?;
        listener.listen(config.backlog)?;
        let poll = context.poll_set();
        poll.add(&listener, Interest::READABLE | Interest::ERROR)?;

        Ok(Self {
            listener,
            poll,
            config,
            running: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            connection_count: AtomicUsize::new(0),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SrtResult<SocketAddr> {
        self.listener.local_addr()
    }

    /// Connections currently served.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run the loop on the calling thread until [`close`](Self::close).
    ///
    /// `acceptor` sees every new connection; returning `false` closes it.
    /// When the loop ends every remaining connection is closed and its
    /// close callback runs.
    pub fn start<F>(&self, mut acceptor: F) -> SrtResult<()>
    where
        F: FnMut(&mut ServerConnection) -> bool,
    {
        if self.listener.core().is_closed() {
            return Err(SrtError::Closed);
        }
        self.running.store(true, Ordering::Release);
        info!(local_addr = ?self.local_addr().ok(), "server started");

        let result = self.run(&mut acceptor);

        self.running.store(false, Ordering::Release);
        self.close_connections();
        info!("server stopped");
        result
    }

    /// Stop the loop and close the listener. Safe to call from a callback
    /// or another thread.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        // Closing wakes the poll wait.
        let _ = self.listener.close();
    }

    fn run(&self, acceptor: &mut dyn FnMut(&mut ServerConnection) -> bool) -> SrtResult<()> {
        let listener_id = self.listener.id();
        while self.is_running() {
            let ready = match self.poll.wait(Some(self.config.poll_interval)) {
                Ok(ready) => ready,
                Err(_) if !self.is_running() => break,
                Err(e) => return Err(e),
            };

            if ready.readable.contains(&listener_id) {
                self.accept_pending(acceptor)?;
            }

            let active: BTreeSet<SocketId> = ready
                .readable
                .iter()
                .chain(ready.errored.iter())
                .copied()
                .filter(|id| *id != listener_id)
                .collect();
            for id in active {
                self.service(id)?;
            }
        }
        Ok(())
    }

    fn accept_pending(
        &self,
        acceptor: &mut dyn FnMut(&mut ServerConnection) -> bool,
    ) -> SrtResult<()> {
        loop {
            let socket = match self.listener.accept() {
                Ok(socket) => socket,
                Err(SrtError::WouldBlock | SrtError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };

            let mut connection = ServerConnection::new(socket);
            if !acceptor(&mut connection) {
                debug!(id = %connection.id(), "connection declined by acceptor");
                continue;
            }

            self.poll
                .add(connection.socket(), Interest::READABLE | Interest::ERROR)?;
            debug!(id = %connection.id(), peer = ?connection.peer_addr().ok(), "connection accepted");
            self.connections.lock().insert(connection.id(), connection);
            self.connection_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drain one ready connection. It is taken out of the table while its
    /// callbacks run.
    fn service(&self, id: SocketId) -> SrtResult<()> {
        let Some(mut connection) = self.connections.lock().remove(&id) else {
            return Ok(());
        };

        let mut open = true;
        for _ in 0..self.config.max_reads_per_wakeup {
            match connection.socket().receive_message() {
                Ok(Some(data)) => connection.dispatch_data(&data),
                Ok(None) => {
                    debug!(%id, "peer closed connection");
                    open = false;
                    break;
                }
                Err(SrtError::WouldBlock) => break,
                Err(e) => {
                    warn!(%id, error = %e, "connection failed");
                    open = false;
                    break;
                }
            }
        }

        if open {
            self.connections.lock().insert(id, connection);
        } else {
            self.poll.remove(connection.socket())?;
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
            connection.dispatch_close();
        }
        Ok(())
    }

    fn close_connections(&self) {
        let remaining: Vec<ServerConnection> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for mut connection in remaining {
            let _ = self.poll.remove(connection.socket());
            let _ = connection.socket().close();
            connection.dispatch_close();
        }
        self.connection_count.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}
