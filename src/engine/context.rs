//! Transport context: the engine runtime and the socket table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use super::packet::SocketId;
use super::signal::Signal;
use crate::core::constants::{
    DEFAULT_RECV_BUFFER_SIZE, DEFAULT_TICK_INTERVAL, DEFAULT_WORKER_THREADS,
};
use crate::core::{SrtError, SrtResult};
use crate::poll::PollSet;
use crate::socket::core::SocketCore;
use crate::socket::{SocketHandle, SocketOptions};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads of the engine runtime.
    pub worker_threads: usize,
    /// Period of the timer driving retransmission and liveness checks.
    pub tick_interval: Duration,
    /// Name given to engine threads.
    pub thread_name: String,
    /// Receive buffer for one datagram.
    pub recv_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            thread_name: "srt-engine".to_string(),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

/// Builder for a [`Context`].
#[derive(Debug, Default)]
pub struct ContextBuilder {
    config: EngineConfig,
}

impl ContextBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of engine worker threads.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads.max(1);
        self
    }

    /// Set the engine timer period.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the engine thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set the datagram receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    /// Start the engine.
    pub fn build(self) -> SrtResult<Context> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads)
            .thread_name(self.config.thread_name.clone())
            .enable_io()
            .enable_time()
            .build()?;

        debug!(workers = self.config.worker_threads, "transport context started");
        Ok(Context {
            inner: Arc::new(ContextInner {
                shared: Arc::new(Shared::new(self.config)),
                runtime: Some(runtime),
            }),
        })
    }
}

/// State shared by the context, its sockets and the engine tasks.
pub(crate) struct Shared {
    pub(crate) signal: Signal,
    pub(crate) config: EngineConfig,
    next_id: AtomicU32,
    sockets: Mutex<HashMap<SocketId, Weak<SocketCore>>>,
    running: AtomicBool,
}

impl Shared {
    fn new(config: EngineConfig) -> Self {
        Self {
            signal: Signal::new(),
            config,
            next_id: AtomicU32::new(1),
            sockets: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn allocate_id(&self) -> SocketId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            if raw != 0 {
                return SocketId::new(raw);
            }
        }
    }

    pub(crate) fn register(&self, core: &Arc<SocketCore>) {
        self.sockets.lock().insert(core.id(), Arc::downgrade(core));
    }

    pub(crate) fn forget(&self, id: SocketId) {
        self.sockets.lock().remove(&id);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

struct ContextInner {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Safe from any thread, including an async context.
            runtime.shutdown_background();
        }
        debug!("transport context dropped");
    }
}

/// Owner of the transport engine.
///
/// Created once by the application; every socket and poll set keeps its
/// context alive. Cloning is cheap and yields a handle to the same engine.
///
/// ```rust,no_run
/// use srt_session::Context;
///
/// # fn main() -> srt_session::SrtResult<()> {
/// let context = Context::new()?;
/// let listener = context.socket()?;
/// listener.bind("0.0.0.0", 9000)?;
/// listener.listen(5)?;
/// let connection = listener.accept()?;
/// println!("peer stream id: {:?}", connection.stream_id());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Start an engine with the default configuration.
    pub fn new() -> SrtResult<Self> {
        ContextBuilder::new().build()
    }

    /// Builder for a customized engine.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Create a socket with default options.
    pub fn socket(&self) -> SrtResult<SocketHandle> {
        SocketHandle::new(self)
    }

    /// Create a socket with the given options.
    pub fn socket_with(&self, options: SocketOptions) -> SrtResult<SocketHandle> {
        SocketHandle::with_options(self, options)
    }

    /// Create an empty poll set.
    pub fn poll_set(&self) -> PollSet {
        PollSet::new(self)
    }

    /// Close every socket and refuse new ones.
    ///
    /// Blocked calls return; later waits on poll sets fail with
    /// [`SrtError::PollFailed`].
    pub fn shutdown(&self) {
        let shared = &self.inner.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let live: Vec<Arc<SocketCore>> = shared
            .sockets
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        debug!(sockets = live.len(), "shutting down transport context");
        for core in live {
            core.close();
        }
        shared.signal.notify();
    }

    /// Whether [`shutdown`](Self::shutdown) has not been called.
    pub fn is_running(&self) -> bool {
        self.inner.shared.is_running()
    }

    /// Number of open sockets, including accepted connections not yet
    /// handed out by `accept`.
    pub fn socket_count(&self) -> usize {
        self.inner.shared.sockets.lock().len()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub(crate) fn runtime(&self) -> SrtResult<&Handle> {
        if !self.is_running() {
            return Err(SrtError::Shutdown);
        }
        self.inner
            .runtime
            .as_ref()
            .map(Runtime::handle)
            .ok_or(SrtError::Shutdown)
    }

    pub(crate) fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("running", &self.is_running())
            .field("sockets", &self.socket_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let context = Context::builder()
            .worker_threads(0)
            .tick_interval(Duration::from_millis(5))
            .thread_name("test-engine")
            .build()
            .unwrap();
        assert_eq!(context.config().worker_threads, 1);
        assert_eq!(context.config().tick_interval, Duration::from_millis(5));
        assert!(context.is_running());
    }

    #[test]
    fn test_ids_are_unique() {
        let context = Context::new().unwrap();
        let a = context.socket().unwrap();
        let b = context.socket().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(context.socket_count(), 2);

        let old = a.id();
        drop(a);
        let c = context.socket().unwrap();
        assert_ne!(c.id(), old);
        assert_eq!(context.socket_count(), 2);
    }

    #[test]
    fn test_shutdown_closes_sockets() {
        let context = Context::new().unwrap();
        let socket = context.socket().unwrap();
        socket.bind("127.0.0.1", 0).unwrap();

        context.shutdown();
        assert!(!context.is_running());
        assert_eq!(socket.state(), crate::SocketState::Closed);
        assert!(matches!(context.socket(), Err(SrtError::Shutdown)));
        assert_eq!(context.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_inside_async_context() {
        let context = Context::new().unwrap();
        let socket = context.socket().unwrap();
        drop(socket);
        drop(context);
    }
}
