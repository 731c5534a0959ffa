//! Socket state shared between user handles and the engine.
//!
//! Lock discipline: a core lock may be held while taking an endpoint's
//! route or listener lock, never the other way round. Endpoint code clones
//! what it needs out of its tables before calling into a core.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::options::{SocketOptions, validate_stream_id};
use super::state::{AcceptFilter, ConnectionRequest, SocketState};
use crate::core::constants::HANDSHAKE_RETRY_INTERVAL;
use crate::core::{SrtError, SrtResult};
use crate::engine::endpoint::Endpoint;
use crate::engine::packet::{Packet, RejectReason, SocketId};
use crate::engine::{Connection, ConnectionPhase, Shared};
use crate::poll::Interest;
use crate::stats::StatsSnapshot;

enum CoreState {
    Created,
    Bound {
        endpoint: Arc<Endpoint>,
    },
    Listening {
        endpoint: Arc<Endpoint>,
        backlog: usize,
        pending: VecDeque<Arc<SocketCore>>,
    },
    Linked {
        endpoint: Arc<Endpoint>,
        conn: Connection,
    },
    Closed,
}

impl CoreState {
    fn public(&self) -> SocketState {
        match self {
            Self::Created => SocketState::Created,
            Self::Bound { .. } => SocketState::Bound,
            Self::Listening { .. } => SocketState::Listening,
            Self::Linked { conn, .. } => match conn.phase() {
                ConnectionPhase::Connecting => SocketState::Connecting,
                ConnectionPhase::Connected => SocketState::Connected,
                ConnectionPhase::PeerClosed | ConnectionPhase::Broken(_) => SocketState::Broken,
            },
            Self::Closed => SocketState::Closed,
        }
    }

    fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        match self {
            Self::Bound { endpoint }
            | Self::Listening { endpoint, .. }
            | Self::Linked { endpoint, .. } => Some(endpoint),
            Self::Created | Self::Closed => None,
        }
    }
}

struct CoreInner {
    options: SocketOptions,
    state: CoreState,
    accept_filter: Option<AcceptFilter>,
}

pub(crate) struct SocketCore {
    id: SocketId,
    shared: Arc<Shared>,
    created: Instant,
    inner: Mutex<CoreInner>,
}

impl SocketCore {
    pub(crate) fn new(shared: &Arc<Shared>, options: SocketOptions) -> Arc<Self> {
        let id = shared.allocate_id();
        Self::with_state(shared, id, options, CoreState::Created)
    }

    fn with_state(
        shared: &Arc<Shared>,
        id: SocketId,
        options: SocketOptions,
        state: CoreState,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            id,
            shared: Arc::clone(shared),
            created: Instant::now(),
            inner: Mutex::new(CoreInner {
                options,
                state,
                accept_filter: None,
            }),
        });
        shared.register(&core);
        core
    }

    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn state(&self) -> SocketState {
        self.inner.lock().state.public()
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, CoreState::Closed)
    }

    /// Conditions currently reported to poll sets.
    pub(crate) fn readiness(&self) -> Interest {
        match &self.inner.lock().state {
            CoreState::Listening { pending, .. } if !pending.is_empty() => Interest::READABLE,
            CoreState::Linked { conn, .. } => conn.readiness(),
            _ => Interest::NONE,
        }
    }

    pub(crate) fn options(&self) -> SocketOptions {
        self.inner.lock().options.clone()
    }

    pub(crate) fn set_read_sync(&self, blocking: bool) {
        self.inner.lock().options.read_sync = blocking;
        // Wake callers blocked under the old mode.
        self.shared.signal.notify();
    }

    pub(crate) fn set_write_sync(&self, blocking: bool) {
        self.inner.lock().options.write_sync = blocking;
        self.shared.signal.notify();
    }

    /// Apply an option change allowed only before the socket connects.
    pub(crate) fn configure(
        &self,
        change: impl FnOnce(&mut SocketOptions) -> SrtResult<()>,
    ) -> SrtResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CoreState::Closed => return Err(SrtError::Closed),
            CoreState::Linked { .. } => {
                return Err(SrtError::InvalidArgument(
                    "option can only be changed before connecting".to_string(),
                ));
            }
            CoreState::Created | CoreState::Bound { .. } | CoreState::Listening { .. } => {}
        }
        change(&mut inner.options)
    }

    pub(crate) fn set_stream_id(&self, stream_id: Option<String>) -> SrtResult<()> {
        if let Some(stream_id) = &stream_id {
            validate_stream_id(stream_id)?;
        }
        self.configure(|options| {
            options.stream_id = stream_id;
            Ok(())
        })
    }

    pub(crate) fn set_accept_filter(&self, filter: Option<AcceptFilter>) {
        self.inner.lock().accept_filter = filter;
    }

    pub(crate) fn local_addr(&self) -> SrtResult<SocketAddr> {
        let inner = self.inner.lock();
        match &inner.state {
            CoreState::Closed => Err(SrtError::Closed),
            state => state
                .endpoint()
                .map(|endpoint| endpoint.local_addr())
                .ok_or_else(|| SrtError::InvalidArgument("socket is not bound".to_string())),
        }
    }

    pub(crate) fn peer_addr(&self) -> SrtResult<SocketAddr> {
        match &self.inner.lock().state {
            CoreState::Linked { conn, .. } => Ok(conn.peer_addr()),
            CoreState::Closed => Err(SrtError::Closed),
            _ => Err(SrtError::InvalidArgument(
                "socket is not connected".to_string(),
            )),
        }
    }

    pub(crate) fn bind(&self, runtime: &Handle, addrs: &[SocketAddr]) -> SrtResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CoreState::Created => {}
            CoreState::Closed => return Err(SrtError::Closed),
            _ => {
                return Err(SrtError::BindFailed(
                    "socket is already bound".to_string(),
                ));
            }
        }

        let mut last_error = None;
        for addr in addrs {
            match Endpoint::open(runtime, &self.shared, *addr) {
                Ok(endpoint) => {
                    debug!(id = %self.id, local_addr = %endpoint.local_addr(), "socket bound");
                    inner.state = CoreState::Bound { endpoint };
                    return Ok(());
                }
                Err(e) => {
                    trace!(id = %self.id, %addr, error = %e, "bind attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(SrtError::BindFailed(match last_error {
            Some(e) => e.to_string(),
            None => "no address to bind".to_string(),
        }))
    }

    pub(crate) fn listen(self: &Arc<Self>, backlog: usize) -> SrtResult<()> {
        if backlog == 0 {
            return Err(SrtError::ListenFailed(
                "backlog must be at least 1".to_string(),
            ));
        }

        let mut inner = self.inner.lock();
        let endpoint = match &inner.state {
            CoreState::Bound { endpoint } => Arc::clone(endpoint),
            CoreState::Closed => return Err(SrtError::Closed),
            CoreState::Listening { .. } => {
                return Err(SrtError::ListenFailed("socket is already listening".to_string()));
            }
            _ => {
                return Err(SrtError::ListenFailed(
                    "socket must be bound before listening".to_string(),
                ));
            }
        };
        if !endpoint.set_listener(self) {
            return Err(SrtError::ListenFailed(
                "another socket is listening on this address".to_string(),
            ));
        }

        debug!(id = %self.id, local_addr = %endpoint.local_addr(), backlog, "socket listening");
        inner.state = CoreState::Listening {
            endpoint,
            backlog,
            pending: VecDeque::new(),
        };
        Ok(())
    }

    pub(crate) fn connect(self: &Arc<Self>, runtime: &Handle, addr: SocketAddr) -> SrtResult<()> {
        let (blocking, deadline) = {
            let mut inner = self.inner.lock();
            let endpoint = match &inner.state {
                CoreState::Created => Endpoint::open(runtime, &self.shared, unspecified(addr))
                    .map_err(|e| {
                        SrtError::ConnectFailed(format!("cannot open local endpoint: {e}"))
                    })?,
                CoreState::Bound { endpoint } => Arc::clone(endpoint),
                CoreState::Closed => return Err(SrtError::Closed),
                _ => {
                    return Err(SrtError::ConnectFailed(
                        "socket is already connected or listening".to_string(),
                    ));
                }
            };

            let now = Instant::now();
            let (conn, handshake) = Connection::caller(
                self.id,
                addr,
                inner.options.stream_id.clone(),
                inner.options.connection_settings(),
                now,
            );
            endpoint.register(self);
            endpoint.send(&handshake, addr);
            inner.state = CoreState::Linked { endpoint, conn };

            let timeout = inner.options.connect_timeout;
            (inner.options.read_sync, now + timeout + HANDSHAKE_RETRY_INTERVAL)
        };
        debug!(id = %self.id, peer = %addr, "connecting");

        if !blocking {
            return Ok(());
        }

        let result = self.wait_until(true, Some(deadline), |inner| match &inner.state {
            CoreState::Linked { conn, .. } => match conn.phase() {
                ConnectionPhase::Connected | ConnectionPhase::PeerClosed => Some(Ok(())),
                ConnectionPhase::Broken(reason) => {
                    Some(Err(SrtError::ConnectFailed(reason.describe().to_string())))
                }
                ConnectionPhase::Connecting => None,
            },
            CoreState::Closed => Some(Err(SrtError::Closed)),
            _ => Some(Err(SrtError::ConnectFailed(
                "socket state changed during connect".to_string(),
            ))),
        });

        match result {
            Ok(()) => {
                debug!(id = %self.id, peer = %addr, "connected");
                Ok(())
            }
            Err(SrtError::WouldBlock) => {
                self.abandon_connect();
                Err(SrtError::ConnectFailed(
                    "connection setup timed out".to_string(),
                ))
            }
            Err(e @ SrtError::ConnectFailed(_)) => {
                self.abandon_connect();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Return a failed caller to the bound state so another address can be
    /// tried.
    fn abandon_connect(&self) {
        let mut inner = self.inner.lock();
        let failed = matches!(
            &inner.state,
            CoreState::Linked { conn, .. }
                if matches!(conn.phase(), ConnectionPhase::Connecting | ConnectionPhase::Broken(_))
        );
        if !failed {
            return;
        }
        if let CoreState::Linked { endpoint, .. } =
            std::mem::replace(&mut inner.state, CoreState::Closed)
        {
            endpoint.deregister(self.id);
            inner.state = CoreState::Bound { endpoint };
        }
    }

    pub(crate) fn accept(&self) -> SrtResult<Arc<SocketCore>> {
        let blocking = self.inner.lock().options.read_sync;
        self.wait_until(blocking, None, |inner| match &mut inner.state {
            CoreState::Listening { pending, .. } => pending.pop_front().map(Ok),
            CoreState::Closed => Some(Err(SrtError::Closed)),
            _ => Some(Err(SrtError::AcceptFailed(
                "socket is not listening".to_string(),
            ))),
        })
    }

    pub(crate) fn read(&self, max_bytes: usize) -> SrtResult<Vec<u8>> {
        let blocking = self.inner.lock().options.read_sync;
        self.wait_until(blocking, None, |inner| match &mut inner.state {
            CoreState::Linked { conn, .. } => {
                if conn.has_data() {
                    return Some(Ok(conn.read(max_bytes)));
                }
                match conn.phase() {
                    ConnectionPhase::Connecting | ConnectionPhase::Connected => None,
                    ConnectionPhase::PeerClosed => Some(Ok(Vec::new())),
                    ConnectionPhase::Broken(reason) => {
                        Some(Err(SrtError::ReadFailed(reason.describe().to_string())))
                    }
                }
            }
            CoreState::Closed => Some(Err(SrtError::Closed)),
            _ => Some(Err(SrtError::ReadFailed(
                "socket is not connected".to_string(),
            ))),
        })
    }

    pub(crate) fn receive_message(&self) -> SrtResult<Option<Vec<u8>>> {
        let blocking = self.inner.lock().options.read_sync;
        self.wait_until(blocking, None, |inner| match &mut inner.state {
            CoreState::Linked { conn, .. } => {
                if let Some(message) = conn.take_message() {
                    return Some(Ok(Some(message)));
                }
                match conn.phase() {
                    ConnectionPhase::Connecting | ConnectionPhase::Connected => None,
                    ConnectionPhase::PeerClosed => Some(Ok(None)),
                    ConnectionPhase::Broken(reason) => {
                        Some(Err(SrtError::ReadFailed(reason.describe().to_string())))
                    }
                }
            }
            CoreState::Closed => Some(Err(SrtError::Closed)),
            _ => Some(Err(SrtError::ReadFailed(
                "socket is not connected".to_string(),
            ))),
        })
    }

    /// Send `data`, as one message when `message` is set.
    pub(crate) fn send(&self, data: &[u8], message: bool) -> SrtResult<usize> {
        let blocking = self.inner.lock().options.write_sync;
        self.wait_until(blocking, None, |inner| match &mut inner.state {
            CoreState::Linked { endpoint, conn } => match conn.phase() {
                ConnectionPhase::Connected => {
                    if data.is_empty() && !message {
                        return Some(Ok(0));
                    }
                    if !conn.can_send() {
                        return None;
                    }
                    let peer = conn.peer_addr();
                    for packet in conn.send(data, message, Instant::now()) {
                        endpoint.send(&packet, peer);
                    }
                    Some(Ok(data.len()))
                }
                ConnectionPhase::Connecting => None,
                ConnectionPhase::PeerClosed => Some(Err(SrtError::WriteFailed(
                    "peer closed the connection".to_string(),
                ))),
                ConnectionPhase::Broken(reason) => {
                    Some(Err(SrtError::WriteFailed(reason.describe().to_string())))
                }
            },
            CoreState::Closed => Some(Err(SrtError::Closed)),
            _ => Some(Err(SrtError::WriteFailed(
                "socket is not connected".to_string(),
            ))),
        })
    }

    pub(crate) fn stats(&self, clear: bool) -> SrtResult<StatsSnapshot> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match &mut inner.state {
            CoreState::Linked { conn, .. } => Ok(conn.stats(clear, now)),
            CoreState::Closed => Err(SrtError::Closed),
            _ => Ok(StatsSnapshot::unconnected(self.created, now)),
        }
    }

    /// Stream id received from the peer, for accepted sockets.
    pub(crate) fn peer_stream_id(&self) -> Option<String> {
        match &self.inner.lock().state {
            CoreState::Linked { conn, .. } => conn.stream_id().map(str::to_string),
            _ => None,
        }
    }

    /// Close the socket; closing twice is a no-op.
    pub(crate) fn close(&self) {
        self.teardown(true);
    }

    /// With `notify_peer` unset the connection is dropped without a
    /// shutdown notice or linger.
    fn teardown(&self, notify_peer: bool) {
        let (state, linger) = {
            let mut inner = self.inner.lock();
            let state = std::mem::replace(&mut inner.state, CoreState::Closed);
            (state, inner.options.linger)
        };
        match state {
            CoreState::Closed => return,
            CoreState::Created => {}
            CoreState::Bound { endpoint } => endpoint.release(),
            CoreState::Listening {
                endpoint, pending, ..
            } => {
                endpoint.clear_listener(self.id);
                for core in pending {
                    core.close();
                }
                endpoint.release();
            }
            CoreState::Linked { endpoint, conn } => {
                endpoint.deregister(self.id);
                if notify_peer {
                    endpoint.linger(self.id, conn, Instant::now() + linger);
                } else {
                    endpoint.release();
                }
            }
        }
        self.shared.forget(self.id);
        self.shared.signal.notify();
        debug!(id = %self.id, "socket closed");
    }

    /// Block (or not) until `attempt` produces a result.
    ///
    /// `attempt` runs under the core lock; `None` means "not yet". Returns
    /// [`SrtError::WouldBlock`] when non-blocking or past `deadline`.
    fn wait_until<T>(
        &self,
        blocking: bool,
        deadline: Option<Instant>,
        mut attempt: impl FnMut(&mut CoreInner) -> Option<SrtResult<T>>,
    ) -> SrtResult<T> {
        loop {
            let seen = self.shared.signal.generation();
            if let Some(result) = attempt(&mut self.inner.lock()) {
                return result;
            }
            if !blocking || !self.shared.signal.wait_for_change(seen, deadline) {
                return Err(SrtError::WouldBlock);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.inner.lock().state.endpoint().cloned()
    }

    // Engine side.

    pub(crate) fn on_packet(&self, packet: Packet, from: SocketAddr) {
        let changed = {
            let mut inner = self.inner.lock();
            let CoreState::Linked { endpoint, conn } = &mut inner.state else {
                return;
            };
            if from != conn.peer_addr() {
                trace!(id = %self.id, peer = %conn.peer_id(), %from, "datagram from unexpected address");
                return;
            }
            let before = (conn.phase(), conn.readiness());
            let peer = conn.peer_addr();
            for reply in conn.on_packet(packet, Instant::now()) {
                endpoint.send(&reply, peer);
            }
            before != (conn.phase(), conn.readiness())
        };
        if changed {
            self.shared.signal.notify();
        }
    }

    pub(crate) fn on_tick(&self, now: Instant) {
        let changed = {
            let mut inner = self.inner.lock();
            let CoreState::Linked { endpoint, conn } = &mut inner.state else {
                return;
            };
            let before = (conn.phase(), conn.readiness());
            let peer = conn.peer_addr();
            for packet in conn.on_tick(now) {
                endpoint.send(&packet, peer);
            }
            before != (conn.phase(), conn.readiness())
        };
        if changed {
            self.shared.signal.notify();
        }
    }

    pub(crate) fn resend_handshake_ack(&self) {
        if let CoreState::Linked { endpoint, conn } = &self.inner.lock().state {
            endpoint.send(&conn.handshake_ack(), conn.peer_addr());
        }
    }

    /// Admit a connection request on this listener.
    ///
    /// The accept filter runs without the core lock held. On success the
    /// new socket is routed on `endpoint` and queued for `accept`.
    pub(crate) fn admit(
        &self,
        endpoint: &Arc<Endpoint>,
        peer_addr: SocketAddr,
        peer_id: SocketId,
        stream_id: Option<String>,
    ) -> Result<Arc<SocketCore>, RejectReason> {
        let (filter, options) = {
            let inner = self.inner.lock();
            match &inner.state {
                CoreState::Listening {
                    pending, backlog, ..
                } if pending.len() >= *backlog => return Err(RejectReason::BacklogFull),
                CoreState::Listening { .. } => {}
                _ => return Err(RejectReason::NoListener),
            }
            (inner.accept_filter.clone(), inner.options.clone())
        };

        if let Some(filter) = filter {
            let request = ConnectionRequest {
                peer_addr,
                stream_id: stream_id.clone(),
            };
            if !filter(&request) {
                return Err(RejectReason::Refused);
            }
        }

        let settings = options.connection_settings();
        let mut accepted_options = options;
        accepted_options.stream_id = stream_id.clone();

        let id = self.shared.allocate_id();
        let conn = Connection::acceptor(id, peer_id, peer_addr, stream_id, settings, Instant::now());
        let core = Self::with_state(
            &self.shared,
            id,
            accepted_options,
            CoreState::Linked {
                endpoint: endpoint.acquire(),
                conn,
            },
        );
        endpoint.register(&core);

        let queued = match &mut self.inner.lock().state {
            CoreState::Listening {
                pending, backlog, ..
            } if pending.len() < *backlog => {
                pending.push_back(Arc::clone(&core));
                true
            }
            _ => false,
        };
        if !queued {
            // Listener closed or filled up while the filter ran.
            core.teardown(false);
            return Err(RejectReason::BacklogFull);
        }
        self.shared.signal.notify();
        debug!(listener = %self.id, accepted = %core.id, peer = %peer_addr, "connection admitted");
        Ok(core)
    }
}

fn unspecified(peer: SocketAddr) -> SocketAddr {
    let ip = match peer.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified_matches_family() {
        let v4: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(unspecified(v4), "0.0.0.0:0".parse().unwrap());
        assert_eq!(unspecified(v6), "[::]:0".parse().unwrap());
    }
}
