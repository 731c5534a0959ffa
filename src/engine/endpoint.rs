//! UDP endpoint shared by the sockets bound to one local address.
//!
//! Each endpoint owns three engine tasks:
//!
//! ```text
//!   user threads ──► outbound channel ──► send loop ──► UdpSocket
//!                                                          │
//!   SocketCore ◄── dispatch (routes / listener) ◄── recv loop
//!   SocketCore ◄── tick loop (retransmission, keepalive, timeouts)
//! ```
//!
//! Datagrams are routed by destination socket id. Handshakes carry no
//! destination and go to the listener registered on the endpoint.
//!
//! A socket closed with unacknowledged data hands its connection to the
//! endpoint, which keeps it running until the peer has everything or the
//! linger time runs out.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::connection::{Connection, ConnectionPhase};
use super::context::Shared;
use super::packet::{Packet, RejectReason, SocketId};
use crate::core::constants::{HANDSHAKE_MEMORY, MAX_STREAM_ID_LEN, PROTOCOL_VERSION};
use crate::socket::core::SocketCore;

type Datagram = (Vec<u8>, SocketAddr);

/// Outcome of an earlier handshake from the same caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Admitted as this local socket.
    Live(SocketId),
    /// The admitted socket is closed; retries are ignored until `until`.
    Retired { until: Instant },
}

/// Connection of a closed socket still delivering its data.
struct Lingering {
    conn: Connection,
    deadline: Instant,
}

pub(crate) struct Endpoint {
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Datagram>,
    routes: Mutex<HashMap<SocketId, Arc<SocketCore>>>,
    /// Handshakes by (peer address, peer socket id).
    handshakes: Mutex<HashMap<(SocketAddr, SocketId), Admission>>,
    lingering: Mutex<HashMap<SocketId, Lingering>>,
    listener: Mutex<Option<Weak<SocketCore>>>,
    users: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl Endpoint {
    /// Bind `addr` and start the engine tasks on `runtime`.
    ///
    /// The caller holds the first reference; see [`acquire`](Self::acquire).
    pub(crate) fn open(
        runtime: &Handle,
        shared: &Arc<Shared>,
        addr: SocketAddr,
    ) -> io::Result<Arc<Self>> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;

        let _guard = runtime.enter();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let endpoint = Arc::new(Self {
            local_addr,
            outbound,
            routes: Mutex::new(HashMap::new()),
            handshakes: Mutex::new(HashMap::new()),
            lingering: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            users: AtomicUsize::new(1),
            shutdown,
        });

        runtime.spawn(send_loop(
            Arc::clone(&socket),
            outbound_rx,
            shutdown_rx.clone(),
        ));
        runtime.spawn(recv_loop(
            Arc::clone(&endpoint),
            socket,
            shared.config.recv_buffer_size,
            shutdown_rx.clone(),
        ));
        runtime.spawn(tick_loop(
            Arc::clone(&endpoint),
            shared.config.tick_interval,
            shutdown_rx,
        ));

        debug!(%local_addr, "endpoint opened");
        Ok(endpoint)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take another reference for a socket sharing this endpoint.
    pub(crate) fn acquire(self: &Arc<Self>) -> Arc<Self> {
        self.users.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    /// Drop a reference; the last one stops the engine tasks.
    pub(crate) fn release(&self) {
        if self.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(local_addr = %self.local_addr, "endpoint closing");
            self.routes.lock().clear();
            self.handshakes.lock().clear();
            *self.listener.lock() = None;
            self.shutdown.send_replace(true);
        }
    }

    pub(crate) fn send(&self, packet: &Packet, to: SocketAddr) {
        // Fails only once the send loop is gone, when nothing is deliverable.
        let _ = self.outbound.send((packet.encode(), to));
    }

    pub(crate) fn register(&self, core: &Arc<SocketCore>) {
        self.routes.lock().insert(core.id(), Arc::clone(core));
    }

    pub(crate) fn deregister(&self, id: SocketId) {
        self.routes.lock().remove(&id);
        let retired = Admission::Retired {
            until: Instant::now() + HANDSHAKE_MEMORY,
        };
        for admission in self.handshakes.lock().values_mut() {
            if *admission == Admission::Live(id) {
                *admission = retired;
            }
        }
    }

    /// Keep the connection of closed socket `id` running until its data is
    /// acknowledged or `deadline` passes.
    ///
    /// Takes over the socket's endpoint reference; `id` must already be
    /// deregistered.
    pub(crate) fn linger(&self, id: SocketId, mut conn: Connection, deadline: Instant) {
        let peer = conn.peer_addr();
        if let Some(notice) = conn.shutdown(Instant::now()) {
            self.send(&notice, peer);
        }
        if conn.is_drained() {
            self.release();
            return;
        }
        debug!(%id, %peer, unacknowledged = conn.unacknowledged(), "lingering to deliver queued data");
        self.lingering
            .lock()
            .insert(id, Lingering { conn, deadline });
    }

    fn on_lingering_packet(&self, id: SocketId, packet: Packet, from: SocketAddr) {
        let finished = {
            let mut lingering = self.lingering.lock();
            let Some(entry) = lingering.get_mut(&id) else {
                trace!(%from, dest = %id, "no socket for datagram");
                return;
            };
            let peer = entry.conn.peer_addr();
            if from != peer {
                return;
            }
            for reply in entry.conn.on_packet(packet, Instant::now()) {
                self.send(&reply, peer);
            }
            if entry.conn.is_drained() {
                lingering.remove(&id)
            } else {
                None
            }
        };
        if let Some(entry) = finished {
            self.finish_linger(id, entry);
        }
    }

    fn finish_linger(&self, id: SocketId, mut entry: Lingering) {
        let peer = entry.conn.peer_addr();
        if entry.conn.phase() != ConnectionPhase::Connected {
            debug!(%id, %peer, "connection ended while lingering");
        } else if entry.conn.unacknowledged() == 0 {
            // Repeat the notice in case the first one was lost.
            if let Some(notice) = entry.conn.shutdown(Instant::now()) {
                self.send(&notice, peer);
            }
            debug!(%id, %peer, "linger complete");
        } else {
            warn!(%id, %peer, unacknowledged = entry.conn.unacknowledged(), "linger expired, dropping undelivered data");
        }
        self.release();
    }

    /// Install the listener; fails if another live listener holds it.
    pub(crate) fn set_listener(&self, core: &Arc<SocketCore>) -> bool {
        let mut listener = self.listener.lock();
        if listener.as_ref().and_then(Weak::upgrade).is_some() {
            return false;
        }
        *listener = Some(Arc::downgrade(core));
        true
    }

    pub(crate) fn clear_listener(&self, id: SocketId) {
        let mut listener = self.listener.lock();
        let owned = listener
            .as_ref()
            .and_then(Weak::upgrade)
            .is_none_or(|core| core.id() == id);
        if owned {
            *listener = None;
        }
    }

    fn dispatch(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed datagram");
                return;
            }
        };

        match packet {
            Packet::Handshake {
                src,
                version,
                stream_id,
            } => self.on_handshake(from, src, version, stream_id),
            packet => {
                let dest = packet.header().dest;
                let core = self.routes.lock().get(&dest).cloned();
                match core {
                    Some(core) => core.on_packet(packet, from),
                    None => self.on_lingering_packet(dest, packet, from),
                }
            }
        }
    }

    fn on_handshake(
        self: &Arc<Self>,
        from: SocketAddr,
        peer_id: SocketId,
        version: u16,
        stream_id: Option<String>,
    ) {
        let admitted = self.handshakes.lock().get(&(from, peer_id)).copied();
        match admitted {
            Some(Admission::Live(local)) => {
                // Our acknowledgement was lost; answer the retry.
                let core = self.routes.lock().get(&local).cloned();
                if let Some(core) = core {
                    core.resend_handshake_ack();
                }
                return;
            }
            Some(Admission::Retired { .. }) => {
                trace!(%from, peer = %peer_id, "late handshake for a closed connection");
                return;
            }
            None => {}
        }

        let reject = |reason: RejectReason| {
            debug!(%from, peer = %peer_id, reason = reason.describe(), "connection rejected");
            self.send(
                &Packet::Reject {
                    dest: peer_id,
                    reason,
                },
                from,
            );
        };

        let oversized = stream_id
            .as_ref()
            .is_some_and(|id| id.len() > MAX_STREAM_ID_LEN);
        if version != PROTOCOL_VERSION || peer_id.is_none() || oversized {
            reject(RejectReason::BadRequest);
            return;
        }

        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        let Some(listener) = listener else {
            reject(RejectReason::NoListener);
            return;
        };

        match listener.admit(self, from, peer_id, stream_id) {
            Ok(core) => {
                self.handshakes
                    .lock()
                    .insert((from, peer_id), Admission::Live(core.id()));
                core.resend_handshake_ack();
            }
            Err(reason) => reject(reason),
        }
    }

    fn tick(&self, now: Instant) {
        let cores: Vec<Arc<SocketCore>> = self.routes.lock().values().cloned().collect();
        for core in cores {
            core.on_tick(now);
        }

        let finished: Vec<(SocketId, Lingering)> = {
            let mut lingering = self.lingering.lock();
            for entry in lingering.values_mut() {
                let peer = entry.conn.peer_addr();
                for packet in entry.conn.on_tick(now) {
                    self.send(&packet, peer);
                }
            }
            let done: Vec<SocketId> = lingering
                .iter()
                .filter(|(_, entry)| entry.conn.is_drained() || now >= entry.deadline)
                .map(|(id, _)| *id)
                .collect();
            done.into_iter()
                .filter_map(|id| lingering.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        for (id, entry) in finished {
            self.finish_linger(id, entry);
        }

        self.handshakes.lock().retain(|_, admission| match admission {
            Admission::Retired { until } => *until > now,
            Admission::Live(_) => true,
        });
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Flush what was queued before the close, shutdown notices
                // in particular.
                while let Ok((datagram, to)) = outbound.try_recv() {
                    let _ = socket.send_to(&datagram, to).await;
                }
                break;
            }
            next = outbound.recv() => match next {
                Some((datagram, to)) => {
                    if let Err(e) = socket.send_to(&datagram, to).await {
                        warn!(%to, error = %e, "UDP send failed");
                    }
                }
                None => break,
            }
        }
    }
}

async fn recv_loop(
    endpoint: Arc<Endpoint>,
    socket: Arc<UdpSocket>,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => endpoint.dispatch(&buf[..len], from),
                Err(e) if is_transient(&e) => {
                    trace!(error = %e, "transient receive error");
                }
                Err(e) => {
                    warn!(local_addr = %endpoint.local_addr, error = %e, "UDP receive failed");
                    break;
                }
            }
        }
    }
    debug!(local_addr = %endpoint.local_addr, "receive loop stopped");
}

async fn tick_loop(endpoint: Arc<Endpoint>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => endpoint.tick(Instant::now()),
        }
    }
}

/// ICMP feedback surfaces as receive errors on some platforms.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_handshake_without_listener_is_rejected() {
        let context = crate::Context::new().unwrap();
        let server = context.socket().unwrap();
        server.bind("127.0.0.1", 0).unwrap();
        let port = server.local_addr().unwrap().port();

        let client = context
            .socket_with(
                crate::SocketOptions::new().connect_timeout(Duration::from_secs(2)),
            )
            .unwrap();
        let result = client.connect("127.0.0.1", port);
        match result {
            Err(crate::SrtError::ConnectFailed(reason)) => {
                assert!(reason.contains("no listener"), "{reason}");
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_late_handshake_after_close_is_ignored() {
        let context = crate::Context::new().unwrap();
        let (server, _port) = crate::socket::testing::listener(&context);
        server.set_read_sync(false);
        let endpoint = server.core().endpoint().unwrap();

        let caller = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let from = caller.local_addr().unwrap();
        let peer_id = SocketId::new(4242);

        endpoint.on_handshake(from, peer_id, PROTOCOL_VERSION, None);
        let accepted = server.accept().unwrap();
        assert_eq!(
            endpoint.handshakes.lock().get(&(from, peer_id)),
            Some(&Admission::Live(accepted.id()))
        );
        accepted.close().unwrap();

        endpoint.on_handshake(from, peer_id, PROTOCOL_VERSION, None);
        assert!(matches!(server.accept(), Err(crate::SrtError::WouldBlock)));
        assert!(matches!(
            endpoint.handshakes.lock().get(&(from, peer_id)),
            Some(Admission::Retired { .. })
        ));
    }

    #[test]
    fn test_retired_handshakes_are_pruned() {
        let context = crate::Context::new().unwrap();
        let (server, _port) = crate::socket::testing::listener(&context);
        let endpoint = server.core().endpoint().unwrap();
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let now = Instant::now();

        endpoint.handshakes.lock().insert(
            (from, SocketId::new(7)),
            Admission::Retired { until: now },
        );
        endpoint.tick(now + Duration::from_millis(1));
        assert!(endpoint.handshakes.lock().is_empty());
    }
}
