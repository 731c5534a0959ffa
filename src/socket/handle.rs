//! User-facing socket handle.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use super::core::SocketCore;
use super::options::{SocketOptions, TransmissionMode};
use super::state::{ConnectionRequest, SocketState};
use crate::core::{SrtError, SrtResult};
use crate::engine::{Context, SocketId};
use crate::stats::StatsSnapshot;
use crate::streamid::StreamIdComponents;

/// Port argument accepted by [`SocketHandle::bind`] and
/// [`SocketHandle::connect`]: a number or its decimal text.
pub trait IntoPort {
    /// Convert to a port number.
    fn into_port(self) -> SrtResult<u16>;
}

impl IntoPort for u16 {
    fn into_port(self) -> SrtResult<u16> {
        Ok(self)
    }
}

impl IntoPort for &str {
    fn into_port(self) -> SrtResult<u16> {
        self.trim()
            .parse()
            .map_err(|_| SrtError::InvalidArgument(format!("invalid port {self:?}")))
    }
}

impl IntoPort for &String {
    fn into_port(self) -> SrtResult<u16> {
        self.as_str().into_port()
    }
}

impl IntoPort for String {
    fn into_port(self) -> SrtResult<u16> {
        self.as_str().into_port()
    }
}

/// A socket of the transport.
///
/// Listeners and callers are both `SocketHandle`s. Blocking behavior
/// follows the socket's `read_sync` / `write_sync` options; in non-blocking
/// mode calls that cannot complete return [`SrtError::WouldBlock`].
/// Dropping a handle closes the socket.
pub struct SocketHandle {
    context: Context,
    core: Arc<SocketCore>,
}

impl SocketHandle {
    /// Create a socket with default options.
    pub fn new(context: &Context) -> SrtResult<Self> {
        Self::with_options(context, SocketOptions::new())
    }

    /// Create a socket with the given options.
    pub fn with_options(context: &Context, options: SocketOptions) -> SrtResult<Self> {
        if !context.is_running() {
            return Err(SrtError::Shutdown);
        }
        Ok(Self {
            context: context.clone(),
            core: SocketCore::new(context.shared(), options),
        })
    }

    /// Identifier, unique within the context.
    pub fn id(&self) -> SocketId {
        self.core.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.core.state()
    }

    /// Bind to a local address. Port 0 picks a free port; an empty host
    /// binds every interface.
    pub fn bind(&self, host: &str, port: impl IntoPort) -> SrtResult<()> {
        let port = port.into_port().map_err(|e| SrtError::BindFailed(e.to_string()))?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let addrs = resolve(host, port).map_err(SrtError::BindFailed)?;
        self.core.bind(self.context.runtime()?, &addrs)
    }

    /// Start accepting connections, queueing up to `backlog` of them.
    pub fn listen(&self, backlog: usize) -> SrtResult<()> {
        self.core.listen(backlog)
    }

    /// Connect to a listener, trying each resolved address in turn.
    ///
    /// With `read_sync` set this blocks until the listener answers or the
    /// connect timeout passes. Otherwise it returns at once and the socket
    /// reports WRITABLE once connected.
    pub fn connect(&self, host: &str, port: impl IntoPort) -> SrtResult<()> {
        let port = port
            .into_port()
            .map_err(|e| SrtError::ConnectFailed(e.to_string()))?;
        let addrs = resolve(host, port).map_err(SrtError::ConnectFailed)?;
        let runtime = self.context.runtime()?;

        let mut last_error = None;
        for addr in addrs {
            match self.core.connect(runtime, addr) {
                Ok(()) => return Ok(()),
                Err(e @ SrtError::ConnectFailed(_)) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| SrtError::ConnectFailed(format!("no address for {host}:{port}"))))
    }

    /// Take the next pending connection.
    pub fn accept(&self) -> SrtResult<SocketHandle> {
        let core = self.core.accept()?;
        Ok(Self {
            context: self.context.clone(),
            core,
        })
    }

    /// Read up to `max_bytes` as a byte stream.
    ///
    /// Returns an empty buffer once the peer has closed and everything it
    /// sent has been read.
    pub fn read(&self, max_bytes: usize) -> SrtResult<Vec<u8>> {
        self.core.read(max_bytes)
    }

    /// Write `data`; returns the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> SrtResult<usize> {
        self.core.send(data, false)
    }

    /// Send `data` as one message, delivered whole to the peer.
    pub fn send_message(&self, data: &[u8]) -> SrtResult<usize> {
        self.core.send(data, true)
    }

    /// Receive the next message; `None` once the peer has closed.
    pub fn receive_message(&self) -> SrtResult<Option<Vec<u8>>> {
        self.core.receive_message()
    }

    /// Close the socket. Closing twice is harmless.
    pub fn close(&self) -> SrtResult<()> {
        self.core.close();
        Ok(())
    }

    /// Local address, once bound.
    pub fn local_addr(&self) -> SrtResult<SocketAddr> {
        self.core.local_addr()
    }

    /// Peer address, once connected or accepted.
    pub fn peer_addr(&self) -> SrtResult<SocketAddr> {
        self.core.peer_addr()
    }

    /// Stream id: the one configured on a caller, or the one received by
    /// an accepted socket.
    pub fn stream_id(&self) -> Option<String> {
        self.core
            .peer_stream_id()
            .or_else(|| self.core.options().stream_id)
    }

    /// Set the stream id sent on connect.
    pub fn set_stream_id(&self, stream_id: &str) -> SrtResult<()> {
        self.core.set_stream_id(Some(stream_id.to_string()))
    }

    /// Decoded stream id.
    pub fn stream_id_components(&self) -> Option<StreamIdComponents> {
        self.stream_id().map(|id| StreamIdComponents::decode(&id))
    }

    /// Set the stream id from components.
    pub fn set_stream_id_components(&self, components: &StreamIdComponents) -> SrtResult<()> {
        self.core.set_stream_id(Some(components.encode()))
    }

    /// Whether receiving calls block.
    pub fn read_sync(&self) -> bool {
        self.core.options().read_sync
    }

    /// Switch blocking mode of `accept`, `connect` and reads.
    pub fn set_read_sync(&self, blocking: bool) {
        self.core.set_read_sync(blocking);
    }

    /// Whether sends block on a full flow window.
    pub fn write_sync(&self) -> bool {
        self.core.options().write_sync
    }

    /// Switch blocking mode of sends.
    pub fn set_write_sync(&self, blocking: bool) {
        self.core.set_write_sync(blocking);
    }

    /// Transmission profile.
    pub fn transmission_mode(&self) -> TransmissionMode {
        self.core.options().transmission_mode
    }

    /// Change the transmission profile; only before connecting.
    pub fn set_transmission_mode(&self, mode: TransmissionMode) -> SrtResult<()> {
        self.core.configure(|options| {
            options.transmission_mode = mode;
            Ok(())
        })
    }

    /// Current options.
    pub fn options(&self) -> SocketOptions {
        self.core.options()
    }

    /// Install a filter deciding which connection requests a listener
    /// admits. Refused callers get a rejection during the handshake.
    pub fn set_accept_filter<F>(&self, filter: F)
    where
        F: Fn(&ConnectionRequest) -> bool + Send + Sync + 'static,
    {
        self.core.set_accept_filter(Some(Arc::new(filter)));
    }

    /// Remove the accept filter.
    pub fn clear_accept_filter(&self) {
        self.core.set_accept_filter(None);
    }

    /// Capture statistics; `clear` resets the interval counters.
    pub fn stats(&self, clear: bool) -> SrtResult<StatsSnapshot> {
        self.core.stats(clear)
    }

    /// Context owning this socket.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn core(&self) -> &Arc<SocketCore> {
        &self.core
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {host}:{port}: {e}"))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("no address for {host}:{port}"));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::{connected_pair, listener};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_into_port() {
        assert_eq!(9000u16.into_port().unwrap(), 9000);
        assert_eq!("9000".into_port().unwrap(), 9000);
        assert_eq!(String::from(" 80 ").into_port().unwrap(), 80);
        assert!("http".into_port().is_err());
        assert!("70000".into_port().is_err());
    }

    #[test]
    fn test_lifecycle_states() {
        let context = Context::new().unwrap();
        let socket = context.socket().unwrap();
        assert_eq!(socket.state(), SocketState::Created);
        assert!(socket.local_addr().is_err());

        socket.bind("127.0.0.1", 0).unwrap();
        assert_eq!(socket.state(), SocketState::Bound);
        assert_ne!(socket.local_addr().unwrap().port(), 0);

        socket.listen(2).unwrap();
        assert_eq!(socket.state(), SocketState::Listening);

        socket.close().unwrap();
        socket.close().unwrap();
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[test]
    fn test_misuse_errors() {
        let context = Context::new().unwrap();
        let socket = context.socket().unwrap();
        assert!(matches!(socket.listen(1), Err(SrtError::ListenFailed(_))));
        assert!(matches!(socket.accept(), Err(SrtError::AcceptFailed(_))));
        assert!(matches!(socket.read(10), Err(SrtError::ReadFailed(_))));
        assert!(matches!(socket.write(b"x"), Err(SrtError::WriteFailed(_))));
        assert!(matches!(socket.bind("127.0.0.1", "port"), Err(SrtError::BindFailed(_))));

        socket.bind("127.0.0.1", 0).unwrap();
        assert!(matches!(socket.bind("127.0.0.1", 0), Err(SrtError::BindFailed(_))));
        assert!(matches!(socket.listen(0), Err(SrtError::ListenFailed(_))));

        socket.close().unwrap();
        assert!(matches!(socket.read(10), Err(SrtError::Closed)));
        assert!(matches!(socket.write(b"x"), Err(SrtError::Closed)));
        assert!(matches!(socket.stats(false), Err(SrtError::Closed)));
    }

    #[test]
    fn test_bind_conflict() {
        let context = Context::new().unwrap();
        let first = context.socket().unwrap();
        first.bind("127.0.0.1", 0).unwrap();
        let port = first.local_addr().unwrap().port();

        let second = context.socket().unwrap();
        assert!(matches!(second.bind("127.0.0.1", port), Err(SrtError::BindFailed(_))));
    }

    #[test]
    fn test_connect_accept_and_stream_id() {
        let context = Context::new().unwrap();
        let (server, port) = listener(&context);

        let client = context.socket().unwrap();
        client.set_stream_id("#!::r=live/cam1,u=alice").unwrap();
        client.connect("127.0.0.1", port).unwrap();
        assert_eq!(client.state(), SocketState::Connected);
        assert!(matches!(client.set_stream_id("late"), Err(SrtError::InvalidArgument(_))));

        let accepted = server.accept().unwrap();
        assert_eq!(accepted.state(), SocketState::Connected);
        assert_eq!(
            accepted.peer_addr().unwrap().port(),
            client.local_addr().unwrap().port()
        );
        let components = accepted.stream_id_components().unwrap();
        assert_eq!(components.resource_name.as_deref(), Some("live/cam1"));
        assert_eq!(components.user_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_oversized_stream_id() {
        let context = Context::new().unwrap();
        let socket = context.socket().unwrap();
        assert!(matches!(
            socket.set_stream_id(&"x".repeat(513)),
            Err(SrtError::InvalidArgument(_))
        ));
        assert_eq!(socket.stream_id(), None);
    }

    #[test]
    fn test_messages_both_ways() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);

        let large = vec![7u8; 5000];
        client.send_message(&large).unwrap();
        client.send_message(b"second").unwrap();
        assert_eq!(accepted.receive_message().unwrap().unwrap(), large);
        assert_eq!(accepted.receive_message().unwrap().unwrap(), b"second");

        accepted.write(b"reply").unwrap();
        assert_eq!(client.read(1024).unwrap(), b"reply");
    }

    #[test]
    fn test_empty_write() {
        let context = Context::new().unwrap();
        let (_server, client, _accepted) = connected_pair(&context);
        assert_eq!(client.write(b"").unwrap(), 0);
    }

    #[test]
    fn test_peer_close_reads_eof() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);

        client.send_message(b"last words").unwrap();
        // Let the data be acknowledged before the shutdown goes out.
        assert_eq!(accepted.receive_message().unwrap().unwrap(), b"last words");
        client.close().unwrap();

        assert_eq!(accepted.receive_message().unwrap(), None);
        assert!(accepted.read(10).unwrap().is_empty());
        assert_eq!(accepted.state(), SocketState::Broken);
        assert!(matches!(accepted.write(b"x"), Err(SrtError::WriteFailed(_))));
    }

    #[test]
    fn test_close_delivers_unacknowledged_data() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);

        let payload = vec![9u8; 4 << 20];
        client.send_message(&payload).unwrap();
        client.close().unwrap();

        let received = accepted.receive_message().unwrap();
        assert_eq!(received.map(|message| message.len()), Some(payload.len()));
        assert_eq!(accepted.receive_message().unwrap(), None);
    }

    #[test]
    fn test_non_blocking_read() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);
        accepted.set_read_sync(false);
        assert!(matches!(accepted.read(10), Err(SrtError::WouldBlock)));

        client.write(b"ping").unwrap();
        let mut received = Vec::new();
        for _ in 0..200 {
            match accepted.read(10) {
                Ok(data) => {
                    received = data;
                    break;
                }
                Err(SrtError::WouldBlock) => thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(received, b"ping");
    }

    #[test]
    fn test_non_blocking_connect() {
        let context = Context::new().unwrap();
        let (server, port) = listener(&context);

        let client = context
            .socket_with(SocketOptions::new().read_sync(false))
            .unwrap();
        client.connect("127.0.0.1", port).unwrap();
        for _ in 0..200 {
            if client.state() == SocketState::Connected {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.state(), SocketState::Connected);

        server.set_read_sync(true);
        assert!(server.accept().is_ok());
    }

    #[test]
    fn test_accept_filter_refuses() {
        let context = Context::new().unwrap();
        let (server, port) = listener(&context);
        server.set_accept_filter(|request| {
            request.stream_id_components().user_name.as_deref() == Some("alice")
        });

        let mallory = context.socket().unwrap();
        mallory.set_stream_id("#!::u=mallory").unwrap();
        match mallory.connect("127.0.0.1", port) {
            Err(SrtError::ConnectFailed(reason)) => assert!(reason.contains("refused")),
            other => panic!("expected refusal, got {other:?}"),
        }

        let alice = context.socket().unwrap();
        alice.set_stream_id("#!::u=alice").unwrap();
        alice.connect("127.0.0.1", port).unwrap();
        assert_eq!(server.accept().unwrap().stream_id().as_deref(), Some("#!::u=alice"));
    }

    #[test]
    fn test_backlog_full() {
        let context = Context::new().unwrap();
        let server = context.socket().unwrap();
        server.bind("127.0.0.1", 0).unwrap();
        server.listen(1).unwrap();
        let port = server.local_addr().unwrap().port();

        let first = context.socket().unwrap();
        first.connect("127.0.0.1", port).unwrap();

        let second = context.socket().unwrap();
        match second.connect("127.0.0.1", port) {
            Err(SrtError::ConnectFailed(reason)) => assert!(reason.contains("backlog")),
            other => panic!("expected backlog rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_timeout() {
        let context = Context::new().unwrap();
        // A bound socket that never answers.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = context
            .socket_with(SocketOptions::new().connect_timeout(Duration::from_millis(300)))
            .unwrap();
        assert!(matches!(
            client.connect("127.0.0.1", port),
            Err(SrtError::ConnectFailed(_))
        ));
        assert_eq!(client.state(), SocketState::Bound);
    }

    #[test]
    fn test_close_unblocks_accept() {
        let context = Context::new().unwrap();
        let (server, _port) = listener(&context);
        let server = Arc::new(server);

        let waiter = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.accept().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        server.close().unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(SrtError::Closed)));
    }

    #[test]
    fn test_stats_unconnected() {
        let context = Context::new().unwrap();
        let socket = context.socket().unwrap();
        let stats = socket.stats(false).unwrap();
        assert_eq!(stats.pkt_sent_total, 0);
    }
}
