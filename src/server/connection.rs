//! Connection accepted by a [`Server`](super::Server).

use std::fmt;
use std::net::SocketAddr;

use crate::core::SrtResult;
use crate::engine::SocketId;
use crate::socket::SocketHandle;
use crate::streamid::StreamIdComponents;

type DataCallback = Box<dyn FnMut(&SocketHandle, &[u8]) + Send>;
type CloseCallback = Box<dyn FnMut(&SocketHandle) + Send>;

/// An accepted connection and its callbacks.
///
/// The server hands each new connection to the acceptor, which installs
/// callbacks and decides whether to keep it.
pub struct ServerConnection {
    socket: SocketHandle,
    on_data: Option<DataCallback>,
    on_close: Option<CloseCallback>,
}

impl ServerConnection {
    pub(crate) fn new(socket: SocketHandle) -> Self {
        Self {
            socket,
            on_data: None,
            on_close: None,
        }
    }

    /// Underlying socket.
    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    /// Socket id.
    pub fn id(&self) -> SocketId {
        self.socket.id()
    }

    /// Address of the caller.
    pub fn peer_addr(&self) -> SrtResult<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Stream id sent by the caller.
    pub fn stream_id(&self) -> Option<StreamIdComponents> {
        self.socket.stream_id_components()
    }

    /// Called with every message received.
    pub fn on_data<F>(&mut self, callback: F)
    where
        F: FnMut(&SocketHandle, &[u8]) + Send + 'static,
    {
        self.on_data = Some(Box::new(callback));
    }

    /// Called once when the connection ends.
    pub fn on_close<F>(&mut self, callback: F)
    where
        F: FnMut(&SocketHandle) + Send + 'static,
    {
        self.on_close = Some(Box::new(callback));
    }

    pub(crate) fn dispatch_data(&mut self, data: &[u8]) {
        if let Some(callback) = self.on_data.as_mut() {
            callback(&self.socket, data);
        }
    }

    pub(crate) fn dispatch_close(&mut self) {
        if let Some(mut callback) = self.on_close.take() {
            callback(&self.socket);
        }
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("socket", &self.socket)
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}
