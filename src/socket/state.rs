//! Public socket state and connection requests.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::streamid::StreamIdComponents;

/// Lifecycle state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created, not bound.
    Created,
    /// Bound to a local address.
    Bound,
    /// Accepting connections.
    Listening,
    /// Connection request sent, no answer yet.
    Connecting,
    /// Data transfer possible.
    Connected,
    /// The connection failed or the peer closed it.
    Broken,
    /// Closed locally.
    Closed,
}

impl SocketState {
    /// Lower-case name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Broken => "broken",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incoming connection request, as seen by a listener's accept filter.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Address of the caller.
    pub peer_addr: SocketAddr,
    /// Stream id sent by the caller.
    pub stream_id: Option<String>,
}

impl ConnectionRequest {
    /// Decoded stream id; defaults when the caller sent none.
    pub fn stream_id_components(&self) -> StreamIdComponents {
        StreamIdComponents::decode(self.stream_id.as_deref().unwrap_or_default())
    }
}

pub(crate) type AcceptFilter = Arc<dyn Fn(&ConnectionRequest) -> bool + Send + Sync>;
