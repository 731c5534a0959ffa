//! # srt-session
//!
//! Session layer for a reliable, low-latency datagram transport in the
//! style of SRT.
//!
//! - **Sockets**: [`SocketHandle`] binds, listens, connects, accepts and
//!   moves data as messages or as a byte stream, blocking or not.
//! - **Polling**: [`PollSet`] waits on readiness of many sockets at once.
//! - **Statistics**: [`StatsSnapshot`] captures every live counter of a
//!   connection in one step.
//! - **Stream ids**: [`StreamIdComponents`] encodes and decodes the
//!   metadata a caller attaches to its connection request.
//!
//! All sockets belong to a [`Context`], which owns the engine threads.
//!
//! ## Feature Flags
//!
//! - `server` (default): poll-driven accept/read loop in [`server`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use srt_session::prelude::*;
//!
//! # fn main() -> SrtResult<()> {
//! let context = Context::new()?;
//!
//! let caller = context.socket()?;
//! caller.set_stream_id_components(
//!     &StreamIdComponents::new()
//!         .with_resource_name("live/cam1")
//!         .with_mode(StreamMode::Publish),
//! )?;
//! caller.connect("127.0.0.1", 9000)?;
//! caller.send_message(b"first frame")?;
//!
//! let stats = caller.stats(false)?;
//! println!("sent {} packets", stats.pkt_sent_total);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
mod engine;
pub mod poll;
pub mod socket;
pub mod stats;
pub mod streamid;

// Server loop (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{SrtError, SrtResult};
    pub use crate::engine::{Context, SocketId};
    pub use crate::poll::{Interest, PollSet, Readiness};
    pub use crate::socket::{SocketHandle, SocketOptions, SocketState, TransmissionMode};
    pub use crate::stats::{StatValue, StatsSnapshot};
    pub use crate::streamid::{StreamIdComponents, StreamMode, StreamType};

    #[cfg(feature = "server")]
    pub use crate::server::{Server, ServerConnection};
}

// Re-export commonly used items at crate root
pub use crate::core::{SrtError, SrtResult};
pub use engine::{Context, ContextBuilder, EngineConfig, SocketId};
pub use poll::{Interest, PollSet, Readiness};
pub use socket::{
    ConnectionRequest, IntoPort, SocketHandle, SocketOptions, SocketState, TransmissionMode,
};
pub use stats::{StatValue, StatsSnapshot};
pub use streamid::{StreamIdComponents, StreamMode, StreamType};
