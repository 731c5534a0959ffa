//! Datagram transport engine.
//!
//! A [`Context`] owns a tokio runtime. Every bound socket address gets an
//! endpoint running the UDP tasks; connection logic itself is sans-I/O and
//! driven from those tasks and from user threads.

mod connection;
mod context;
mod pacing;
pub(crate) mod endpoint;
pub(crate) mod packet;
mod signal;
mod timing;

pub(crate) use connection::{Connection, ConnectionPhase, ConnectionSettings};
pub(crate) use context::Shared;
pub use context::{Context, ContextBuilder, EngineConfig};
pub use packet::SocketId;
