//! Sockets: creation, connection setup, data transfer and options.

pub(crate) mod core;
mod handle;
mod options;
mod state;
#[cfg(test)]
pub(crate) mod testing;

pub use handle::{IntoPort, SocketHandle};
pub use options::{SocketOptions, TransmissionMode};
pub use state::{ConnectionRequest, SocketState};
