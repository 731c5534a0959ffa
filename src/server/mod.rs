//! Poll-driven server built on sockets and poll sets.

mod connection;
#[allow(clippy::module_inception)]
mod server;

pub use connection::ServerConnection;
pub use server::{Server, ServerBuilder, ServerConfig};
