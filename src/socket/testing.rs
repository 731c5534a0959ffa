//! Loopback fixtures for tests.

use crate::{Context, SocketHandle};

/// Blocking listener on an ephemeral loopback port.
pub(crate) fn listener(context: &Context) -> (SocketHandle, u16) {
    let server = context.socket().unwrap();
    server.bind("127.0.0.1", 0).unwrap();
    server.listen(8).unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

/// Listener, connected caller and the accepted side of the caller.
pub(crate) fn connected_pair(context: &Context) -> (SocketHandle, SocketHandle, SocketHandle) {
    let (server, port) = listener(context);
    let client = context.socket().unwrap();
    client.connect("127.0.0.1", port).unwrap();
    let accepted = server.accept().unwrap();
    (server, client, accepted)
}
