//! Readiness multiplexing over many sockets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::Interest;
use crate::core::{SrtError, SrtResult};
use crate::engine::{Context, SocketId};
use crate::socket::SocketHandle;
use crate::socket::core::SocketCore;

/// Sockets found ready by [`PollSet::wait`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Sockets with data, a pending connection or end of stream.
    pub readable: HashSet<SocketId>,
    /// Sockets that accept writes.
    pub writable: HashSet<SocketId>,
    /// Sockets whose connection broke.
    pub errored: HashSet<SocketId>,
}

impl Readiness {
    /// Whether nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.errored.is_empty()
    }

    /// Conditions reported for `id`.
    pub fn get(&self, id: SocketId) -> Interest {
        let mut ready = Interest::NONE;
        if self.readable.contains(&id) {
            ready |= Interest::READABLE;
        }
        if self.writable.contains(&id) {
            ready |= Interest::WRITABLE;
        }
        if self.errored.contains(&id) {
            ready |= Interest::ERROR;
        }
        ready
    }

    fn insert(&mut self, id: SocketId, ready: Interest) {
        if ready.is_readable() {
            self.readable.insert(id);
        }
        if ready.is_writable() {
            self.writable.insert(id);
        }
        if ready.is_error() {
            self.errored.insert(id);
        }
    }

    fn retain(&mut self, keep: impl Fn(&SocketId) -> bool) {
        self.readable.retain(&keep);
        self.writable.retain(&keep);
        self.errored.retain(&keep);
    }
}

struct Registration {
    interest: Interest,
    core: Arc<SocketCore>,
}

/// A set of sockets watched for readiness.
///
/// Registrations may be changed from other threads while a wait is in
/// progress; sockets removed during the wait are not reported. Closed
/// sockets are dropped from the set automatically, and their removal
/// wakes the wait.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use srt_session::{Context, Interest};
///
/// # fn main() -> srt_session::SrtResult<()> {
/// let context = Context::new()?;
/// let listener = context.socket()?;
/// listener.bind("0.0.0.0", 9000)?;
/// listener.listen(5)?;
///
/// let poll = context.poll_set();
/// poll.add(&listener, Interest::READABLE)?;
/// let ready = poll.wait(Some(Duration::from_secs(1)))?;
/// if ready.readable.contains(&listener.id()) {
///     let _connection = listener.accept()?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct PollSet {
    context: Context,
    registrations: Mutex<HashMap<SocketId, Registration>>,
    generation: AtomicU64,
}

impl PollSet {
    /// Empty set bound to `context`.
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            registrations: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Watch `socket` for `interest`, replacing an existing registration.
    pub fn add(&self, socket: &SocketHandle, interest: Interest) -> SrtResult<()> {
        if !self.context.same_as(socket.context()) {
            return Err(SrtError::InvalidArgument(
                "socket belongs to another context".to_string(),
            ));
        }
        if socket.core().is_closed() {
            return Err(SrtError::Closed);
        }
        self.registrations.lock().insert(
            socket.id(),
            Registration {
                interest,
                core: Arc::clone(socket.core()),
            },
        );
        self.changed();
        Ok(())
    }

    /// Change the interest of `socket`; adds it when absent.
    pub fn update(&self, socket: &SocketHandle, interest: Interest) -> SrtResult<()> {
        self.add(socket, interest)
    }

    /// [`add`](Self::add) with interest given as tokens (`in`, `out`,
    /// `err`).
    pub fn add_tokens<I, S>(&self, socket: &SocketHandle, tokens: I) -> SrtResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add(socket, Interest::from_tokens(tokens)?)
    }

    /// [`update`](Self::update) with interest given as tokens.
    pub fn update_tokens<I, S>(&self, socket: &SocketHandle, tokens: I) -> SrtResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.update(socket, Interest::from_tokens(tokens)?)
    }

    /// Stop watching `socket`. Removing an absent socket is a no-op.
    pub fn remove(&self, socket: &SocketHandle) -> SrtResult<()> {
        if self.registrations.lock().remove(&socket.id()).is_some() {
            self.changed();
        }
        Ok(())
    }

    /// Whether `socket` is registered.
    pub fn contains(&self, socket: &SocketHandle) -> bool {
        self.registrations.lock().contains_key(&socket.id())
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Whether no socket is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until a registered socket is ready.
    ///
    /// `None` waits indefinitely; on timeout the result is empty. An
    /// indefinite wait on an empty set fails with
    /// [`SrtError::PollFailed`], as does any wait after the context shut
    /// down.
    pub fn wait(&self, timeout: Option<Duration>) -> SrtResult<Readiness> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let signal = &self.context.shared().signal;

        loop {
            let seen = signal.generation();
            if !self.context.is_running() {
                return Err(SrtError::PollFailed(
                    "transport context has shut down".to_string(),
                ));
            }

            let scan = self.scan();
            if !scan.ready.is_empty() || scan.pruned {
                return Ok(scan.ready);
            }
            if scan.registered == 0 && deadline.is_none() {
                return Err(SrtError::PollFailed(
                    "no sockets registered for an unbounded wait".to_string(),
                ));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(scan.ready);
            }
            signal.wait_for_change(seen, deadline);
        }
    }

    /// [`wait`](Self::wait) with a millisecond timeout; negative waits
    /// indefinitely.
    pub fn wait_millis(&self, timeout_ms: i64) -> SrtResult<Readiness> {
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        self.wait(timeout)
    }

    /// [`wait`](Self::wait), handing the readable, writable and errored
    /// sets to `handler`.
    pub fn wait_with<F, R>(&self, timeout: Option<Duration>, handler: F) -> SrtResult<R>
    where
        F: FnOnce(&HashSet<SocketId>, &HashSet<SocketId>, &HashSet<SocketId>) -> R,
    {
        let ready = self.wait(timeout)?;
        Ok(handler(&ready.readable, &ready.writable, &ready.errored))
    }

    fn changed(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.context.shared().signal.notify();
    }

    fn scan(&self) -> Scan {
        let before = self.generation.load(Ordering::Acquire);
        let entries: Vec<(SocketId, Interest, Arc<SocketCore>)> = self
            .registrations
            .lock()
            .iter()
            .map(|(id, registration)| (*id, registration.interest, Arc::clone(&registration.core)))
            .collect();

        let mut ready = Readiness::default();
        let mut closed = Vec::new();
        for (id, interest, core) in &entries {
            if core.is_closed() {
                closed.push(*id);
                continue;
            }
            ready.insert(*id, core.readiness() & *interest);
        }

        let mut registrations = self.registrations.lock();
        for id in &closed {
            let gone = registrations
                .get(id)
                .is_some_and(|registration| registration.core.is_closed());
            if gone {
                trace!(%id, "dropping closed socket from poll set");
                registrations.remove(id);
            }
        }
        if self.generation.load(Ordering::Acquire) != before {
            ready.retain(|id| registrations.contains_key(id));
        }

        Scan {
            ready,
            pruned: !closed.is_empty(),
            registered: registrations.len(),
        }
    }
}

struct Scan {
    ready: Readiness,
    pruned: bool,
    registered: usize,
}

impl std::fmt::Debug for PollSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSet")
            .field("sockets", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::{connected_pair, listener};
    use std::thread;

    #[test]
    fn test_listener_readable_after_connect() {
        let context = Context::new().unwrap();
        let (server, port) = listener(&context);
        let poll = context.poll_set();
        poll.add(&server, Interest::READABLE).unwrap();

        let ready = poll.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(ready.is_empty());

        let client = context.socket().unwrap();
        client.connect("127.0.0.1", port).unwrap();

        let ready = poll.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(ready.readable.len(), 1);
        assert!(ready.readable.contains(&server.id()));
        assert!(ready.writable.is_empty());
        assert!(ready.errored.is_empty());
        assert_eq!(ready.get(server.id()), Interest::READABLE);
    }

    #[test]
    fn test_accepted_readable_after_write() {
        let context = Context::new().unwrap();
        let (server, client, accepted) = connected_pair(&context);
        let poll = context.poll_set();
        poll.add_tokens(&server, ["in"]).unwrap();
        poll.add_tokens(&accepted, ["in", "err"]).unwrap();

        client.send_message(b"data from client").unwrap();
        let ready = poll.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(ready.readable.contains(&accepted.id()));
        assert!(!ready.readable.contains(&server.id()));
        assert!(ready.errored.is_empty());
        assert_eq!(
            accepted.receive_message().unwrap().unwrap(),
            b"data from client"
        );
    }

    #[test]
    fn test_writable_when_connected() {
        let context = Context::new().unwrap();
        let (_server, client, _accepted) = connected_pair(&context);
        let poll = context.poll_set();
        poll.add(&client, Interest::ALL).unwrap();

        let ready = poll.wait_millis(1000).unwrap();
        assert!(ready.writable.contains(&client.id()));
        assert!(!ready.readable.contains(&client.id()));
    }

    #[test]
    fn test_removed_socket_not_reported() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);
        let poll = context.poll_set();
        poll.add(&accepted, Interest::READABLE).unwrap();
        poll.remove(&accepted).unwrap();
        poll.remove(&accepted).unwrap();
        assert!(poll.is_empty());

        client.send_message(b"ignored").unwrap();
        let ready = poll.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_update_adds_and_replaces() {
        let context = Context::new().unwrap();
        let (_server, client, _accepted) = connected_pair(&context);
        let poll = context.poll_set();

        poll.update(&client, Interest::READABLE).unwrap();
        assert!(poll.contains(&client));
        let ready = poll.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(ready.is_empty());

        poll.update(&client, Interest::WRITABLE).unwrap();
        assert_eq!(poll.len(), 1);
        let ready = poll.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(ready.writable.contains(&client.id()));
    }

    #[test]
    fn test_empty_unbounded_wait_fails() {
        let context = Context::new().unwrap();
        let poll = context.poll_set();
        assert!(matches!(poll.wait(None), Err(SrtError::PollFailed(_))));
        assert!(matches!(poll.wait_millis(-1), Err(SrtError::PollFailed(_))));
        assert!(poll.wait(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn test_add_closed_or_foreign_socket() {
        let context = Context::new().unwrap();
        let other = Context::new().unwrap();
        let poll = context.poll_set();

        let foreign = other.socket().unwrap();
        assert!(matches!(
            poll.add(&foreign, Interest::READABLE),
            Err(SrtError::InvalidArgument(_))
        ));

        let closed = context.socket().unwrap();
        closed.close().unwrap();
        assert!(matches!(poll.add(&closed, Interest::READABLE), Err(SrtError::Closed)));
    }

    #[test]
    fn test_close_wakes_wait() {
        let context = Context::new().unwrap();
        let (server, _port) = listener(&context);
        let poll = Arc::new(context.poll_set());
        poll.add(&server, Interest::READABLE).unwrap();

        let waiter = {
            let poll = Arc::clone(&poll);
            thread::spawn(move || poll.wait(None))
        };
        thread::sleep(Duration::from_millis(50));
        server.close().unwrap();

        let ready = waiter.join().unwrap().unwrap();
        assert!(ready.is_empty());
        assert!(poll.is_empty());
    }

    #[test]
    fn test_add_during_wait_wakes_waiter() {
        let context = Context::new().unwrap();
        let (server, client, _accepted) = connected_pair(&context);
        let poll = Arc::new(context.poll_set());
        poll.add(&server, Interest::READABLE).unwrap();

        let waiter = {
            let poll = Arc::clone(&poll);
            thread::spawn(move || poll.wait(None))
        };
        thread::sleep(Duration::from_millis(50));
        poll.add(&client, Interest::WRITABLE).unwrap();

        let ready = waiter.join().unwrap().unwrap();
        assert!(ready.writable.contains(&client.id()));
        assert!(ready.readable.is_empty());
    }

    #[test]
    fn test_remove_during_wait_excludes_socket() {
        let context = Context::new().unwrap();
        let (server, client, accepted) = connected_pair(&context);
        let poll = Arc::new(context.poll_set());
        poll.add(&server, Interest::READABLE).unwrap();
        poll.add(&accepted, Interest::READABLE).unwrap();

        let waiter = {
            let poll = Arc::clone(&poll);
            thread::spawn(move || poll.wait(Some(Duration::from_millis(500))))
        };
        thread::sleep(Duration::from_millis(50));
        poll.remove(&accepted).unwrap();
        client.send_message(b"after removal").unwrap();

        let ready = waiter.join().unwrap().unwrap();
        assert!(!ready.readable.contains(&accepted.id()));
        assert!(ready.is_empty());

        let later = poll.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(later.is_empty());
        assert!(!poll.contains(&accepted));
        assert_eq!(
            accepted.receive_message().unwrap().unwrap(),
            b"after removal"
        );
    }

    #[test]
    fn test_shutdown_fails_wait() {
        let context = Context::new().unwrap();
        let (server, _port) = listener(&context);
        let poll = context.poll_set();
        poll.add(&server, Interest::READABLE).unwrap();
        context.shutdown();
        assert!(matches!(
            poll.wait(Some(Duration::from_millis(10))),
            Err(SrtError::PollFailed(_))
        ));
    }

    #[test]
    fn test_peer_close_reported_readable() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);
        let poll = context.poll_set();
        poll.add(&accepted, Interest::READABLE | Interest::ERROR).unwrap();

        client.close().unwrap();
        let ready = poll.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(ready.readable.contains(&accepted.id()));
        assert_eq!(accepted.receive_message().unwrap(), None);
    }

    #[test]
    fn test_wait_with_handler() {
        let context = Context::new().unwrap();
        let (_server, client, _accepted) = connected_pair(&context);
        let poll = context.poll_set();
        poll.add(&client, Interest::WRITABLE).unwrap();

        let writable = poll
            .wait_with(Some(Duration::from_secs(1)), |_, writable, _| {
                writable.len()
            })
            .unwrap();
        assert_eq!(writable, 1);
    }
}
