//! Wakeup channel between the engine and blocked user threads.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Generation counter bumped on every readiness change.
///
/// Waiters read the generation before checking their condition and sleep
/// only while it is unchanged, so a notification between the check and the
/// sleep is never lost.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleep until the generation moves past `seen` or `deadline` passes.
    ///
    /// Returns `false` on timeout.
    pub(crate) fn wait_for_change(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut generation = self.generation.lock();
        while *generation == seen {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        return *generation != seen;
                    }
                }
                None => self.cond.wait(&mut generation),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_times_out() {
        let signal = Signal::new();
        let seen = signal.generation();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!signal.wait_for_change(seen, Some(deadline)));
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let signal = Signal::new();
        let seen = signal.generation();
        signal.notify();
        assert!(signal.wait_for_change(seen, None));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let seen = signal.generation();

        let notifier = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        assert!(signal.wait_for_change(seen, Some(Instant::now() + Duration::from_secs(5))));
        handle.join().unwrap();
    }
}
