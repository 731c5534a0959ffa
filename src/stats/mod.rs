//! Live connection statistics.

pub(crate) mod registers;
pub(crate) mod snapshot;

pub use snapshot::{StatValue, StatsSnapshot};

use crate::core::SrtResult;
use crate::socket::SocketHandle;

impl StatsSnapshot {
    /// Capture the statistics of `socket`; `clear` resets its interval
    /// counters after the capture.
    ///
    /// Fails with [`SrtError::Closed`](crate::SrtError::Closed) on a closed
    /// socket. A socket without a connection yields zeroed counters.
    pub fn capture(socket: &SocketHandle, clear: bool) -> SrtResult<Self> {
        socket.stats(clear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::connected_pair;
    use crate::{Context, SrtError};

    #[test]
    fn test_counts_sent_messages() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);

        let message = vec![0x5au8; 1000];
        for _ in 0..10 {
            client.send_message(&message).unwrap();
        }
        for _ in 0..10 {
            accepted.receive_message().unwrap().unwrap();
        }

        let sent = StatsSnapshot::capture(&client, false).unwrap();
        assert!(sent.pkt_sent_total >= 10);
        assert!(sent.byte_sent_total >= 10 * 1000);
        assert!(sent.ms_time_stamp >= 0);

        let received = StatsSnapshot::capture(&accepted, false).unwrap();
        assert!(received.pkt_recv_total >= 10);
        assert!(received.byte_recv_total >= 10 * 1000);
        assert_eq!(
            received.get("pktRecvTotal"),
            Some(StatValue::Int(received.pkt_recv_total))
        );
    }

    #[test]
    fn test_clear_resets_interval() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);

        client.send_message(b"interval").unwrap();
        accepted.receive_message().unwrap().unwrap();

        let first = StatsSnapshot::capture(&client, true).unwrap();
        assert!(first.pkt_sent >= 1);

        let second = StatsSnapshot::capture(&client, false).unwrap();
        assert_eq!(second.pkt_sent, 0);
        assert_eq!(second.byte_sent, 0);
        assert!(second.pkt_sent_total >= 1);
    }

    #[test]
    fn test_interval_reflects_only_later_writes() {
        let context = Context::new().unwrap();
        let (_server, client, accepted) = connected_pair(&context);

        client.send_message(&[1u8; 300]).unwrap();
        let after_first = StatsSnapshot::capture(&client, true).unwrap();
        client.send_message(&[2u8; 500]).unwrap();
        accepted.receive_message().unwrap().unwrap();
        accepted.receive_message().unwrap().unwrap();

        let after_second = StatsSnapshot::capture(&client, false).unwrap();
        assert!(after_second.byte_sent_total >= after_first.byte_sent_total);
        assert!(after_second.byte_sent_total >= 800);
        // Retransmissions count in both, fresh payload only once.
        assert_eq!(after_second.byte_sent - after_second.byte_retrans, 500);
    }

    #[test]
    fn test_closed_socket() {
        let context = Context::new().unwrap();
        let socket = context.socket().unwrap();
        socket.close().unwrap();
        assert!(matches!(
            StatsSnapshot::capture(&socket, false),
            Err(SrtError::Closed)
        ));
    }
}
