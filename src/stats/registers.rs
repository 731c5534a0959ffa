//! Counter registers kept by every connection.

use std::time::{Duration, Instant};

/// One family of monotonically increasing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub pkt_sent: u64,
    pub pkt_recv: u64,
    pub pkt_snd_loss: u64,
    pub pkt_rcv_loss: u64,
    pub pkt_retrans: u64,
    pub pkt_rcv_retrans: u64,
    pub pkt_sent_ack: u64,
    pub pkt_recv_ack: u64,
    pub pkt_sent_nak: u64,
    pub pkt_recv_nak: u64,
    pub pkt_snd_drop: u64,
    pub pkt_rcv_drop: u64,
    pub pkt_rcv_undecrypt: u64,
    pub pkt_snd_filter_extra: u64,
    pub pkt_rcv_filter_extra: u64,
    pub pkt_rcv_filter_supply: u64,
    pub pkt_rcv_filter_loss: u64,
    pub pkt_rcv_belated: u64,
    pub byte_sent: u64,
    pub byte_recv: u64,
    pub byte_rcv_loss: u64,
    pub byte_retrans: u64,
    pub byte_snd_drop: u64,
    pub byte_rcv_drop: u64,
    pub byte_rcv_undecrypt: u64,
    pub us_snd_duration: u64,
}

/// Total and interval counter families.
///
/// Every event is recorded in both; only the interval family is ever reset.
#[derive(Debug, Clone)]
pub(crate) struct Registers {
    pub total: Counters,
    pub interval: Counters,
    pub started: Instant,
    pub interval_started: Instant,
    pub reorder_distance: u64,
}

impl Registers {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            total: Counters::default(),
            interval: Counters::default(),
            started: now,
            interval_started: now,
            reorder_distance: 0,
        }
    }

    fn record(&mut self, apply: impl Fn(&mut Counters)) {
        apply(&mut self.total);
        apply(&mut self.interval);
    }

    pub(crate) fn data_sent(&mut self, bytes: usize) {
        self.record(|c| {
            c.pkt_sent += 1;
            c.byte_sent += bytes as u64;
        });
    }

    pub(crate) fn data_retransmitted(&mut self, bytes: usize) {
        self.record(|c| {
            c.pkt_sent += 1;
            c.byte_sent += bytes as u64;
            c.pkt_retrans += 1;
            c.byte_retrans += bytes as u64;
        });
    }

    pub(crate) fn data_received(&mut self, bytes: usize, retransmitted: bool) {
        self.record(|c| {
            c.pkt_recv += 1;
            c.byte_recv += bytes as u64;
            if retransmitted {
                c.pkt_rcv_retrans += 1;
            }
        });
    }

    pub(crate) fn belated(&mut self) {
        self.record(|c| c.pkt_rcv_belated += 1);
    }

    pub(crate) fn receive_loss(&mut self, packets: u64, estimated_bytes: u64) {
        self.record(|c| {
            c.pkt_rcv_loss += packets;
            c.byte_rcv_loss += estimated_bytes;
        });
    }

    pub(crate) fn send_loss(&mut self, packets: u64) {
        self.record(|c| c.pkt_snd_loss += packets);
    }

    pub(crate) fn ack_sent(&mut self) {
        self.record(|c| c.pkt_sent_ack += 1);
    }

    pub(crate) fn ack_received(&mut self) {
        self.record(|c| c.pkt_recv_ack += 1);
    }

    pub(crate) fn nak_sent(&mut self) {
        self.record(|c| c.pkt_sent_nak += 1);
    }

    pub(crate) fn nak_received(&mut self) {
        self.record(|c| c.pkt_recv_nak += 1);
    }

    pub(crate) fn sending_for(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.record(|c| c.us_snd_duration += us);
    }

    pub(crate) fn reordered(&mut self, distance: u64) {
        self.reorder_distance = self.reorder_distance.max(distance);
    }

    pub(crate) fn clear_interval(&mut self, now: Instant) {
        self.interval = Counters::default();
        self.interval_started = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_hit_both_families() {
        let mut registers = Registers::new(Instant::now());
        registers.data_sent(100);
        registers.data_retransmitted(100);
        registers.ack_received();

        assert_eq!(registers.total.pkt_sent, 2);
        assert_eq!(registers.total.byte_sent, 200);
        assert_eq!(registers.total.pkt_retrans, 1);
        assert_eq!(registers.interval, registers.total);
    }

    #[test]
    fn test_clear_interval_keeps_totals() {
        let start = Instant::now();
        let mut registers = Registers::new(start);
        registers.data_received(16, false);
        registers.data_received(16, true);

        let later = start + Duration::from_millis(5);
        registers.clear_interval(later);

        assert_eq!(registers.interval, Counters::default());
        assert_eq!(registers.total.pkt_recv, 2);
        assert_eq!(registers.total.pkt_rcv_retrans, 1);
        assert_eq!(registers.interval_started, later);
    }
}
