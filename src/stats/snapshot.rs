//! Immutable statistics snapshot.

use std::fmt;
use std::time::Instant;

use super::registers::Registers;

/// Value of a single counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    /// Integral counter or gauge.
    Int(i64),
    /// Rate or averaged gauge.
    Float(f64),
}

impl StatValue {
    /// Value as an integer; floats are truncated.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int(v) => v,
            Self::Float(v) => v as i64,
        }
    }

    /// Value as a float.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

impl From<i64> for StatValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for StatValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:.3}"),
        }
    }
}

macro_rules! stats_snapshot {
    ($($(#[doc = $doc:literal])* $field:ident: $ty:ty => $wire:literal,)*) => {
        /// Counters and gauges of one socket, captured in a single step.
        ///
        /// `*_total` counters cover the whole connection; the unsuffixed
        /// counters cover the interval since the last capture with `clear`.
        /// Byte counters count payload bytes. Every counter can also be
        /// looked up by its wire name through [`get`](Self::get).
        #[derive(Debug, Clone, Copy, PartialEq, Default)]
        pub struct StatsSnapshot {
            $($(#[doc = $doc])* pub $field: $ty,)*
        }

        impl StatsSnapshot {
            /// Wire names of every counter in declaration order.
            pub const COUNTER_NAMES: &'static [&'static str] = &[$($wire),*];

            /// Every counter with its wire name, in declaration order.
            pub fn entries(&self) -> Vec<(&'static str, StatValue)> {
                vec![$(($wire, StatValue::from(self.$field))),*]
            }
        }
    };
}

stats_snapshot! {
    /// Milliseconds since the socket connected.
    ms_time_stamp: i64 => "msTimeStamp",

    /// Data packets sent, retransmissions included.
    pkt_sent_total: i64 => "pktSentTotal",
    /// Data packets received.
    pkt_recv_total: i64 => "pktRecvTotal",
    /// Packets reported lost by the peer.
    pkt_snd_loss_total: i64 => "pktSndLossTotal",
    /// Packets detected missing on receive.
    pkt_rcv_loss_total: i64 => "pktRcvLossTotal",
    /// Packets retransmitted.
    pkt_retrans_total: i64 => "pktRetransTotal",
    /// Acknowledgements sent.
    pkt_sent_ack_total: i64 => "pktSentACKTotal",
    /// Acknowledgements received.
    pkt_recv_ack_total: i64 => "pktRecvACKTotal",
    /// Loss reports sent.
    pkt_sent_nak_total: i64 => "pktSentNAKTotal",
    /// Loss reports received.
    pkt_recv_nak_total: i64 => "pktRecvNAKTotal",
    /// Microseconds spent with data in flight.
    us_snd_duration_total: i64 => "usSndDurationTotal",
    /// Packets dropped by the sender.
    pkt_snd_drop_total: i64 => "pktSndDropTotal",
    /// Packets dropped by the receiver.
    pkt_rcv_drop_total: i64 => "pktRcvDropTotal",
    /// Packets that failed to decrypt.
    pkt_rcv_undecrypt_total: i64 => "pktRcvUndecryptTotal",
    /// Control packets added by the packet filter.
    pkt_snd_filter_extra_total: i64 => "pktSndFilterExtraTotal",
    /// Control packets received from the peer's packet filter.
    pkt_rcv_filter_extra_total: i64 => "pktRcvFilterExtraTotal",
    /// Packets recovered by the packet filter.
    pkt_rcv_filter_supply_total: i64 => "pktRcvFilterSupplyTotal",
    /// Packets the packet filter failed to recover.
    pkt_rcv_filter_loss_total: i64 => "pktRcvFilterLossTotal",
    /// Payload bytes sent, retransmissions included.
    byte_sent_total: i64 => "byteSentTotal",
    /// Payload bytes received.
    byte_recv_total: i64 => "byteRecvTotal",
    /// Estimated payload bytes lost on receive.
    byte_rcv_loss_total: i64 => "byteRcvLossTotal",
    /// Payload bytes retransmitted.
    byte_retrans_total: i64 => "byteRetransTotal",
    /// Payload bytes dropped by the sender.
    byte_snd_drop_total: i64 => "byteSndDropTotal",
    /// Payload bytes dropped by the receiver.
    byte_rcv_drop_total: i64 => "byteRcvDropTotal",
    /// Payload bytes that failed to decrypt.
    byte_rcv_undecrypt_total: i64 => "byteRcvUndecryptTotal",

    /// Data packets sent in the interval.
    pkt_sent: i64 => "pktSent",
    /// Data packets received in the interval.
    pkt_recv: i64 => "pktRecv",
    /// Packets reported lost by the peer in the interval.
    pkt_snd_loss: i64 => "pktSndLoss",
    /// Packets detected missing in the interval.
    pkt_rcv_loss: i64 => "pktRcvLoss",
    /// Packets retransmitted in the interval.
    pkt_retrans: i64 => "pktRetrans",
    /// Retransmitted packets received in the interval.
    pkt_rcv_retrans: i64 => "pktRcvRetrans",
    /// Acknowledgements sent in the interval.
    pkt_sent_ack: i64 => "pktSentACK",
    /// Acknowledgements received in the interval.
    pkt_recv_ack: i64 => "pktRecvACK",
    /// Loss reports sent in the interval.
    pkt_sent_nak: i64 => "pktSentNAK",
    /// Loss reports received in the interval.
    pkt_recv_nak: i64 => "pktRecvNAK",
    /// Filter control packets sent in the interval.
    pkt_snd_filter_extra: i64 => "pktSndFilterExtra",
    /// Filter control packets received in the interval.
    pkt_rcv_filter_extra: i64 => "pktRcvFilterExtra",
    /// Packets recovered by the filter in the interval.
    pkt_rcv_filter_supply: i64 => "pktRcvFilterSupply",
    /// Packets the filter failed to recover in the interval.
    pkt_rcv_filter_loss: i64 => "pktRcvFilterLoss",
    /// Send rate over the interval, Mbit/s.
    mbps_send_rate: f64 => "mbpsSendRate",
    /// Receive rate over the interval, Mbit/s.
    mbps_recv_rate: f64 => "mbpsRecvRate",
    /// Microseconds spent with data in flight during the interval.
    us_snd_duration: i64 => "usSndDuration",
    /// Largest reordering distance observed, in packets.
    pkt_reorder_distance: i64 => "pktReorderDistance",
    /// Average lateness of belated packets, milliseconds.
    pkt_rcv_avg_belated_time: f64 => "pktRcvAvgBelatedTime",
    /// Packets that arrived after they were no longer needed.
    pkt_rcv_belated: i64 => "pktRcvBelated",
    /// Packets dropped by the sender in the interval.
    pkt_snd_drop: i64 => "pktSndDrop",
    /// Packets dropped by the receiver in the interval.
    pkt_rcv_drop: i64 => "pktRcvDrop",
    /// Packets that failed to decrypt in the interval.
    pkt_rcv_undecrypt: i64 => "pktRcvUndecrypt",
    /// Payload bytes sent in the interval.
    byte_sent: i64 => "byteSent",
    /// Payload bytes received in the interval.
    byte_recv: i64 => "byteRecv",
    /// Estimated payload bytes lost in the interval.
    byte_rcv_loss: i64 => "byteRcvLoss",
    /// Payload bytes retransmitted in the interval.
    byte_retrans: i64 => "byteRetrans",
    /// Payload bytes dropped by the sender in the interval.
    byte_snd_drop: i64 => "byteSndDrop",
    /// Payload bytes dropped by the receiver in the interval.
    byte_rcv_drop: i64 => "byteRcvDrop",
    /// Payload bytes that failed to decrypt in the interval.
    byte_rcv_undecrypt: i64 => "byteRcvUndecrypt",

    /// Inter-packet send period, microseconds.
    us_pkt_snd_period: f64 => "usPktSndPeriod",
    /// Free room in the flow window, packets.
    pkt_flow_window: i64 => "pktFlowWindow",
    /// Congestion window, packets.
    pkt_congestion_window: i64 => "pktCongestionWindow",
    /// Packets in flight.
    pkt_flight_size: i64 => "pktFlightSize",
    /// Smoothed round-trip time, milliseconds.
    ms_rtt: f64 => "msRTT",
    /// Estimated link bandwidth, Mbit/s.
    mbps_bandwidth: f64 => "mbpsBandwidth",
    /// Free sender buffer, bytes.
    byte_avail_snd_buf: i64 => "byteAvailSndBuf",
    /// Free receiver buffer, bytes.
    byte_avail_rcv_buf: i64 => "byteAvailRcvBuf",
    /// Configured bandwidth ceiling, Mbit/s (0 when unlimited).
    mbps_max_bw: f64 => "mbpsMaxBW",
    /// Maximum segment size, bytes.
    byte_mss: i64 => "byteMSS",
    /// Unacknowledged packets in the sender buffer.
    pkt_snd_buf: i64 => "pktSndBuf",
    /// Unacknowledged payload bytes in the sender buffer.
    byte_snd_buf: i64 => "byteSndBuf",
    /// Age of the oldest unacknowledged packet, milliseconds.
    ms_snd_buf: i64 => "msSndBuf",
    /// Sender-side delivery delay, milliseconds.
    ms_snd_tsbpd_delay: i64 => "msSndTsbPdDelay",
    /// Packets waiting in the receiver buffer.
    pkt_rcv_buf: i64 => "pktRcvBuf",
    /// Payload bytes waiting in the receiver buffer.
    byte_rcv_buf: i64 => "byteRcvBuf",
    /// Age of the oldest undelivered data, milliseconds.
    ms_rcv_buf: i64 => "msRcvBuf",
    /// Receiver-side delivery delay, milliseconds.
    ms_rcv_tsbpd_delay: i64 => "msRcvTsbPdDelay",
}

/// Instantaneous values sampled from a connection alongside its registers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Gauges {
    pub snd_period_us: f64,
    pub flow_window: i64,
    pub congestion_window: i64,
    pub flight_size: i64,
    pub rtt_ms: f64,
    pub bandwidth_mbps: f64,
    pub avail_snd_buf: i64,
    pub avail_rcv_buf: i64,
    pub max_bw_mbps: f64,
    pub mss: i64,
    pub snd_buf_pkts: i64,
    pub snd_buf_bytes: i64,
    pub snd_buf_ms: i64,
    pub snd_tsbpd_delay_ms: i64,
    pub rcv_buf_pkts: i64,
    pub rcv_buf_bytes: i64,
    pub rcv_buf_ms: i64,
    pub rcv_tsbpd_delay_ms: i64,
}

impl StatsSnapshot {
    /// Look a counter up by any spelling of its name.
    ///
    /// `pktSentTotal`, `pkt_sent_total` and `pktsenttotal` all name the same
    /// counter.
    pub fn get(&self, name: &str) -> Option<StatValue> {
        let wanted = normalize(name);
        self.entries()
            .into_iter()
            .find(|(wire, _)| normalize(wire) == wanted)
            .map(|(_, value)| value)
    }

    /// Snapshot of a socket that has no connection yet.
    pub(crate) fn unconnected(since: Instant, now: Instant) -> Self {
        Self {
            ms_time_stamp: millis(now.saturating_duration_since(since)),
            ..Self::default()
        }
    }

    pub(crate) fn assemble(registers: &Registers, gauges: &Gauges, now: Instant) -> Self {
        let total = &registers.total;
        let interval = &registers.interval;
        let elapsed_us = now
            .saturating_duration_since(registers.interval_started)
            .as_micros() as f64;
        let rate = |bytes: u64| {
            if elapsed_us > 0.0 {
                bytes as f64 * 8.0 / elapsed_us
            } else {
                0.0
            }
        };

        Self {
            ms_time_stamp: millis(now.saturating_duration_since(registers.started)),

            pkt_sent_total: int(total.pkt_sent),
            pkt_recv_total: int(total.pkt_recv),
            pkt_snd_loss_total: int(total.pkt_snd_loss),
            pkt_rcv_loss_total: int(total.pkt_rcv_loss),
            pkt_retrans_total: int(total.pkt_retrans),
            pkt_sent_ack_total: int(total.pkt_sent_ack),
            pkt_recv_ack_total: int(total.pkt_recv_ack),
            pkt_sent_nak_total: int(total.pkt_sent_nak),
            pkt_recv_nak_total: int(total.pkt_recv_nak),
            us_snd_duration_total: int(total.us_snd_duration),
            pkt_snd_drop_total: int(total.pkt_snd_drop),
            pkt_rcv_drop_total: int(total.pkt_rcv_drop),
            pkt_rcv_undecrypt_total: int(total.pkt_rcv_undecrypt),
            pkt_snd_filter_extra_total: int(total.pkt_snd_filter_extra),
            pkt_rcv_filter_extra_total: int(total.pkt_rcv_filter_extra),
            pkt_rcv_filter_supply_total: int(total.pkt_rcv_filter_supply),
            pkt_rcv_filter_loss_total: int(total.pkt_rcv_filter_loss),
            byte_sent_total: int(total.byte_sent),
            byte_recv_total: int(total.byte_recv),
            byte_rcv_loss_total: int(total.byte_rcv_loss),
            byte_retrans_total: int(total.byte_retrans),
            byte_snd_drop_total: int(total.byte_snd_drop),
            byte_rcv_drop_total: int(total.byte_rcv_drop),
            byte_rcv_undecrypt_total: int(total.byte_rcv_undecrypt),

            pkt_sent: int(interval.pkt_sent),
            pkt_recv: int(interval.pkt_recv),
            pkt_snd_loss: int(interval.pkt_snd_loss),
            pkt_rcv_loss: int(interval.pkt_rcv_loss),
            pkt_retrans: int(interval.pkt_retrans),
            pkt_rcv_retrans: int(interval.pkt_rcv_retrans),
            pkt_sent_ack: int(interval.pkt_sent_ack),
            pkt_recv_ack: int(interval.pkt_recv_ack),
            pkt_sent_nak: int(interval.pkt_sent_nak),
            pkt_recv_nak: int(interval.pkt_recv_nak),
            pkt_snd_filter_extra: int(interval.pkt_snd_filter_extra),
            pkt_rcv_filter_extra: int(interval.pkt_rcv_filter_extra),
            pkt_rcv_filter_supply: int(interval.pkt_rcv_filter_supply),
            pkt_rcv_filter_loss: int(interval.pkt_rcv_filter_loss),
            mbps_send_rate: rate(interval.byte_sent),
            mbps_recv_rate: rate(interval.byte_recv),
            us_snd_duration: int(interval.us_snd_duration),
            pkt_reorder_distance: int(registers.reorder_distance),
            pkt_rcv_avg_belated_time: 0.0,
            pkt_rcv_belated: int(interval.pkt_rcv_belated),
            pkt_snd_drop: int(interval.pkt_snd_drop),
            pkt_rcv_drop: int(interval.pkt_rcv_drop),
            pkt_rcv_undecrypt: int(interval.pkt_rcv_undecrypt),
            byte_sent: int(interval.byte_sent),
            byte_recv: int(interval.byte_recv),
            byte_rcv_loss: int(interval.byte_rcv_loss),
            byte_retrans: int(interval.byte_retrans),
            byte_snd_drop: int(interval.byte_snd_drop),
            byte_rcv_drop: int(interval.byte_rcv_drop),
            byte_rcv_undecrypt: int(interval.byte_rcv_undecrypt),

            us_pkt_snd_period: gauges.snd_period_us,
            pkt_flow_window: gauges.flow_window,
            pkt_congestion_window: gauges.congestion_window,
            pkt_flight_size: gauges.flight_size,
            ms_rtt: gauges.rtt_ms,
            mbps_bandwidth: gauges.bandwidth_mbps,
            byte_avail_snd_buf: gauges.avail_snd_buf,
            byte_avail_rcv_buf: gauges.avail_rcv_buf,
            mbps_max_bw: gauges.max_bw_mbps,
            byte_mss: gauges.mss,
            pkt_snd_buf: gauges.snd_buf_pkts,
            byte_snd_buf: gauges.snd_buf_bytes,
            ms_snd_buf: gauges.snd_buf_ms,
            ms_snd_tsbpd_delay: gauges.snd_tsbpd_delay_ms,
            pkt_rcv_buf: gauges.rcv_buf_pkts,
            byte_rcv_buf: gauges.rcv_buf_bytes,
            ms_rcv_buf: gauges.rcv_buf_ms,
            ms_rcv_tsbpd_delay: gauges.rcv_tsbpd_delay_ms,
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.entries() {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn millis(duration: std::time::Duration) -> i64 {
    int(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_counter_names() {
        assert_eq!(StatsSnapshot::COUNTER_NAMES.len(), 73);
        assert_eq!(StatsSnapshot::COUNTER_NAMES[0], "msTimeStamp");
        assert!(StatsSnapshot::COUNTER_NAMES.contains(&"pktSentACKTotal"));
    }

    #[test]
    fn test_get_aliases() {
        let snapshot = StatsSnapshot {
            pkt_sent_total: 7,
            ms_rtt: 1.5,
            ms_snd_tsbpd_delay: 120,
            ..Default::default()
        };

        for name in ["pktSentTotal", "pkt_sent_total", "pktsenttotal"] {
            assert_eq!(snapshot.get(name), Some(StatValue::Int(7)));
        }
        assert_eq!(snapshot.get("ms_rtt"), Some(StatValue::Float(1.5)));
        assert_eq!(snapshot.get("msRTT"), Some(StatValue::Float(1.5)));
        assert_eq!(snapshot.get("ms_snd_tsbpd_delay"), Some(StatValue::Int(120)));
        assert_eq!(snapshot.get("pkt_sent_ack_total"), Some(StatValue::Int(0)));
        assert_eq!(snapshot.get("no_such_counter"), None);
    }

    #[test]
    fn test_assemble() {
        let start = Instant::now();
        let mut registers = Registers::new(start);
        registers.data_sent(1000);
        registers.data_sent(1000);
        registers.clear_interval(start);
        registers.data_sent(500);

        let gauges = Gauges {
            rtt_ms: 2.0,
            mss: 1500,
            ..Default::default()
        };
        let now = start + Duration::from_millis(1);
        let snapshot = StatsSnapshot::assemble(&registers, &gauges, now);

        assert_eq!(snapshot.ms_time_stamp, 1);
        assert_eq!(snapshot.pkt_sent_total, 3);
        assert_eq!(snapshot.byte_sent_total, 2500);
        assert_eq!(snapshot.pkt_sent, 1);
        assert_eq!(snapshot.byte_sent, 500);
        // 500 bytes in 1 ms = 4 Mbit/s
        assert!((snapshot.mbps_send_rate - 4.0).abs() < 1e-9);
        assert_eq!(snapshot.byte_mss, 1500);
        assert_eq!(snapshot.ms_rtt, 2.0);
    }

    #[test]
    fn test_unconnected() {
        let start = Instant::now();
        let snapshot = StatsSnapshot::unconnected(start, start + Duration::from_millis(25));
        assert_eq!(snapshot.ms_time_stamp, 25);
        assert_eq!(snapshot.pkt_sent_total, 0);
    }
}
