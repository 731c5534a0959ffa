//! Per-connection protocol state.
//!
//! A [`Connection`] performs no I/O. It consumes received packets and clock
//! readings and returns the packets to transmit; the endpoint owning it moves
//! datagrams.
//!
//! ```text
//!   caller                                  acceptor
//!     │ ── Handshake(stream id) ──────────────▶ │
//!     │ ◀───────────────────── HandshakeAck ── │
//!     │ ── Data(seq 0, FIRST) ───────────────▶ │
//!     │ ── Data(seq 1, LAST) ─────── ✗         │
//!     │ ── Data(seq 2, SOLO) ────────────────▶ │  gap detected
//!     │ ◀──────────── Ack(1), Nak(1..=1) ───── │
//!     │ ── Data(seq 1, LAST|RETRANSMITTED) ──▶ │
//!     │ ◀────────────────────────── Ack(3) ── │
//!     │ ── Shutdown(final 3) ────────────────▶ │  end of stream
//! ```
//!
//! Fragments beyond the flow window wait in a send queue that
//! acknowledgements drain. A closing sender keeps its connection alive until
//! every fragment is acknowledged; the receiver reports end of stream only
//! once it holds everything before the final sequence number.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::packet::{Packet, PacketFlags, RejectReason, SocketId};
use super::pacing::Pacer;
use super::timing::RttEstimator;
use crate::core::constants::{
    DEFAULT_MSS, HANDSHAKE_RETRY_INTERVAL, KEEPALIVE_INTERVAL, PROTOCOL_VERSION,
    RETRANSMIT_BURST,
};
use crate::poll::Interest;
use crate::stats::StatsSnapshot;
use crate::stats::registers::Registers;
use crate::stats::snapshot::Gauges;

/// Connection tunables, fixed when the connection is created.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub payload_size: usize,
    pub flow_window: usize,
    pub connect_timeout: Duration,
    pub peer_idle_timeout: Duration,
    pub latency: Duration,
    /// Bytes per second, zero when unlimited. Paces new data.
    pub max_bandwidth: u64,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionPhase {
    /// Handshake sent, no answer yet.
    Connecting,
    /// Data transfer active.
    Connected,
    /// The peer closed gracefully; queued data can still be read.
    PeerClosed,
    /// The connection failed.
    Broken(BrokenReason),
}

/// Why a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BrokenReason {
    Rejected(RejectReason),
    HandshakeTimeout,
    PeerIdle,
    /// The peer closed but data before its final sequence number never
    /// arrived.
    Truncated,
}

impl BrokenReason {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            Self::Rejected(reason) => reason.describe(),
            Self::HandshakeTimeout => "connection setup timed out",
            Self::PeerIdle => "peer stopped responding",
            Self::Truncated => "peer closed before all data arrived",
        }
    }
}

#[derive(Debug)]
struct InFlight {
    payload: Vec<u8>,
    flags: PacketFlags,
    queued_at: Instant,
    sent_at: Instant,
    retransmitted: bool,
}

#[derive(Debug)]
struct Queued {
    seq: u32,
    payload: Vec<u8>,
    flags: PacketFlags,
    queued_at: Instant,
}

#[derive(Debug)]
struct Delivered {
    data: Vec<u8>,
    arrived: Instant,
}

/// State of one connection.
#[derive(Debug)]
pub(crate) struct Connection {
    local_id: SocketId,
    peer_id: SocketId,
    peer_addr: SocketAddr,
    phase: ConnectionPhase,
    stream_id: Option<String>,
    settings: ConnectionSettings,

    next_seq: u32,
    send_queue: VecDeque<Queued>,
    queued_bytes: usize,
    in_flight: BTreeMap<u32, InFlight>,
    in_flight_bytes: usize,
    pacer: Option<Pacer>,
    /// Set once this side has announced its shutdown.
    closing: bool,

    expected: u32,
    /// One past the highest sequence number seen.
    highest_seen: u32,
    reorder: BTreeMap<u32, (PacketFlags, Vec<u8>)>,
    reorder_bytes: usize,
    assembling: Vec<u8>,
    ready: VecDeque<Delivered>,
    ready_bytes: usize,
    read_offset: usize,
    /// Final sequence number announced by the peer's shutdown.
    peer_final: Option<u32>,

    rtt: RttEstimator,
    registers: Registers,
    started: Instant,
    last_received: Instant,
    last_sent: Instant,
    last_tick: Instant,
    handshake_sent: Instant,
}

impl Connection {
    fn new(
        local_id: SocketId,
        peer_id: SocketId,
        peer_addr: SocketAddr,
        phase: ConnectionPhase,
        stream_id: Option<String>,
        settings: ConnectionSettings,
        now: Instant,
    ) -> Self {
        let pacer = (settings.max_bandwidth > 0)
            .then(|| Pacer::new(settings.max_bandwidth, settings.payload_size, now));
        Self {
            local_id,
            peer_id,
            peer_addr,
            phase,
            stream_id,
            settings,
            next_seq: 0,
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            in_flight: BTreeMap::new(),
            in_flight_bytes: 0,
            pacer,
            closing: false,
            expected: 0,
            highest_seen: 0,
            reorder: BTreeMap::new(),
            reorder_bytes: 0,
            assembling: Vec::new(),
            ready: VecDeque::new(),
            ready_bytes: 0,
            read_offset: 0,
            peer_final: None,
            rtt: RttEstimator::new(),
            registers: Registers::new(now),
            started: now,
            last_received: now,
            last_sent: now,
            last_tick: now,
            handshake_sent: now,
        }
    }

    /// Start a connection request; returns the handshake to send.
    pub(crate) fn caller(
        local_id: SocketId,
        peer_addr: SocketAddr,
        stream_id: Option<String>,
        settings: ConnectionSettings,
        now: Instant,
    ) -> (Self, Packet) {
        let connection = Self::new(
            local_id,
            SocketId::NONE,
            peer_addr,
            ConnectionPhase::Connecting,
            stream_id,
            settings,
            now,
        );
        let handshake = connection.handshake();
        (connection, handshake)
    }

    /// Connection admitted by a listener.
    pub(crate) fn acceptor(
        local_id: SocketId,
        peer_id: SocketId,
        peer_addr: SocketAddr,
        stream_id: Option<String>,
        settings: ConnectionSettings,
        now: Instant,
    ) -> Self {
        Self::new(
            local_id,
            peer_id,
            peer_addr,
            ConnectionPhase::Connected,
            stream_id,
            settings,
            now,
        )
    }

    fn handshake(&self) -> Packet {
        Packet::Handshake {
            src: self.local_id,
            version: PROTOCOL_VERSION,
            stream_id: self.stream_id.clone(),
        }
    }

    pub(crate) fn handshake_ack(&self) -> Packet {
        Packet::HandshakeAck {
            dest: self.peer_id,
            src: self.local_id,
        }
    }

    pub(crate) fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn peer_id(&self) -> SocketId {
        self.peer_id
    }

    pub(crate) fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Process one packet addressed to this connection.
    pub(crate) fn on_packet(&mut self, packet: Packet, now: Instant) -> Vec<Packet> {
        if matches!(
            self.phase,
            ConnectionPhase::Broken(_) | ConnectionPhase::PeerClosed
        ) {
            return Vec::new();
        }
        self.last_received = now;

        match packet {
            Packet::HandshakeAck { src, .. } => {
                self.establish(src);
                Vec::new()
            }
            Packet::Data {
                src,
                flags,
                seq,
                payload,
                ..
            } => {
                // Data can overtake a lost handshake acknowledgement.
                self.establish(src);
                let replies = self.on_data(flags, seq, payload, now);
                self.close_if_complete();
                replies
            }
            Packet::Ack { next, .. } => {
                self.on_ack(next, now);
                self.pump(now)
            }
            Packet::Nak { from, to, .. } => self.on_nak(from, to, now),
            Packet::Shutdown { final_seq, .. } => {
                self.peer_final = Some(final_seq);
                if !self.close_if_complete() {
                    debug!(
                        local = %self.local_id,
                        peer = %self.peer_addr,
                        missing = final_seq.saturating_sub(self.expected),
                        "peer closing, waiting for remaining data"
                    );
                }
                Vec::new()
            }
            Packet::Reject { reason, .. } => {
                if self.phase == ConnectionPhase::Connecting {
                    warn!(local = %self.local_id, peer = %self.peer_addr, reason = reason.describe(), "connection rejected");
                    self.phase = ConnectionPhase::Broken(BrokenReason::Rejected(reason));
                }
                Vec::new()
            }
            Packet::Handshake { .. } | Packet::Keepalive { .. } => Vec::new(),
        }
    }

    /// Enter end of stream once everything before the peer's final
    /// sequence number was delivered.
    fn close_if_complete(&mut self) -> bool {
        let Some(final_seq) = self.peer_final else {
            return false;
        };
        if self.expected < final_seq {
            return false;
        }
        if matches!(
            self.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Connected
        ) {
            debug!(local = %self.local_id, peer = %self.peer_addr, "peer closed the connection");
            self.phase = ConnectionPhase::PeerClosed;
            self.clear_in_flight();
        }
        true
    }

    fn establish(&mut self, peer_id: SocketId) {
        if self.phase == ConnectionPhase::Connecting {
            self.peer_id = peer_id;
            self.phase = ConnectionPhase::Connected;
            debug!(local = %self.local_id, peer = %self.peer_addr, "connection established");
        }
    }

    fn on_data(&mut self, flags: PacketFlags, seq: u32, payload: Vec<u8>, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();
        self.registers
            .data_received(payload.len(), flags.is_retransmitted());

        if seq < self.expected || self.reorder.contains_key(&seq) {
            self.registers.belated();
        } else {
            if seq >= self.highest_seen {
                if seq > self.highest_seen {
                    let lost = u64::from(seq - self.highest_seen);
                    self.registers
                        .receive_loss(lost, lost * self.settings.payload_size as u64);
                    self.registers.nak_sent();
                    out.push(Packet::Nak {
                        dest: self.peer_id,
                        src: self.local_id,
                        from: self.highest_seen,
                        to: seq - 1,
                    });
                }
                self.highest_seen = seq.wrapping_add(1);
            } else if !flags.is_retransmitted() {
                self.registers
                    .reordered(u64::from(self.highest_seen - 1 - seq));
            }

            if seq == self.expected {
                self.deliver(flags, payload, now);
                self.expected = self.expected.wrapping_add(1);
                while let Some((flags, payload)) = self.reorder.remove(&self.expected) {
                    self.reorder_bytes -= payload.len();
                    self.deliver(flags, payload, now);
                    self.expected = self.expected.wrapping_add(1);
                }
            } else {
                self.reorder_bytes += payload.len();
                self.reorder.insert(seq, (flags, payload));
            }
        }

        self.registers.ack_sent();
        out.push(Packet::Ack {
            dest: self.peer_id,
            src: self.local_id,
            next: self.expected,
        });
        out
    }

    fn deliver(&mut self, flags: PacketFlags, payload: Vec<u8>, now: Instant) {
        if flags.is_first() {
            self.assembling.clear();
        }
        self.assembling.extend_from_slice(&payload);
        if flags.is_last() {
            let data = std::mem::take(&mut self.assembling);
            self.ready_bytes += data.len();
            self.ready.push_back(Delivered { data, arrived: now });
        }
    }

    fn on_ack(&mut self, next: u32, now: Instant) {
        self.registers.ack_received();

        // Karn's rule: only packets sent once give a usable sample.
        if let Some(newest) = next.checked_sub(1) {
            if let Some(entry) = self.in_flight.get(&newest) {
                if !entry.retransmitted {
                    self.rtt.update(now.saturating_duration_since(entry.sent_at));
                }
            }
        }

        let remaining = self.in_flight.split_off(&next);
        let acked = std::mem::replace(&mut self.in_flight, remaining);
        for entry in acked.values() {
            self.in_flight_bytes -= entry.payload.len();
        }
    }

    fn on_nak(&mut self, from: u32, to: u32, now: Instant) -> Vec<Packet> {
        self.registers.nak_received();
        if from > to {
            return Vec::new();
        }

        let missing: Vec<u32> = self.in_flight.range(from..=to).map(|(seq, _)| *seq).collect();
        self.registers.send_loss(missing.len() as u64);
        missing
            .into_iter()
            .filter_map(|seq| self.retransmit(seq, now))
            .collect()
    }

    fn retransmit(&mut self, seq: u32, now: Instant) -> Option<Packet> {
        let entry = self.in_flight.get_mut(&seq)?;
        entry.sent_at = now;
        entry.retransmitted = true;
        let packet = Packet::Data {
            dest: self.peer_id,
            src: self.local_id,
            flags: entry.flags.with_retransmitted(),
            seq,
            payload: entry.payload.clone(),
        };
        let len = entry.payload.len();
        self.registers.data_retransmitted(len);
        self.last_sent = now;
        Some(packet)
    }

    fn clear_in_flight(&mut self) {
        self.in_flight.clear();
        self.in_flight_bytes = 0;
        self.send_queue.clear();
        self.queued_bytes = 0;
    }

    /// Whether the flow window has room for another send.
    pub(crate) fn can_send(&self) -> bool {
        self.phase == ConnectionPhase::Connected
            && self.send_queue.is_empty()
            && self.in_flight.len() < self.settings.flow_window
    }

    /// Nothing is left to deliver: every fragment was acknowledged, or the
    /// connection can no longer deliver anything.
    pub(crate) fn is_drained(&self) -> bool {
        self.phase != ConnectionPhase::Connected
            || (self.in_flight.is_empty() && self.send_queue.is_empty())
    }

    /// Fragments sent or queued but not yet acknowledged.
    pub(crate) fn unacknowledged(&self) -> usize {
        self.in_flight.len() + self.send_queue.len()
    }

    /// Move queued fragments into flight while the window and the pacer
    /// allow it.
    fn pump(&mut self, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();
        if self.phase != ConnectionPhase::Connected {
            return out;
        }
        while self.in_flight.len() < self.settings.flow_window {
            let Some(front) = self.send_queue.front() else {
                break;
            };
            if let Some(pacer) = &mut self.pacer {
                if !pacer.try_consume(front.payload.len(), now) {
                    break;
                }
            }
            let Some(queued) = self.send_queue.pop_front() else {
                break;
            };
            let len = queued.payload.len();
            self.queued_bytes -= len;
            self.in_flight_bytes += len;
            self.registers.data_sent(len);
            out.push(Packet::Data {
                dest: self.peer_id,
                src: self.local_id,
                flags: queued.flags,
                seq: queued.seq,
                payload: queued.payload.clone(),
            });
            self.in_flight.insert(
                queued.seq,
                InFlight {
                    payload: queued.payload,
                    flags: queued.flags,
                    queued_at: queued.queued_at,
                    sent_at: now,
                    retransmitted: false,
                },
            );
        }
        if !out.is_empty() {
            self.last_sent = now;
        }
        out
    }

    /// Queue `data` for transmission, split at the payload size.
    ///
    /// With `message` set the fragments carry message boundaries and are
    /// reassembled into one unit by the receiver; otherwise every fragment
    /// stands alone.
    pub(crate) fn send(&mut self, data: &[u8], message: bool, now: Instant) -> Vec<Packet> {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(self.settings.payload_size).collect()
        };
        let count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let flags = if message {
                let mut flags = PacketFlags::NONE;
                if index == 0 {
                    flags = flags | PacketFlags::FIRST;
                }
                if index + 1 == count {
                    flags = flags | PacketFlags::LAST;
                }
                flags
            } else {
                PacketFlags::SOLO
            };

            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.queued_bytes += chunk.len();
            self.send_queue.push_back(Queued {
                seq,
                payload: chunk.to_vec(),
                flags,
                queued_at: now,
            });
        }
        self.pump(now)
    }

    /// Drive timers: handshake retries, retransmission, keepalive and
    /// liveness.
    pub(crate) fn on_tick(&mut self, now: Instant) -> Vec<Packet> {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;

        match self.phase {
            ConnectionPhase::Connecting => {
                if now.saturating_duration_since(self.started) >= self.settings.connect_timeout {
                    warn!(local = %self.local_id, peer = %self.peer_addr, "connection setup timed out");
                    self.phase = ConnectionPhase::Broken(BrokenReason::HandshakeTimeout);
                    return Vec::new();
                }
                if now.saturating_duration_since(self.handshake_sent) >= HANDSHAKE_RETRY_INTERVAL {
                    self.handshake_sent = now;
                    return vec![self.handshake()];
                }
                Vec::new()
            }
            ConnectionPhase::Connected => {
                if now.saturating_duration_since(self.last_received) >= self.settings.peer_idle_timeout
                {
                    let reason = if self.peer_final.is_some() {
                        BrokenReason::Truncated
                    } else {
                        BrokenReason::PeerIdle
                    };
                    warn!(local = %self.local_id, peer = %self.peer_addr, reason = reason.describe(), "connection broken");
                    self.phase = ConnectionPhase::Broken(reason);
                    self.clear_in_flight();
                    return Vec::new();
                }

                if self.unacknowledged() > 0 {
                    self.registers.sending_for(elapsed);
                }

                // Oldest first, a bounded batch per tick.
                let rto = self.rtt.rto();
                let expired: Vec<u32> = self
                    .in_flight
                    .iter()
                    .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= rto)
                    .map(|(seq, _)| *seq)
                    .take(RETRANSMIT_BURST)
                    .collect();

                let mut out: Vec<Packet> = Vec::new();
                if let Some(first) = expired.first() {
                    // One backoff per timeout event, not per batch.
                    if self.in_flight.keys().next() == Some(first) {
                        self.rtt.backoff();
                    }
                    out.extend(expired.into_iter().filter_map(|seq| self.retransmit(seq, now)));
                }
                out.extend(self.pump(now));

                if out.is_empty()
                    && now.saturating_duration_since(self.last_sent) >= KEEPALIVE_INTERVAL
                {
                    self.last_sent = now;
                    out.push(if self.closing {
                        self.shutdown_notice()
                    } else {
                        Packet::Keepalive {
                            dest: self.peer_id,
                            src: self.local_id,
                        }
                    });
                }
                out
            }
            ConnectionPhase::PeerClosed | ConnectionPhase::Broken(_) => Vec::new(),
        }
    }

    /// Announce the close; returns the notice for the peer if it knows
    /// about this connection.
    ///
    /// Unacknowledged data stays queued: the connection keeps retransmitting
    /// until [`is_drained`](Self::is_drained), repeating the notice while
    /// idle.
    pub(crate) fn shutdown(&mut self, now: Instant) -> Option<Packet> {
        if self.phase != ConnectionPhase::Connected {
            return None;
        }
        self.closing = true;
        self.last_sent = now;
        Some(self.shutdown_notice())
    }

    fn shutdown_notice(&self) -> Packet {
        Packet::Shutdown {
            dest: self.peer_id,
            src: self.local_id,
            final_seq: self.next_seq,
        }
    }

    pub(crate) fn has_data(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Byte-stream read across message boundaries.
    pub(crate) fn read(&mut self, max_bytes: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max_bytes {
            let Some(front) = self.ready.front() else {
                break;
            };
            let available = &front.data[self.read_offset..];
            let take = available.len().min(max_bytes - out.len());
            out.extend_from_slice(&available[..take]);
            self.read_offset += take;
            self.ready_bytes -= take;
            if self.read_offset == front.data.len() {
                self.ready.pop_front();
                self.read_offset = 0;
            }
        }
        out
    }

    /// Next complete message, or what remains of it after a partial read.
    pub(crate) fn take_message(&mut self) -> Option<Vec<u8>> {
        let front = self.ready.pop_front()?;
        let offset = std::mem::take(&mut self.read_offset);
        self.ready_bytes -= front.data.len() - offset;
        Some(if offset == 0 {
            front.data
        } else {
            front.data[offset..].to_vec()
        })
    }

    pub(crate) fn readiness(&self) -> Interest {
        match self.phase {
            ConnectionPhase::Connecting => Interest::NONE,
            ConnectionPhase::Connected => {
                let mut ready = Interest::NONE;
                if self.has_data() {
                    ready |= Interest::READABLE;
                }
                if self.can_send() {
                    ready |= Interest::WRITABLE;
                }
                ready
            }
            ConnectionPhase::PeerClosed => Interest::READABLE,
            ConnectionPhase::Broken(_) => Interest::READABLE | Interest::ERROR,
        }
    }

    /// Capture statistics; `clear` resets the interval counters.
    pub(crate) fn stats(&mut self, clear: bool, now: Instant) -> StatsSnapshot {
        let window = self.settings.flow_window as i64;
        let buffer_capacity = window * self.settings.payload_size as i64;
        let max_bw = self.settings.max_bandwidth as f64;
        let age_ms = |since: Instant| now.saturating_duration_since(since).as_millis() as i64;

        let snd_buf_bytes = self.in_flight_bytes + self.queued_bytes;
        let oldest_unacked = self
            .in_flight
            .values()
            .next()
            .map(|entry| entry.queued_at)
            .or_else(|| self.send_queue.front().map(|queued| queued.queued_at));

        let gauges = Gauges {
            snd_period_us: self.pacer.as_ref().map_or(0.0, |pacer| {
                pacer.packet_period(self.settings.payload_size).as_secs_f64() * 1_000_000.0
            }),
            flow_window: window - self.in_flight.len() as i64,
            congestion_window: window,
            flight_size: self.in_flight.len() as i64,
            rtt_ms: self.rtt.srtt_ms(),
            bandwidth_mbps: 0.0,
            avail_snd_buf: (buffer_capacity - snd_buf_bytes as i64).max(0),
            avail_rcv_buf: (buffer_capacity - (self.ready_bytes + self.reorder_bytes) as i64).max(0),
            max_bw_mbps: max_bw * 8.0 / 1_000_000.0,
            mss: DEFAULT_MSS as i64,
            snd_buf_pkts: self.unacknowledged() as i64,
            snd_buf_bytes: snd_buf_bytes as i64,
            snd_buf_ms: oldest_unacked.map_or(0, |since| age_ms(since)),
            snd_tsbpd_delay_ms: self.settings.latency.as_millis() as i64,
            rcv_buf_pkts: (self.ready.len() + self.reorder.len()) as i64,
            rcv_buf_bytes: (self.ready_bytes + self.reorder_bytes) as i64,
            rcv_buf_ms: self.ready.front().map_or(0, |entry| age_ms(entry.arrived)),
            rcv_tsbpd_delay_ms: self.settings.latency.as_millis() as i64,
        };

        let snapshot = StatsSnapshot::assemble(&self.registers, &gauges, now);
        if clear {
            self.registers.clear_interval(now);
        }
        snapshot
    }
}
