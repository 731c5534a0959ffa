//! Protocol and session constants.

use std::time::Duration;

// =============================================================================
// STREAM IDENTIFIER
// =============================================================================

/// Prefix marking the structured `key=value` stream identifier form.
pub const STREAM_ID_PREFIX: &str = "#!::";

/// Longest stream identifier the handshake can carry, in bytes.
pub const MAX_STREAM_ID_LEN: usize = 512;

// =============================================================================
// PACKET SIZES
// =============================================================================

/// Payload carried by one data packet in live mode (7 MPEG-TS cells).
pub const LIVE_PAYLOAD_SIZE: usize = 1316;

/// Payload carried by one data packet in file mode.
pub const FILE_PAYLOAD_SIZE: usize = 1456;

/// Largest payload a data packet may carry.
pub const MAX_PAYLOAD_SIZE: usize = FILE_PAYLOAD_SIZE;

/// Maximum segment size reported in statistics.
pub const DEFAULT_MSS: usize = 1500;

/// Engine protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u16 = 0x0001;

// =============================================================================
// FLOW CONTROL
// =============================================================================

/// Unacknowledged packets allowed in flight per connection.
///
/// Kept below what a default kernel receive buffer absorbs in one burst.
pub const DEFAULT_FLOW_WINDOW: usize = 64;

/// Most packets retransmitted by one timer tick.
pub const RETRANSMIT_BURST: usize = 16;

/// Backlog used when none is given.
pub const DEFAULT_BACKLOG: usize = 6;

// =============================================================================
// TIMING
// =============================================================================

/// How long a caller waits for the handshake to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between handshake retransmissions while connecting.
pub const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// A keepalive is sent when nothing else was sent for this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// A connection is broken after hearing nothing from the peer for this long.
pub const DEFAULT_PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closed socket keeps delivering unacknowledged data.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(10);

/// How long a closed connection's handshake is remembered, so retries that
/// arrive late are not admitted as new connections. Longer than the default
/// connect timeout.
pub const HANDSHAKE_MEMORY: Duration = Duration::from_secs(5);

/// Receiver latency reported as the TSBPD delay.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(120);

/// Period of the engine timer driving retransmission and liveness.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Poll timeout of the server loop between shutdown checks.
pub const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// ENGINE
// =============================================================================

/// Worker threads of the engine runtime.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Receive buffer for one datagram.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;
