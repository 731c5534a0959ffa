//! Socket options.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::core::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_FLOW_WINDOW, DEFAULT_LATENCY, DEFAULT_LINGER,
    DEFAULT_PEER_IDLE_TIMEOUT,
    FILE_PAYLOAD_SIZE, LIVE_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, MAX_STREAM_ID_LEN,
};
use crate::core::{SrtError, SrtResult};
use crate::engine::ConnectionSettings;
use crate::streamid::StreamIdComponents;

/// Transmission profile of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmissionMode {
    /// Live streaming: small payloads, message API.
    #[default]
    Live,
    /// Bulk transfer: larger payloads, stream API.
    File,
}

impl TransmissionMode {
    /// Payload size used by this mode unless overridden.
    pub fn default_payload_size(self) -> usize {
        match self {
            Self::Live => LIVE_PAYLOAD_SIZE,
            Self::File => FILE_PAYLOAD_SIZE,
        }
    }

    /// Text form of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::File => "file",
        }
    }
}

impl FromStr for TransmissionMode {
    type Err = SrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Self::Live),
            "file" => Ok(Self::File),
            other => Err(SrtError::InvalidArgument(format!(
                "unknown transmission mode {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TransmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options applied to a socket.
///
/// Built in the usual consuming-builder style and handed to
/// [`SocketHandle::with_options`](crate::SocketHandle::with_options);
/// individual options can also be changed on the handle before it connects.
/// Accepted sockets inherit the listener's options.
///
/// ```rust
/// use std::time::Duration;
/// use srt_session::{SocketOptions, TransmissionMode};
///
/// let options = SocketOptions::new()
///     .read_sync(false)
///     .transmission_mode(TransmissionMode::File)
///     .connect_timeout(Duration::from_millis(500));
/// assert_eq!(options.payload_size_or_default(), 1456);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub(crate) read_sync: bool,
    pub(crate) write_sync: bool,
    pub(crate) stream_id: Option<String>,
    pub(crate) transmission_mode: TransmissionMode,
    pub(crate) payload_size: Option<usize>,
    pub(crate) flow_window: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) peer_idle_timeout: Duration,
    pub(crate) latency: Duration,
    pub(crate) max_bandwidth: u64,
    pub(crate) linger: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketOptions {
    /// Blocking sockets in live mode.
    pub fn new() -> Self {
        Self {
            read_sync: true,
            write_sync: true,
            stream_id: None,
            transmission_mode: TransmissionMode::Live,
            payload_size: None,
            flow_window: DEFAULT_FLOW_WINDOW,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            peer_idle_timeout: DEFAULT_PEER_IDLE_TIMEOUT,
            latency: DEFAULT_LATENCY,
            max_bandwidth: 0,
            linger: DEFAULT_LINGER,
        }
    }

    /// Whether `accept`, `connect` and reads block.
    pub fn read_sync(mut self, blocking: bool) -> Self {
        self.read_sync = blocking;
        self
    }

    /// Whether writes block while the flow window is full.
    pub fn write_sync(mut self, blocking: bool) -> Self {
        self.write_sync = blocking;
        self
    }

    /// Shorthand for setting both [`read_sync`](Self::read_sync) and
    /// [`write_sync`](Self::write_sync).
    pub fn blocking(self, blocking: bool) -> Self {
        self.read_sync(blocking).write_sync(blocking)
    }

    /// Stream identifier sent with the connection request.
    ///
    /// Fails with [`SrtError::InvalidArgument`] above 512 bytes.
    pub fn stream_id(mut self, stream_id: impl Into<String>) -> SrtResult<Self> {
        let stream_id = stream_id.into();
        validate_stream_id(&stream_id)?;
        self.stream_id = Some(stream_id);
        Ok(self)
    }

    /// Stream identifier encoded from components.
    pub fn stream_id_components(self, components: &StreamIdComponents) -> SrtResult<Self> {
        self.stream_id(components.encode())
    }

    /// Transmission profile.
    pub fn transmission_mode(mut self, mode: TransmissionMode) -> Self {
        self.transmission_mode = mode;
        self
    }

    /// Payload bytes per packet, overriding the mode default.
    pub fn payload_size(mut self, size: usize) -> SrtResult<Self> {
        if size == 0 || size > MAX_PAYLOAD_SIZE {
            return Err(SrtError::InvalidArgument(format!(
                "payload size must be within 1..={MAX_PAYLOAD_SIZE}, got {size}"
            )));
        }
        self.payload_size = Some(size);
        Ok(self)
    }

    /// Maximum unacknowledged packets in flight.
    pub fn flow_window(mut self, packets: usize) -> Self {
        self.flow_window = packets.max(1);
        self
    }

    /// How long `connect` waits for the listener.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Silence after which a connection is considered broken.
    pub fn peer_idle_timeout(mut self, timeout: Duration) -> Self {
        self.peer_idle_timeout = timeout;
        self
    }

    /// Receiver latency reported in statistics.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Bandwidth ceiling in bytes per second, zero for unlimited.
    ///
    /// New data is paced to this rate after a short burst; retransmissions
    /// are not held back. Blocking writes wait while paced data is queued.
    pub fn max_bandwidth(mut self, bytes_per_second: u64) -> Self {
        self.max_bandwidth = bytes_per_second;
        self
    }

    /// How long a closed socket keeps retransmitting data the peer has not
    /// acknowledged yet. Zero drops it at once.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Effective payload size.
    pub fn payload_size_or_default(&self) -> usize {
        self.payload_size
            .unwrap_or_else(|| self.transmission_mode.default_payload_size())
    }

    pub(crate) fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            payload_size: self.payload_size_or_default(),
            flow_window: self.flow_window,
            connect_timeout: self.connect_timeout,
            peer_idle_timeout: self.peer_idle_timeout,
            latency: self.latency,
            max_bandwidth: self.max_bandwidth,
        }
    }
}

pub(crate) fn validate_stream_id(stream_id: &str) -> SrtResult<()> {
    if stream_id.len() > MAX_STREAM_ID_LEN {
        return Err(SrtError::InvalidArgument(format!(
            "stream id is {} bytes, at most {MAX_STREAM_ID_LEN} allowed",
            stream_id.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SocketOptions::default();
        assert!(options.read_sync);
        assert!(options.write_sync);
        assert_eq!(options.transmission_mode, TransmissionMode::Live);
        assert_eq!(options.payload_size_or_default(), LIVE_PAYLOAD_SIZE);
        assert_eq!(options.linger, DEFAULT_LINGER);
        assert_eq!(options.connection_settings().max_bandwidth, 0);
    }

    #[test]
    fn test_builder() {
        let options = SocketOptions::new()
            .blocking(false)
            .transmission_mode(TransmissionMode::File)
            .flow_window(0)
            .payload_size(1000)
            .unwrap();
        assert!(!options.read_sync);
        assert!(!options.write_sync);
        assert_eq!(options.flow_window, 1);
        assert_eq!(options.connection_settings().payload_size, 1000);
    }

    #[test]
    fn test_stream_id_limit() {
        assert!(SocketOptions::new().stream_id("a".repeat(512)).is_ok());
        assert!(matches!(
            SocketOptions::new().stream_id("a".repeat(513)),
            Err(SrtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_payload_size_bounds() {
        assert!(SocketOptions::new().payload_size(0).is_err());
        assert!(SocketOptions::new().payload_size(MAX_PAYLOAD_SIZE + 1).is_err());
    }

    #[test]
    fn test_transmission_mode_parse() {
        assert_eq!("file".parse::<TransmissionMode>().unwrap(), TransmissionMode::File);
        assert!("udp".parse::<TransmissionMode>().is_err());
        assert_eq!(TransmissionMode::Live.to_string(), "live");
    }
}
