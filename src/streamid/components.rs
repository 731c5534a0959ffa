//! Structured view of a stream identifier.

use std::fmt;
use std::str::FromStr;

/// What the caller intends to do with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamMode {
    /// Receive the stream (default).
    #[default]
    Request,
    /// Send the stream.
    Publish,
    /// Both directions.
    Bidirectional,
}

impl StreamMode {
    /// Wire text of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Publish => "publish",
            Self::Bidirectional => "bidirectional",
        }
    }
}

impl FromStr for StreamMode {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(Self::Request),
            "publish" => Ok(Self::Publish),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of payload the connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamType {
    /// Live media stream (default).
    #[default]
    Stream,
    /// File transfer.
    File,
    /// Authentication exchange.
    Auth,
}

impl StreamType {
    /// Wire text of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::File => "file",
            Self::Auth => "auth",
        }
    }
}

impl FromStr for StreamType {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Self::Stream),
            "file" => Ok(Self::File),
            "auth" => Ok(Self::Auth),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text that is not one of the accepted enumeration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value: {0:?}")]
pub struct UnknownValue(pub String);

/// Fields of a stream identifier.
///
/// The fixed fields cover the well-known keys (`r`, `u`, `m`, `h`, `t`,
/// `s`); every other key lands in an ordered extension map reachable through
/// [`get`](Self::get) and [`set`](Self::set).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamIdComponents {
    /// Resource (stream) name, key `r`.
    pub resource_name: Option<String>,
    /// User name, key `u`.
    pub user_name: Option<String>,
    /// Mode, key `m`.
    pub mode: StreamMode,
    /// Host name, key `h`.
    pub host_name: Option<String>,
    /// Stream type, key `t`.
    pub stream_type: StreamType,
    /// Session identifier, key `s`.
    pub session_id: Option<String>,
    extra: Vec<(String, String)>,
}

impl StreamIdComponents {
    /// Empty components with default mode and type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resource name.
    pub fn with_resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    /// Set the user name.
    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    /// Set the mode.
    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the host name.
    pub fn with_host_name(mut self, host: impl Into<String>) -> Self {
        self.host_name = Some(host.into());
        self
    }

    /// Set the stream type.
    pub fn with_stream_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }

    /// Set the session identifier.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Value of an extension key, `None` when absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an extension key; an existing key keeps its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.extra.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.extra.push((key, value)),
        }
    }

    /// Remove an extension key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.extra.iter().position(|(k, _)| k == key)?;
        Some(self.extra.remove(index).1)
    }

    /// Extension entries in insertion order.
    pub fn extra(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
