//! Stream identifier metadata.
//!
//! A caller attaches a stream identifier to its connection request; the
//! listener reads it during or after the handshake to decide what the
//! connection is for. [`StreamIdComponents`] is the structured form.
//!
//! ```rust
//! use srt_session::streamid::{StreamIdComponents, StreamMode};
//!
//! let components = StreamIdComponents::new()
//!     .with_resource_name("live/cam1")
//!     .with_user_name("alice")
//!     .with_mode(StreamMode::Publish);
//!
//! let text = components.encode();
//! assert_eq!(text, "#!::r=live/cam1,u=alice,m=publish,t=stream");
//! assert_eq!(StreamIdComponents::parse(&text), components);
//! ```

mod codec;
mod components;

pub use codec::StreamIdInput;
pub use components::{StreamIdComponents, StreamMode, StreamType, UnknownValue};
