//! Text and field-map codec for [`StreamIdComponents`].
//!
//! Three text forms are recognized when decoding:
//!
//! ```text
//! #!::r=live/cam1,u=alice,m=publish     structured key=value list
//! srt://media.example/live/cam1?u=alice URI (host + path + query)
//! cam1                                  anything else: the resource name
//! ```

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use url::Url;

use super::components::StreamIdComponents;
use crate::core::constants::STREAM_ID_PREFIX;

/// Input accepted by [`StreamIdComponents::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamIdInput<'a> {
    /// Stream identifier text in any recognized form.
    Text(&'a str),
    /// Named fields; accepts both long names and wire keys.
    Fields(Vec<(String, String)>),
}

impl<'a> From<&'a str> for StreamIdInput<'a> {
    fn from(text: &'a str) -> Self {
        Self::Text(text)
    }
}

impl<'a> From<&'a String> for StreamIdInput<'a> {
    fn from(text: &'a String) -> Self {
        Self::Text(text.as_str())
    }
}

impl From<Vec<(String, String)>> for StreamIdInput<'_> {
    fn from(fields: Vec<(String, String)>) -> Self {
        Self::Fields(fields)
    }
}

impl StreamIdComponents {
    /// Decode components from text or a field map.
    ///
    /// Decoding never fails: malformed fragments are skipped and unknown
    /// mode or type values leave the defaults in place.
    pub fn decode<'a>(input: impl Into<StreamIdInput<'a>>) -> Self {
        match input.into() {
            StreamIdInput::Text(text) => Self::parse(text),
            StreamIdInput::Fields(fields) => Self::from_fields(fields),
        }
    }

    /// Decode components from stream identifier text.
    pub fn parse(text: &str) -> Self {
        let mut components = Self::default();
        if text.is_empty() {
            return components;
        }

        if let Some(body) = text.strip_prefix(STREAM_ID_PREFIX) {
            for fragment in split_fragments(body) {
                if let Some((key, value)) = fragment.split_once('=') {
                    if is_valid_key(key) && !value.is_empty() {
                        components.merge(key, value);
                    }
                }
            }
            return components;
        }

        match Url::parse(text) {
            Ok(url) if url.host_str().is_some_and(|host| !host.is_empty()) => {
                if let Some(host) = url.host_str() {
                    components.host_name = Some(host.to_string());
                }
                let path = percent_decode_str(url.path().trim_start_matches('/'))
                    .decode_utf8_lossy();
                if !path.is_empty() {
                    components.resource_name = Some(path.into_owned());
                }
                for (key, value) in url.query_pairs() {
                    components.merge_field(&key, &value);
                }
            }
            _ => components.resource_name = Some(text.to_string()),
        }
        components
    }

    /// Decode components from named fields.
    ///
    /// Long names (`resource_name`, `user_name`, `mode`, `host_name`,
    /// `type`, `session_id`) and wire keys (`r`, `u`, `m`, `h`, `t`, `s`)
    /// are both understood; other keys become extension fields.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut components = Self::default();
        for (key, value) in fields {
            components.merge_field(key.as_ref(), value.as_ref());
        }
        components
    }

    /// Encode to the `#!::` form.
    ///
    /// Fields appear in the order `r, u, m, h, t, s`, followed by extension
    /// fields in insertion order. Mode and type are always present; fields
    /// with an empty value are left out, since decoding drops them anyway.
    pub fn encode(&self) -> String {
        let mut pairs: Vec<(&str, &str)> = Vec::new();
        if let Some(resource) = &self.resource_name {
            pairs.push(("r", resource));
        }
        if let Some(user) = &self.user_name {
            pairs.push(("u", user));
        }
        pairs.push(("m", self.mode.as_str()));
        if let Some(host) = &self.host_name {
            pairs.push(("h", host));
        }
        pairs.push(("t", self.stream_type.as_str()));
        if let Some(session) = &self.session_id {
            pairs.push(("s", session));
        }
        pairs.extend(self.extra());

        let body = pairs
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{key}={}", escape(value)))
            .collect::<Vec<_>>()
            .join(",");
        format!("{STREAM_ID_PREFIX}{body}")
    }

    fn merge_field(&mut self, key: &str, value: &str) {
        let key = match key {
            "resource_name" => "r",
            "user_name" => "u",
            "mode" => "m",
            "host_name" => "h",
            "type" | "stream_type" => "t",
            "session_id" | "sessionid" => "s",
            "" => return,
            other => other,
        };
        self.merge(key, value);
    }

    fn merge(&mut self, key: &str, value: &str) {
        match key {
            "r" => self.resource_name = Some(value.to_string()),
            "u" => self.user_name = Some(value.to_string()),
            "m" => {
                if let Ok(mode) = value.parse() {
                    self.mode = mode;
                }
            }
            "h" => match value.split_once('/') {
                Some((host, resource)) => {
                    self.host_name = Some(host.to_string());
                    // An explicit `r` wins whichever comes first.
                    if self.resource_name.is_none() && !resource.is_empty() {
                        self.resource_name = Some(resource.to_string());
                    }
                }
                None => self.host_name = Some(value.to_string()),
            },
            "t" => {
                if let Ok(stream_type) = value.parse() {
                    self.stream_type = stream_type;
                }
            }
            "s" => self.session_id = Some(value.to_string()),
            _ => self.set(key, value),
        }
    }
}

impl FromStr for StreamIdComponents {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for StreamIdComponents {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

impl fmt::Display for StreamIdComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Split the body at unescaped commas, resolving `\x` escapes.
fn split_fragments(body: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.push(chars.next().unwrap_or('\\')),
            ',' => fragments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fragments.push(current);
    fragments
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == ',' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamid::{StreamMode, StreamType};

    const SAMPLE: &str = "#!::r=foobar,u=admin,h=stream.recce.nl,s=12345,t=stream,m=publish";

    #[test]
    fn test_parse_prefixed() {
        let components = StreamIdComponents::parse(SAMPLE);
        assert_eq!(components.resource_name.as_deref(), Some("foobar"));
        assert_eq!(components.user_name.as_deref(), Some("admin"));
        assert_eq!(components.host_name.as_deref(), Some("stream.recce.nl"));
        assert_eq!(components.session_id.as_deref(), Some("12345"));
        assert_eq!(components.stream_type, StreamType::Stream);
        assert_eq!(components.mode, StreamMode::Publish);
    }

    #[test]
    fn test_encode_order() {
        let components = StreamIdComponents::parse(SAMPLE);
        assert_eq!(
            components.encode(),
            "#!::r=foobar,u=admin,m=publish,h=stream.recce.nl,t=stream,s=12345"
        );
    }

    #[test]
    fn test_uri_path_is_percent_decoded() {
        let components = StreamIdComponents::parse("srt://media.example/my%20cam?u=al%69ce");
        assert_eq!(components.host_name.as_deref(), Some("media.example"));
        assert_eq!(components.resource_name.as_deref(), Some("my cam"));
        assert_eq!(components.user_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_empty_fields_are_not_encoded() {
        let mut components = StreamIdComponents::new()
            .with_resource_name("")
            .with_user_name("bob");
        components.set("note", "");

        let encoded = components.encode();
        assert_eq!(encoded, "#!::u=bob,m=request,t=stream");

        let decoded = StreamIdComponents::parse(&encoded);
        assert_eq!(decoded.resource_name, None);
        assert_eq!(decoded.user_name.as_deref(), Some("bob"));
        assert_eq!(decoded.get("note"), None);
    }

    #[test]
    fn test_round_trip_with_extras() {
        let mut components = StreamIdComponents::new()
            .with_resource_name("live/cam,1")
            .with_user_name("alice")
            .with_mode(StreamMode::Bidirectional)
            .with_stream_type(StreamType::File);
        components.set("token", "a\\b");
        components.set("region", "eu");

        let decoded = StreamIdComponents::parse(&components.encode());
        assert_eq!(decoded, components);
    }

    #[test]
    fn test_encode_defaults() {
        assert_eq!(StreamIdComponents::new().encode(), "#!::m=request,t=stream");
    }

    #[test]
    fn test_host_path_precedence() {
        let components = StreamIdComponents::parse("#!::h=host/path");
        assert_eq!(components.host_name.as_deref(), Some("host"));
        assert_eq!(components.resource_name.as_deref(), Some("path"));

        let components = StreamIdComponents::parse("#!::h=host/path,r=explicit");
        assert_eq!(components.host_name.as_deref(), Some("host"));
        assert_eq!(components.resource_name.as_deref(), Some("explicit"));

        let components = StreamIdComponents::parse("#!::r=explicit,h=host/path");
        assert_eq!(components.resource_name.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_invalid_enums_keep_defaults() {
        let components = StreamIdComponents::parse("#!::m=foobar,t=video");
        assert_eq!(components.mode, StreamMode::Request);
        assert_eq!(components.stream_type, StreamType::Stream);
    }

    #[test]
    fn test_non_prefixed_is_resource() {
        let components = StreamIdComponents::parse("mystream00");
        assert_eq!(components.resource_name.as_deref(), Some("mystream00"));
        assert_eq!(components.host_name, None);

        let components = StreamIdComponents::parse("live/stream");
        assert_eq!(components.resource_name.as_deref(), Some("live/stream"));
    }

    #[test]
    fn test_uri_form() {
        let components =
            StreamIdComponents::parse("srt://media.example:9000/live/cam1?u=alice&m=publish&x=1");
        assert_eq!(components.host_name.as_deref(), Some("media.example"));
        assert_eq!(components.resource_name.as_deref(), Some("live/cam1"));
        assert_eq!(components.user_name.as_deref(), Some("alice"));
        assert_eq!(components.mode, StreamMode::Publish);
        assert_eq!(components.get("x"), Some("1"));
    }

    #[test]
    fn test_malformed_fragments_skipped() {
        let components = StreamIdComponents::parse("#!::garbage,r=ok,=novalue,k=,bad key=1,u=bob");
        assert_eq!(components.resource_name.as_deref(), Some("ok"));
        assert_eq!(components.user_name.as_deref(), Some("bob"));
        assert_eq!(components.extra().count(), 0);
    }

    #[test]
    fn test_unknown_keys_go_to_extra() {
        let components = StreamIdComponents::parse("#!::r=a,R=upper,foo-bar=baz,x_1=2");
        assert_eq!(components.resource_name.as_deref(), Some("a"));
        assert_eq!(components.get("R"), Some("upper"));
        assert_eq!(components.get("foo-bar"), Some("baz"));
        assert_eq!(components.get("x_1"), Some("2"));
        assert_eq!(components.get("missing"), None);
    }

    #[test]
    fn test_value_keeps_equals() {
        let components = StreamIdComponents::parse("#!::s=a=b=c");
        assert_eq!(components.session_id.as_deref(), Some("a=b=c"));
    }

    #[test]
    fn test_from_fields() {
        let components = StreamIdComponents::from_fields([
            ("resource_name", "foo"),
            ("user_name", "bar"),
            ("mode", "publish"),
            ("type", "file"),
            ("sessionid", "42"),
            ("custom", "value"),
        ]);
        assert_eq!(components.resource_name.as_deref(), Some("foo"));
        assert_eq!(components.user_name.as_deref(), Some("bar"));
        assert_eq!(components.mode, StreamMode::Publish);
        assert_eq!(components.stream_type, StreamType::File);
        assert_eq!(components.session_id.as_deref(), Some("42"));
        assert_eq!(components.get("custom"), Some("value"));
    }

    #[test]
    fn test_from_fields_resource_precedence() {
        let components =
            StreamIdComponents::from_fields([("h", "host/derived"), ("resource_name", "explicit")]);
        assert_eq!(components.host_name.as_deref(), Some("host"));
        assert_eq!(components.resource_name.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_decode_input_variants() {
        let text = StreamIdComponents::decode("#!::u=admin");
        assert_eq!(text.user_name.as_deref(), Some("admin"));

        let fields = StreamIdComponents::decode(vec![("u".to_string(), "admin".to_string())]);
        assert_eq!(fields, text);

        let parsed: StreamIdComponents = "#!::u=admin".parse().unwrap();
        assert_eq!(parsed, text);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(StreamIdComponents::parse(""), StreamIdComponents::default());
    }

    #[test]
    fn test_legacy_prefix_is_literal() {
        let components = StreamIdComponents::parse("!#::r=foo");
        assert_eq!(components.resource_name.as_deref(), Some("!#::r=foo"));
    }
}
