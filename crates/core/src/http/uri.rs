//! URL parsing and encoding helpers.

use std::sync::LazyLock;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;

/// A URL split into its components. Every component is optional; relative
/// references parse into just a path and query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    /// Scheme without the trailing colon.
    pub scheme: Option<String>,
    /// User information before the `@`.
    pub userinfo: Option<String>,
    /// Host name or address.
    pub host: Option<String>,
    /// Port, when explicitly given.
    pub port: Option<u16>,
    /// Path, possibly empty.
    pub path: Option<String>,
    /// Query string without the leading `?`.
    pub query: Option<String>,
}

static URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:([a-zA-Z][a-zA-Z0-9+.-]*)://(?:([^@/?#]+)@)?([^:/?#]*)(?::(\d+))?)?([^?#]*)(?:\?([^#]*))?",
    )
    .expect("uri regex")
});

static RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^bytes=(\d+)-(\d*)$").expect("range regex"));

/// Splits a URL or request target into components.
pub fn parse_uri(uri: &str) -> Uri {
    let Some(captures) = URI.captures(uri) else {
        return Uri::default();
    };
    let group = |index: usize| captures.get(index).map(|m| m.as_str().to_owned());
    let nonempty = |value: Option<String>| value.filter(|text| !text.is_empty());
    Uri {
        scheme: group(1),
        userinfo: group(2),
        host: nonempty(group(3)),
        port: captures.get(4).and_then(|m| m.as_str().parse().ok()),
        path: nonempty(group(5)),
        query: group(6),
    }
}

/// Decodes an `application/x-www-form-urlencoded` query into ordered
/// key/value pairs.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encodes a single URI component.
pub fn encode_uri_component(text: &str) -> String {
    utf8_percent_encode(text, COMPONENT).to_string()
}

/// Serializes key/value pairs as an `application/x-www-form-urlencoded`
/// body.
pub fn form_data_to_string<'a>(
    params: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    serializer.extend_pairs(params);
    serializer.finish()
}

/// A decoded `Range` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Range {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset, inclusive; `None` for an open-ended range.
    pub end: Option<u64>,
}

/// Parses a `bytes=start-end` range value.
pub fn parse_range(value: &str) -> Option<Range> {
    let captures = RANGE.captures(value)?;
    let start = captures[1].parse().ok()?;
    let end = match &captures[2] {
        "" => None,
        text => Some(text.parse().ok()?),
    };
    Some(Range { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_uris() {
        let uri = parse_uri("https://user@example.com:8443/a/b?x=1&y=2");
        assert_eq!(uri.scheme.as_deref(), Some("https"));
        assert_eq!(uri.userinfo.as_deref(), Some("user"));
        assert_eq!(uri.host.as_deref(), Some("example.com"));
        assert_eq!(uri.port, Some(8443));
        assert_eq!(uri.path.as_deref(), Some("/a/b"));
        assert_eq!(uri.query.as_deref(), Some("x=1&y=2"));
    }

    #[test]
    fn parses_relative_targets() {
        let uri = parse_uri("/some_path?some_query=value");
        assert_eq!(uri.scheme, None);
        assert_eq!(uri.host, None);
        assert_eq!(uri.path.as_deref(), Some("/some_path"));
        assert_eq!(uri.query.as_deref(), Some("some_query=value"));
    }

    #[test]
    fn query_round_trips() {
        let encoded = form_data_to_string([("key", "value with spaces"), ("a", "b&c")]);
        let decoded = parse_query(&encoded);
        assert_eq!(
            decoded,
            vec![
                ("key".to_owned(), "value with spaces".to_owned()),
                ("a".to_owned(), "b&c".to_owned()),
            ]
        );
    }

    #[test]
    fn component_encoding_escapes_reserved_characters() {
        assert_eq!(encode_uri_component("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_uri_component("safe-._~"), "safe-._~");
    }

    #[test]
    fn range_values_parse() {
        assert_eq!(
            parse_range("bytes=0-499"),
            Some(Range {
                start: 0,
                end: Some(499)
            })
        );
        assert_eq!(parse_range("bytes=500-"), Some(Range {
            start: 500,
            end: None
        }));
        assert_eq!(parse_range("chunks=1-2"), None);
    }
}
