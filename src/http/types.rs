//! Core HTTP protocol types and utilities

use std::{fmt, ops::Range};

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

/// Trims ASCII whitespace on both sides, the way header names and values are trimmed.
#[inline(always)]
pub(crate) fn trim(src: &[u8]) -> &[u8] {
    let start = src
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(src.len());
    let end = src
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);

    &src[start..end]
}

/// Checks a comma separated header value for `token` (case-insensitive).
#[inline]
pub(crate) fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

// VERSION

/// HTTP protocol version of a request.
///
/// Only major version `1` is ever produced by the parser; the minor
/// version is kept as sent (`HTTP/1.0`, `HTTP/1.1`, ...).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    major: u16,
    minor: u16,
}

impl Version {
    /// `HTTP/1.0`
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    /// `HTTP/1.1`
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    #[inline(always)]
    pub(crate) const fn new(major: u16, minor: u16) -> Self {
        Version { major, minor }
    }

    #[inline(always)]
    pub const fn major(&self) -> u16 {
        self.major
    }

    #[inline(always)]
    pub const fn minor(&self) -> u16 {
        self.minor
    }

    /// `HTTP/1.0` connections close by default unless `keep-alive` is negotiated.
    #[inline(always)]
    pub const fn is_http10(&self) -> bool {
        self.major == 1 && self.minor == 0
    }
}

impl Default for Version {
    #[inline(always)]
    fn default() -> Self {
        Version::HTTP_11
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP status codes
        ///
        /// Represents valid HTTP status codes as defined in
        /// [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15) and other standards.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            /// Returns the status line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            ///
            /// Responses always carry `HTTP/1.1`, whatever minor version the request used.
            #[inline]
            pub(crate) const fn status_line(&self) -> &'static [u8] {
                match self { $(
                    StatusCode::$name => concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes(),
                )+ }
            }

            /// Returns the canonical reason phrase (e.g., `"Not Found"`).
            #[inline]
            pub const fn reason(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            /// Looks up a status code by its numeric value.
            #[inline]
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }
    }
}

impl StatusCode {
    /// Returns the numeric value (e.g., `404`).
    #[inline(always)]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NonAuthoritativeInformation = (203, "Non-Authoritative Information");
    NoContent = (204, "No Content");
    ResetContent = (205, "Reset Content");
    PartialContent = (206, "Partial Content");

    MultipleChoices = (300, "Multiple Choices");
    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    NotAcceptable = (406, "Not Acceptable");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PreconditionFailed = (412, "Precondition Failed");
    PayloadTooLarge = (413, "Request Entity Too Large");
    UriTooLong = (414, "Request URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    ExpectationFailed = (417, "Expectation Failed");
    UnprocessableEntity = (422, "Unprocessable Entity");
    UpgradeRequired = (426, "Upgrade Required");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

// HEADER NAME

#[inline(always)]
const fn is_token_byte(byte: u8) -> bool {
    matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
    ) || byte.is_ascii_alphanumeric()
}

/// Appends the canonical form of a header name to `dst`.
///
/// The first letter and every letter following a `-` are upper-cased, the
/// rest lower-cased (`content-TYPE` -> `Content-Type`). A name holding any
/// byte that is not a valid token character is appended unchanged.
pub(crate) fn push_canonical(dst: &mut String, name: &str) {
    if !name.bytes().all(is_token_byte) {
        dst.push_str(name);
        return;
    }

    let mut upper = true;
    for byte in name.bytes() {
        let c = match upper {
            true => byte.to_ascii_uppercase(),
            false => byte.to_ascii_lowercase(),
        };
        dst.push(c as char);
        upper = byte == b'-';
    }
}

// HEADER MAP

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: Range<usize>,
    value: Range<usize>,
}

/// Header multimap with canonicalized names.
///
/// Values keep their insertion order, both per name and across names. All
/// text lives in a single string arena so a cleared map refills without
/// allocating once it has warmed up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    arena: String,
    entries: Vec<Entry>,
}

impl HeaderMap {
    #[inline(always)]
    pub(crate) fn with_capacity(headers: usize, bytes: usize) -> Self {
        Self {
            arena: String::with_capacity(bytes),
            entries: Vec::with_capacity(headers),
        }
    }

    /// Creates an empty map.
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every header while keeping the allocated storage.
    #[inline(always)]
    pub fn clear(&mut self) {
        self.arena.clear();
        self.entries.clear();
    }

    /// Heap bytes held by the map, text arena and entry table together.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.arena.capacity() + self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    /// Number of stored values (a name with two values counts twice).
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a value, keeping the values already stored under `name`.
    pub fn append(&mut self, name: &str, value: &str) {
        let start = self.arena.len();
        push_canonical(&mut self.arena, name);
        let middle = self.arena.len();
        self.arena.push_str(value);

        self.entries.push(Entry {
            name: start..middle,
            value: middle..self.arena.len(),
        });
    }

    /// Replaces all values of `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.append(name, value);
    }

    /// Removes all values of `name`, returning whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        let arena = &self.arena;
        self.entries
            .retain(|e| !arena[e.name.clone()].eq_ignore_ascii_case(name));

        before != self.entries.len()
    }

    /// Returns the first value of `name` (case-insensitive).
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| self.arena[e.name.clone()].eq_ignore_ascii_case(name))
            .map(|e| &self.arena[e.value.clone()])
    }

    /// Returns every value of `name` in insertion order.
    #[inline]
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| self.arena[e.name.clone()].eq_ignore_ascii_case(name))
            .map(move |e| &self.arena[e.value.clone()])
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Checks whether any value of `name` carries `token` in its comma
    /// separated list (e.g. `Connection: keep-alive, Upgrade`).
    #[inline]
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| contains_token(value, token))
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries
            .iter()
            .map(|e| (&self.arena[e.name.clone()], &self.arena[e.value.clone()]))
    }

    /// Appends every entry of `other` (used for chunked trailers).
    pub(crate) fn extend_from(&mut self, other: &HeaderMap) {
        for (name, value) in other.iter() {
            let start = self.arena.len();
            self.arena.push_str(name);
            let middle = self.arena.len();
            self.arena.push_str(value);

            self.entries.push(Entry {
                name: start..middle,
                value: middle..self.arena.len(),
            });
        }
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn canonical_names() {
        #[rustfmt::skip]
        let cases = [
            ("content-type",      "Content-Type"),
            ("CONTENT-LENGTH",    "Content-Length"),
            ("x-forwarded-for",   "X-Forwarded-For"),
            ("host",              "Host"),
            ("te",                "Te"),
            ("x--double",         "X--Double"),
            ("with space",        "with space"),
            ("Mixed_Under_Score", "Mixed_under_score"),
        ];

        for (name, expected) in cases {
            let mut dst = String::new();
            push_canonical(&mut dst, name);
            assert_eq!(dst, expected);
        }
    }

    #[test]
    fn header_map_multi_values() {
        let mut map = HeaderMap::new();
        map.append("accept", "text/html");
        map.append("Host", "example.com");
        map.append("ACCEPT", "application/json");

        assert_eq!(map.len(), 3);
        assert_eq!(map.get("Accept"), Some("text/html"));
        assert_eq!(
            map.get_all("accept").collect::<Vec<_>>(),
            ["text/html", "application/json"]
        );
        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            [
                ("Accept", "text/html"),
                ("Host", "example.com"),
                ("Accept", "application/json"),
            ]
        );

        let value = {
            let name = String::from("HOST");
            map.get(&name)
        };
        assert_eq!(value, Some("example.com"));

        map.set("accept", "*/*");
        assert_eq!(map.get_all("Accept").collect::<Vec<_>>(), ["*/*"]);
        assert!(map.remove("host"));
        assert!(!map.contains("Host"));

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn tokens() {
        let mut map = HeaderMap::new();
        map.append("Connection", "Upgrade, Keep-Alive");

        assert!(map.has_token("connection", "keep-alive"));
        assert!(map.has_token("connection", "upgrade"));
        assert!(!map.has_token("connection", "close"));
        assert!(!map.has_token("x-missing", "close"));
    }

    #[test]
    fn numbers_and_trim() {
        assert_eq!(slice_to_usize(b"123"), Some(123));
        assert_eq!(slice_to_usize(b""), None);
        assert_eq!(slice_to_usize(b"-1"), None);
        assert_eq!(slice_to_usize(b"99999999999999999999999"), None);

        assert_eq!(trim(b"  value \t"), b"value");
        assert_eq!(trim(b"   "), b"");
    }

    #[test]
    fn status_lines() {
        assert_eq!(StatusCode::Created.status_line(), b"HTTP/1.1 201 Created\r\n");
        assert_eq!(StatusCode::from_u16(431), Some(StatusCode::RequestHeaderFieldsTooLarge));
        assert_eq!(StatusCode::from_u16(299), None);
        assert_eq!(StatusCode::NotFound.to_string(), "404 Not Found");
    }
}
