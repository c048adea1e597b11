use crate::{
    errors::ErrorKind,
    http::{
        chunked::{self, Chunked},
        types::{self, HeaderMap, Version},
    },
    limits::ConnLimits,
};
use memchr::memmem;
use std::{net::SocketAddr, ops::Range};

const CRLF: &str = "\r\n";
const SEPARATOR: &[u8] = b"\r\n\r\n";

/// Parsed HTTP/1.x request.
///
/// One value lives per connection and is refilled in place by
/// [`Request::parse`], so its strings and buffers are reused across
/// keep-alive requests.
///
/// # Input data requirements
///
/// #### Character encoding
///
/// The header section must be `UTF-8`, otherwise the request is rejected with
/// `400 Bad Request`. The body is arbitrary bytes.
///
/// #### General designations
/// - `SP`: ASCII space (0x20)
/// - `CRLF`: Carriage return + line feed (`"\r\n"`), **exactly this sequence required**
///
/// ## First line
/// ```text
/// [METHOD] SP [TARGET] SP "HTTP/" [MAJOR] "." [MINOR] CRLF
/// ```
/// - `[METHOD]`: any non-empty token, kept as sent (no whitelist)
/// - `[TARGET]`: `*`, an absolute path (`/a/b?c=d`), or an absolute URI
///   (`http://host/a/b`) which requires a non-empty `Host` header
/// - `[MAJOR]`: must be `1`
///
/// ## Header
/// ```text
/// [NAME] ":" [VALUE] CRLF
/// ```
/// Names and values are trimmed, names canonicalized (`content-type` becomes
/// `Content-Type`). Repeated names keep every value in arrival order.
///
/// ## Body
///
/// | Framing                      | Result                                            |
/// |------------------------------|---------------------------------------------------|
/// | `Content-Length: N`          | exactly `N` bytes after the header section        |
/// | `Transfer-Encoding: chunked` | decoded chunks, trailers merged into the headers  |
/// | neither                      | empty body                                        |
///
/// Both at once, or any transfer coding other than `identity`/`chunked`, is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    method: String,
    target: String,
    path: String,
    query: Option<Range<usize>>,
    query_buf: String,
    version: Version,

    headers: HeaderMap,
    trailers: HeaderMap,
    body: Vec<u8>,
    content_length: Option<usize>,
    chunked: bool,
    close: bool,

    pending: Option<PendingBody>,
    scratch: Vec<u8>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

/// Chunked body still arriving: where it starts and how far it was decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingBody {
    start: usize,
    decoder: chunked::Decoder,
}

/// Outcome of one [`Request::parse`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request was parsed from the first `consumed` bytes.
    Complete { consumed: usize, close_after: bool },
    /// The buffer holds only part of a request; retry once more bytes arrive.
    NeedMoreData,
}

impl Request {
    /// Creates an empty request ready for [`parse`](Self::parse).
    #[inline]
    pub fn new() -> Self {
        Request {
            method: String::with_capacity(8),
            target: String::with_capacity(64),
            path: String::with_capacity(64),
            headers: HeaderMap::with_capacity(16, 512),
            ..Default::default()
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.method.clear();
        self.target.clear();
        self.path.clear();
        self.query = None;
        self.query_buf.clear();
        self.version = Version::HTTP_11;

        self.headers.clear();
        self.trailers.clear();
        self.body.clear();
        self.content_length = None;
        self.chunked = false;
        self.close = false;
        self.pending = None;
    }
}

// Public API
impl Request {
    /// Request method exactly as sent (`GET`, `PURGE`, ...).
    #[inline(always)]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw request target (`/a%20b?c=d`).
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Percent-decoded path of the target, `*` for `OPTIONS *`.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string without the leading `?`.
    #[inline]
    pub fn query(&self) -> Option<&str> {
        let range = self.query.clone()?;
        Some(&self.query_buf[range])
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the first value of a header (case-insensitive).
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub fn host(&self) -> Option<&str> {
        self.headers.get("Host")
    }

    /// Request body; decoded payload for chunked requests.
    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Declared body length, `None` for chunked bodies.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Whether the connection closes after this request's response.
    #[inline(always)]
    pub const fn close_after(&self) -> bool {
        self.close
    }

    /// Address of the peer, when the request came from a socket.
    #[inline(always)]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

// Parser
impl Request {
    /// Attempts to parse one request from the front of `buf`.
    ///
    /// Never blocks and never consumes: on success the caller discards
    /// `consumed` bytes itself. Bytes after the request (pipelined data) are
    /// left untouched.
    ///
    /// When a chunked body is incomplete the head and the chunks decoded so
    /// far are kept, and the next call resumes after them. That call must
    /// receive the same bytes extended with the newly arrived ones.
    pub fn parse(&mut self, buf: &[u8], limits: &ConnLimits) -> Result<ParseStatus, ErrorKind> {
        if let Some(pending) = self.pending.take() {
            if pending.start <= buf.len() {
                return self.parse_chunked(buf, limits, pending);
            }
        }
        self.reset();

        if buf.is_empty() {
            return Ok(ParseStatus::NeedMoreData);
        }

        let header_end = match memmem::find(buf, SEPARATOR) {
            Some(end) if end > limits.max_header_bytes => return Err(ErrorKind::HeaderTooLarge),
            Some(end) => end,
            None if buf.len() > limits.max_header_bytes => return Err(ErrorKind::HeaderTooLarge),
            None => return Ok(ParseStatus::NeedMoreData),
        };

        let head = simdutf8::basic::from_utf8(&buf[..header_end])
            .map_err(|_| ErrorKind::InvalidEncoding)?;
        let mut lines = head.split(CRLF);

        let target = self.parse_request_line(lines.next().unwrap_or_default())?;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = parse_header_line(line)?;
            self.headers.append(name, value);
        }

        let chunked = transfer_encoding(&self.headers)?;
        let content_length = self.headers.get("Content-Length").filter(|v| !v.is_empty());
        if chunked && content_length.is_some() {
            return Err(ErrorKind::ConflictingLength);
        }

        let length = match content_length {
            Some(value) => types::slice_to_usize(value.trim().as_bytes())
                .ok_or(ErrorKind::InvalidContentLength)?,
            None => 0,
        };
        if length > limits.max_body_size {
            return Err(ErrorKind::BodyTooLarge);
        }

        self.resolve_target(target)?;
        self.close = self.should_close();

        let body_start = header_end + SEPARATOR.len();
        if chunked {
            self.chunked = true;
            let pending = PendingBody {
                start: body_start,
                decoder: chunked::Decoder::default(),
            };
            return self.parse_chunked(buf, limits, pending);
        }

        if buf.len() - body_start < length {
            return Ok(ParseStatus::NeedMoreData);
        }

        self.body.extend_from_slice(&buf[body_start..body_start + length]);
        self.content_length = Some(length);

        Ok(ParseStatus::Complete {
            consumed: body_start + length,
            close_after: self.close,
        })
    }

    /// Decodes (or keeps decoding) the chunked body starting at `pending.start`.
    fn parse_chunked(
        &mut self,
        buf: &[u8],
        limits: &ConnLimits,
        mut pending: PendingBody,
    ) -> Result<ParseStatus, ErrorKind> {
        let status = pending.decoder.decode(
            &buf[pending.start..],
            &mut self.body,
            &mut self.trailers,
            limits.max_body_size,
            limits.max_header_bytes,
        )?;

        match status {
            Chunked::Done(consumed) => {
                self.headers.extend_from(&self.trailers);
                Ok(ParseStatus::Complete {
                    consumed: pending.start + consumed,
                    close_after: self.close,
                })
            }
            Chunked::NeedMoreData => {
                self.pending = Some(pending);
                Ok(ParseStatus::NeedMoreData)
            }
        }
    }

    /// Splits `METHOD SP TARGET SP VERSION`, filling method and version.
    #[inline]
    fn parse_request_line<'a>(&mut self, line: &'a str) -> Result<&'a str, ErrorKind> {
        let mut parts = line.splitn(3, ' ');

        let (Some(method), Some(target), Some(proto)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ErrorKind::InvalidRequestLine);
        };
        if method.is_empty() {
            return Err(ErrorKind::InvalidMethod);
        }
        if proto.contains(' ') {
            return Err(ErrorKind::InvalidRequestLine);
        }

        self.version = parse_version(proto)?;
        self.method.push_str(method);

        Ok(target)
    }

    /// Fills `target`, `path` and `query` from the raw request target.
    fn resolve_target(&mut self, target: &str) -> Result<(), ErrorKind> {
        let target = if target.is_empty() { "/" } else { target };
        self.target.push_str(target);

        if target == "*" {
            self.path.push('*');
            return Ok(());
        }

        if target.starts_with('/') {
            let (path, query) = match memchr::memchr(b'?', target.as_bytes()) {
                Some(q) => (&target[..q], Some(&target[q + 1..])),
                None => (target, None),
            };
            self.set_path_query(path, query)
        } else if target.starts_with('*') {
            Err(ErrorKind::InvalidTarget)
        } else {
            if self.host().map_or(true, str::is_empty) {
                return Err(ErrorKind::MissingHost);
            }

            let url = url::Url::parse(target).map_err(|_| ErrorKind::InvalidTarget)?;
            if url.cannot_be_a_base() {
                return Err(ErrorKind::InvalidTarget);
            }
            self.set_path_query(url.path(), url.query())
        }
    }

    #[inline]
    fn set_path_query(&mut self, path: &str, query: Option<&str>) -> Result<(), ErrorKind> {
        percent_decode(path, &mut self.scratch)?;
        let decoded =
            simdutf8::basic::from_utf8(&self.scratch).map_err(|_| ErrorKind::InvalidTarget)?;
        self.path.push_str(decoded);

        if let Some(query) = query {
            self.query_buf.push_str(query);
            self.query = Some(0..query.len());
        }
        Ok(())
    }

    /// `Connection: close` always closes; HTTP/1.0 closes unless `keep-alive` is sent.
    #[inline]
    fn should_close(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return true;
        }
        if self.version.is_http10() {
            return !self.headers.has_token("Connection", "keep-alive");
        }
        false
    }
}

/// Parses `HTTP/<major>.<minor>` (prefix case-insensitive); only major `1` is accepted.
#[inline]
fn parse_version(proto: &str) -> Result<Version, ErrorKind> {
    let proto = proto.trim();

    let prefix = proto.get(..5).ok_or(ErrorKind::InvalidVersion)?;
    if !prefix.eq_ignore_ascii_case("HTTP/") {
        return Err(ErrorKind::InvalidVersion);
    }

    let (major, minor) = proto[5..]
        .split_once('.')
        .ok_or(ErrorKind::InvalidVersion)?;
    let major = types::slice_to_usize(major.as_bytes()).ok_or(ErrorKind::InvalidVersion)?;
    let minor = types::slice_to_usize(minor.as_bytes())
        .and_then(|minor| u16::try_from(minor).ok())
        .ok_or(ErrorKind::InvalidVersion)?;

    if major != 1 {
        return Err(ErrorKind::UnsupportedVersion);
    }

    Ok(Version::new(1, minor))
}

/// Splits a `name: value` line, trimming both halves.
#[inline]
pub(crate) fn parse_header_line(line: &str) -> Result<(&str, &str), ErrorKind> {
    let colon = match memchr::memchr(b':', line.as_bytes()) {
        Some(0) | None => return Err(ErrorKind::InvalidHeader),
        Some(colon) => colon,
    };

    let name = line[..colon].trim();
    if name.is_empty() {
        return Err(ErrorKind::InvalidHeader);
    }

    Ok((name, line[colon + 1..].trim()))
}

/// Validates every `Transfer-Encoding` value, returning whether the body is chunked.
///
/// `identity` codings are ignored; `chunked` must be the final coding.
fn transfer_encoding(headers: &HeaderMap) -> Result<bool, ErrorKind> {
    let mut values = headers.get_all("Transfer-Encoding").peekable();
    if values.peek().is_none() {
        return Ok(false);
    }

    let mut tokens = values
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .peekable();
    if tokens.peek().is_none() {
        return Err(ErrorKind::UnsupportedTransferEncoding);
    }

    let mut chunked = false;
    for token in tokens {
        if chunked {
            return Err(ErrorKind::UnsupportedTransferEncoding);
        }

        if token.eq_ignore_ascii_case("identity") {
            continue;
        } else if token.eq_ignore_ascii_case("chunked") {
            chunked = true;
        } else {
            return Err(ErrorKind::UnsupportedTransferEncoding);
        }
    }

    Ok(chunked)
}

/// Decodes `%XX` escapes of `src` into `dst`.
fn percent_decode(src: &str, dst: &mut Vec<u8>) -> Result<(), ErrorKind> {
    dst.clear();
    let bytes = src.as_bytes();
    let mut pos = 0;

    for escape in memchr::memchr_iter(b'%', bytes) {
        if escape < pos {
            continue;
        }
        dst.extend_from_slice(&bytes[pos..escape]);

        let hex = bytes
            .get(escape + 1..escape + 3)
            .ok_or(ErrorKind::InvalidTarget)?;
        let high = hex_value(hex[0]).ok_or(ErrorKind::InvalidTarget)?;
        let low = hex_value(hex[1]).ok_or(ErrorKind::InvalidTarget)?;

        dst.push(high << 4 | low);
        pos = escape + 3;
    }

    dst.extend_from_slice(&bytes[pos..]);
    Ok(())
}

#[inline(always)]
const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
