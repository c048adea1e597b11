//! `Transfer-Encoding: chunked` body decoder
//!
//! ```text
//! 4\r\n            <- size line (hex, optional `;ext`)
//! Wiki\r\n         <- data + CRLF
//! 0\r\n            <- last chunk
//! Expires: 0\r\n   <- trailer fields (optional)
//! \r\n             <- end of message
//! ```

use crate::{
    errors::ErrorKind,
    http::{request::parse_header_line, types::HeaderMap},
};
use memchr::memmem;

const CRLF: &[u8] = b"\r\n";

/// Longest size line accepted before giving up on finding its CRLF.
const MAX_SIZE_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum State {
    #[default]
    Size,
    Data(usize),
    Trailer,
}

/// Decoder output for one complete chunked body.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunked {
    /// Body and trailers are filled; `usize` bytes were consumed from the body offset.
    Done(usize),
    NeedMoreData,
}

/// Resumable decoder for a chunked body starting at `buf[0]`.
///
/// Every complete chunk is appended to `body` exactly once. On
/// [`Chunked::NeedMoreData`] the decoder remembers where it stopped, so the
/// next call must see the same bytes followed by whatever arrived since.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Decoder {
    pos: usize,
    state: State,
    trailer_start: usize,
}

impl Decoder {
    /// Continues decoding `buf`. `max_body` bounds the decoded size and
    /// `max_trailers` the trailer section.
    pub(crate) fn decode(
        &mut self,
        buf: &[u8],
        body: &mut Vec<u8>,
        trailers: &mut HeaderMap,
        max_body: usize,
        max_trailers: usize,
    ) -> Result<Chunked, ErrorKind> {
        loop {
            let pos = self.pos;

            match self.state {
                State::Size => {
                    let Some(end) = memmem::find(&buf[pos..], CRLF) else {
                        if buf.len() - pos > MAX_SIZE_LINE {
                            return Err(ErrorKind::InvalidChunk);
                        }
                        return Ok(Chunked::NeedMoreData);
                    };

                    let size = parse_size(&buf[pos..pos + end])?;
                    self.pos = pos + end + CRLF.len();

                    if size == 0 {
                        self.trailer_start = self.pos;
                        self.state = State::Trailer;
                        continue;
                    }
                    if body.len().saturating_add(size) > max_body {
                        return Err(ErrorKind::BodyTooLarge);
                    }
                    self.state = State::Data(size);
                }
                State::Data(size) => {
                    let framed = size
                        .checked_add(CRLF.len())
                        .ok_or(ErrorKind::InvalidChunk)?;
                    if buf.len() - pos < framed {
                        return Ok(Chunked::NeedMoreData);
                    }

                    let data_end = pos + size;
                    if &buf[data_end..data_end + CRLF.len()] != CRLF {
                        return Err(ErrorKind::InvalidChunk);
                    }
                    body.extend_from_slice(&buf[pos..data_end]);

                    self.pos = pos + framed;
                    self.state = State::Size;
                }
                State::Trailer => {
                    let Some(end) = memmem::find(&buf[pos..], CRLF) else {
                        if buf.len() - self.trailer_start > max_trailers {
                            return Err(ErrorKind::HeaderTooLarge);
                        }
                        return Ok(Chunked::NeedMoreData);
                    };

                    let line = &buf[pos..pos + end];
                    self.pos = pos + end + CRLF.len();

                    if line.is_empty() {
                        return Ok(Chunked::Done(self.pos));
                    }
                    if self.pos - self.trailer_start > max_trailers {
                        return Err(ErrorKind::HeaderTooLarge);
                    }

                    let line = simdutf8::basic::from_utf8(line)
                        .map_err(|_| ErrorKind::InvalidEncoding)?;
                    let (name, value) = parse_header_line(line)?;
                    trailers.append(name, value);
                }
            }
        }
    }
}

/// Parses a chunk-size line, dropping any `;` extension.
#[inline]
fn parse_size(line: &[u8]) -> Result<usize, ErrorKind> {
    let digits = match memchr::memchr(b';', line) {
        Some(semi) => &line[..semi],
        None => line,
    };
    let digits = crate::http::types::trim(digits);

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ErrorKind::InvalidChunk);
    }

    // All bytes are ASCII hex digits at this point.
    let digits = std::str::from_utf8(digits).map_err(|_| ErrorKind::InvalidChunk)?;
    usize::from_str_radix(digits, 16).map_err(|_| ErrorKind::InvalidChunk)
}

#[cfg(test)]
mod chunked_tests {
    use super::*;
    use crate::tools::str_op;

    fn run_with(src: &[u8], max_body: usize) -> (Result<Chunked, ErrorKind>, Vec<u8>, HeaderMap) {
        let mut body = Vec::new();
        let mut trailers = HeaderMap::new();
        let result = Decoder::default().decode(src, &mut body, &mut trailers, max_body, 1024);
        (result, body, trailers)
    }

    fn run(src: &[u8]) -> (Result<Chunked, ErrorKind>, Vec<u8>, HeaderMap) {
        run_with(src, 1024)
    }

    #[test]
    fn wikipedia() {
        let src = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nNEXT";
        let (result, body, trailers) = run(src);

        assert_eq!(result, Ok(Chunked::Done(src.len() - 4)));
        assert_eq!(str_op(&body), "Wikipedia");
        assert!(trailers.is_empty());
    }

    #[test]
    fn trailers_and_extensions() {
        let src = b"4;name=value\r\nWiki\r\n0\r\nexpires: never\r\nX-Sum: 1\r\n\r\n";
        let (result, body, trailers) = run(src);

        assert_eq!(result, Ok(Chunked::Done(src.len())));
        assert_eq!(str_op(&body), "Wiki");
        assert_eq!(trailers.get("Expires"), Some("never"));
        assert_eq!(trailers.get("x-sum"), Some("1"));
    }

    #[test]
    fn need_more_data() {
        let full = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nA: b\r\n\r\n";

        for end in 0..full.len() {
            let (result, ..) = run(&full[..end]);
            assert_eq!(result, Ok(Chunked::NeedMoreData), "prefix {end}");
        }
    }

    #[test]
    fn resumes_where_it_stopped() {
        let full = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nA: b\r\n\r\n";
        let mut decoder = Decoder::default();
        let mut body = Vec::new();
        let mut trailers = HeaderMap::new();

        for end in 0..full.len() {
            let result = decoder.decode(&full[..end], &mut body, &mut trailers, 1024, 1024);
            assert_eq!(result, Ok(Chunked::NeedMoreData), "prefix {end}");
        }
        let result = decoder.decode(full, &mut body, &mut trailers, 1024, 1024);

        assert_eq!(result, Ok(Chunked::Done(full.len())));
        assert_eq!(str_op(&body), "Wikipedia");
        assert_eq!(trailers.len(), 1);
    }

    #[test]
    fn malformed() {
        #[rustfmt::skip]
        let cases: [(&[u8], usize, ErrorKind); 7] = [
            (b"\r\n",                   1024,       ErrorKind::InvalidChunk),
            (b"zz\r\n",                 1024,       ErrorKind::InvalidChunk),
            (b"-1\r\n",                 1024,       ErrorKind::InvalidChunk),
            (b"4\r\nWikiXX",            1024,       ErrorKind::InvalidChunk),
            (b"0\r\nbad trailer\r\n",   1024,       ErrorKind::InvalidHeader),
            (b"800\r\n",                1024,       ErrorKind::BodyTooLarge),
            (b"ffffffffffffffff\r\nab", usize::MAX, ErrorKind::InvalidChunk),
        ];

        for (src, max_body, expected) in cases {
            let (result, ..) = run_with(src, max_body);
            assert_eq!(result, Err(expected), "{:?}", str_op(src));
        }
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size(b"1a"), Ok(26));
        assert_eq!(parse_size(b"FF ; ext"), Ok(255));
        assert_eq!(parse_size(b"ffffffffffffffffffff"), Err(ErrorKind::InvalidChunk));
    }
}
