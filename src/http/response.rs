use crate::{
    http::types::{HeaderMap, StatusCode},
    limits::RespLimits,
    pool::Reusable,
    Request,
};
use std::{io, time::SystemTime};

/// Collects the status, headers and body produced by a handler.
///
/// Writers are pooled: one is attached to every request [`Context`](crate::Context)
/// and fully reset before it is handed out again.
///
/// # Status
///
/// The first [`write_header`](Self::write_header) call wins, later calls are
/// ignored. Writing body bytes before any explicit status commits `200 OK`.
///
/// A writer sealed by the timeout middleware ignores every further write, so a
/// handler that keeps running past its deadline cannot alter the `504`.
///
/// # Examples
/// ```
/// use buff_web::{ResponseWriter, StatusCode};
///
/// let mut w = ResponseWriter::new();
/// w.write_header(StatusCode::Created);
/// w.set_header("Content-Type", "text/plain").write("ok");
/// w.write_header(StatusCode::NotFound); // ignored
///
/// assert_eq!(w.status(), StatusCode::Created);
/// assert_eq!(w.body(), b"ok");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResponseWriter {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
    committed: bool,
    sealed: bool,
}

impl ResponseWriter {
    /// Creates an empty writer.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        ResponseWriter {
            body: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Commits the status code; ignored once a status is committed.
    #[inline]
    pub fn write_header(&mut self, status: StatusCode) -> &mut Self {
        if !self.committed && !self.sealed {
            self.status = Some(status);
            self.committed = true;
        }
        self
    }

    /// Appends to the body, committing `200 OK` if no status was written.
    #[inline]
    pub fn write<T: write::WriteBuffer>(&mut self, value: T) -> &mut Self {
        if !self.sealed {
            self.write_header(StatusCode::Ok);
            value.write_to(&mut self.body);
        }
        self
    }

    /// Replaces every value of a header.
    #[inline]
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        if !self.sealed {
            self.headers.set(name, value);
        }
        self
    }

    /// Adds a header value, keeping existing ones.
    #[inline]
    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        if !self.sealed {
            self.headers.append(name, value);
        }
        self
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline(always)]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Effective status: the committed one, or `200 OK`.
    #[inline(always)]
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::Ok)
    }

    #[inline(always)]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    #[inline(always)]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Writes a JSON body with the given status.
    #[inline]
    pub fn json(&mut self, status: StatusCode, body: &str) -> &mut Self {
        self.write_header(status)
            .set_header("Content-Type", "application/json; charset=utf-8")
            .write(body)
    }

    /// Drops everything written so far, including a committed status.
    /// Has no effect on a sealed writer.
    #[inline]
    pub fn reset(&mut self) {
        if !self.sealed {
            self.clear();
        }
    }

    /// Freezes the current response.
    #[inline]
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    fn clear(&mut self) {
        self.status = None;
        self.headers.clear();
        self.body.clear();
        self.committed = false;
        self.sealed = false;
    }
}

// Finalizer
impl ResponseWriter {
    /// Serializes the response for `req` into `out`, returning whether the
    /// connection must close afterwards.
    ///
    /// `Server`, `Date` and `Content-Length` are added when the handler did not
    /// set them. The connection closes if `close_after` is set or the handler
    /// sent `Connection: close`; then `Connection: close` is forced. An
    /// HTTP/1.0 request kept alive gets `Connection: keep-alive` in place of
    /// any handler value lacking that token.
    ///
    /// The writer itself is left untouched.
    pub fn finalize(
        &self,
        req: &Request,
        close_after: bool,
        server: Option<&str>,
        out: &mut Vec<u8>,
    ) -> bool {
        let close = close_after || self.headers.has_token("Connection", "close");
        let keep_alive = !close
            && req.version().is_http10()
            && !self.headers.has_token("Connection", "keep-alive");

        out.extend_from_slice(self.status().status_line());

        for (name, value) in self.headers.iter() {
            if (close || keep_alive) && name.eq_ignore_ascii_case("Connection") {
                continue;
            }
            push_header(out, name, value.as_bytes());
        }

        if let Some(server) = server.filter(|_| !self.headers.contains("Server")) {
            push_header(out, "Server", server.as_bytes());
        }
        if !self.headers.contains("Date") {
            out.extend_from_slice(b"Date: ");
            push_display(out, httpdate::HttpDate::from(SystemTime::now()));
            out.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains("Content-Length") {
            let (digits, start) = number_to_bytes(self.body.len() as u128);
            push_header(out, "Content-Length", &digits[start..]);
        }

        if close {
            out.extend_from_slice(b"Connection: close\r\n");
        } else if keep_alive {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);

        close
    }
}

impl Reusable for ResponseWriter {
    #[inline]
    fn create(limits: &RespLimits) -> Self {
        ResponseWriter::with_capacity(limits.default_capacity)
    }

    #[inline]
    fn reset(&mut self) {
        self.clear()
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.body.capacity() + self.headers.capacity()
    }
}

impl io::Write for ResponseWriter {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseWriter::write(self, buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[inline(always)]
fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

#[inline(always)]
fn push_display<T: std::fmt::Display>(out: &mut Vec<u8>, value: T) {
    use io::Write;
    // Writing into a Vec cannot fail.
    let _ = write!(out, "{value}");
}

#[inline(always)]
const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
    let mut buffer = [b'0'; 39];
    let mut i = 39;

    if n == 0 {
        return (buffer, 38);
    }

    while n > 0 {
        i -= 1;
        buffer[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }

    (buffer, i)
}

pub mod write {
    use super::number_to_bytes;
    use std::{borrow::Cow, sync::Arc};

    /// Trait for writing data to the [`ResponseWriter`](crate::ResponseWriter) body.
    ///
    /// Implemented for common types like strings, bytes, booleans
    /// and integer types.
    ///
    /// # Example
    /// ```
    /// use buff_web::WriteBuffer;
    ///
    /// struct MyString(String);
    ///
    /// impl WriteBuffer for MyString {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         buffer.extend_from_slice(self.0.as_bytes())
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), write_unsigned => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), write_signed => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline(always)]
    fn write_unsigned(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn write_signed(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        write_unsigned(value.unsigned_abs(), buffer);
    }
}
