use crate::StatusCode;
use std::{
    io::{self, Write},
    time::SystemTime,
};

/// Reasons a request is rejected before it reaches the router.
///
/// Every variant is fatal for the connection: the engine writes the canned
/// response from [`ErrorKind::write_response`] and closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("header section exceeds the configured limit")]
    HeaderTooLarge,
    #[error("header section is not valid UTF-8")]
    InvalidEncoding,

    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("empty request method")]
    InvalidMethod,
    #[error("malformed request target")]
    InvalidTarget,
    #[error("malformed protocol version")]
    InvalidVersion,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("absolute-form target without a Host header")]
    MissingHost,

    #[error("malformed header line")]
    InvalidHeader,
    #[error("malformed Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,
    #[error("both Transfer-Encoding: chunked and Content-Length are present")]
    ConflictingLength,
    #[error("malformed chunk framing")]
    InvalidChunk,

    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
}

macro_rules! http_errors {
    ($($name:ident: $status_code:ident => $json:literal; )*) => {
        /// Status code of the canned response.
        #[inline]
        pub const fn status(&self) -> StatusCode {
            match self { $(
                Self::$name => StatusCode::$status_code,
            )* }
        }

        #[inline]
        pub(crate) const fn json(&self) -> &'static str {
            match self { $(
                Self::$name => $json,
            )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        HeaderTooLarge: RequestHeaderFieldsTooLarge
            => r#"{"error":"Request header fields too large","code":"HEADER_TOO_LARGE"}"#;
        InvalidEncoding: BadRequest
            => r#"{"error":"Header section is not valid UTF-8","code":"INVALID_ENCODING"}"#;

        InvalidRequestLine: BadRequest
            => r#"{"error":"Invalid request line","code":"INVALID_REQUEST_LINE"}"#;
        InvalidMethod: BadRequest
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
        InvalidTarget: BadRequest
            => r#"{"error":"Invalid request target","code":"INVALID_TARGET"}"#;
        InvalidVersion: BadRequest
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: BadRequest
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;
        MissingHost: BadRequest
            => r#"{"error":"Missing Host header","code":"MISSING_HOST"}"#;

        InvalidHeader: BadRequest
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        InvalidContentLength: BadRequest
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        UnsupportedTransferEncoding: BadRequest
            => r#"{"error":"Unsupported Transfer-Encoding","code":"UNSUPPORTED_TRANSFER_ENCODING"}"#;
        ConflictingLength: BadRequest
            => r#"{"error":"Conflicting body length","code":"CONFLICTING_LENGTH"}"#;
        InvalidChunk: BadRequest
            => r#"{"error":"Invalid chunked body","code":"INVALID_CHUNK"}"#;

        BodyTooLarge: PayloadTooLarge
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
    }

    /// Serializes the canned response for this error into `out`.
    ///
    /// With `json == false` the body is empty. The response always carries
    /// `Date` and `Connection: close`.
    pub(crate) fn write_response(&self, json: bool, server: Option<&str>, out: &mut Vec<u8>) {
        let body = if json { self.json() } else { "" };

        out.extend_from_slice(self.status().status_line());
        if let Some(server) = server {
            out.extend_from_slice(b"Server: ");
            out.extend_from_slice(server.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        // Writing into a Vec cannot fail.
        let _ = write!(out, "Date: {}\r\n", httpdate::HttpDate::from(SystemTime::now()));
        out.extend_from_slice(b"Connection: close\r\n");
        if json {
            out.extend_from_slice(b"Content-Type: application/json\r\n");
        }
        let _ = write!(out, "Content-Length: {}\r\n\r\n", body.len());
        out.extend_from_slice(body.as_bytes());
    }
}

/// Route registration failures. The router is left untouched when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RouteError {
    #[error("invalid route path `{0}`")]
    InvalidPath(String),
    #[error("route `{method} {path}` is already registered")]
    Duplicate { method: String, path: String },
    #[error("splat segment must be the last segment in `{0}`")]
    SplatNotTerminal(String),
    #[error("parameter `:{new}` conflicts with `:{existing}` in `{path}`")]
    ParamConflict {
        path: String,
        existing: String,
        new: String,
    },
    #[error("empty parameter name in `{0}`")]
    EmptyParamName(String),
    #[error("wildcard node `{0}` has children")]
    SplatHasChildren(String),
}

/// Errors returned while building or launching a [`Server`](crate::Server).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error("no router was provided to the builder")]
    MissingRouter,
    #[error("no bind address was provided to the builder")]
    MissingAddress,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Route(#[from] RouteError),
}
