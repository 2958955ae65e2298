use crate::{http::query, http::Version};
use std::{error, fmt, io};

/// The nine canned error outcomes the engine can produce without ever
/// invoking a registered handler, plus an `Io` wrapper for hard transport
/// failures that tear the session down instead of writing a response.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    /// Malformed request line, header syntax, or `Content-Length` (400).
    BadRequest,
    /// Invalid query string (400), carried separately so callers can match
    /// on the underlying [`query::Error`].
    #[allow(dead_code)]
    Query(query::Error),

    /// Request target exceeds [`ReqLimits::url_size`](crate::config::ReqLimits::url_size) (414).
    UriTooLong,
    /// Header count or size exceeds configured limits (431).
    HeaderFieldsTooLarge,

    /// No registered handler matches the method for an otherwise-matched URI (405).
    MethodNotAllowed,
    /// No registered handler matches the request URI at all (404).
    NotFound,

    /// No bytes arrived within [`ServerConfig::recv_wait_timeout`](crate::config::ServerConfig::recv_wait_timeout) (408).
    RequestTimeout,
    /// A framed body was indicated but no `Content-Length` was present (411).
    LengthRequired,

    /// Request line names a version other than HTTP/1.0 or HTTP/1.1 (505).
    VersionNotSupported,

    /// A handler panicked, or an invariant the engine itself owns was
    /// violated (500).
    InternalError,
    /// The underlying socket faulted. Not written to the wire as a response
    /// — the session is simply dropped — but still needs a status mapping
    /// for logging.
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        BadRequest: "400 Bad Request", "52"
            => r#"{"error":"Malformed request","code":"BAD_REQUEST"}"#;
        Query: "400 Bad Request", "55"
            => r#"{"error":"Invalid query string","code":"INVALID_QUERY"}"#;

        UriTooLong: "414 URI Too Long", "48"
            => r#"{"error":"Request URI too long","code":"URI_TOO_LONG"}"#;
        HeaderFieldsTooLarge: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;

        MethodNotAllowed: "405 Method Not Allowed", "57"
            => r#"{"error":"Method not allowed for URI","code":"METHOD_NOT_ALLOWED"}"#;
        NotFound: "404 Not Found", "49"
            => r#"{"error":"No handler for URI","code":"NOT_FOUND"}"#;

        RequestTimeout: "408 Request Timeout", "52"
            => r#"{"error":"Request timed out","code":"REQUEST_TIMEOUT"}"#;
        LengthRequired: "411 Length Required", "57"
            => r#"{"error":"Content-Length required","code":"LENGTH_REQUIRED"}"#;

        VersionNotSupported: "505 HTTP Version Not Supported", "60"
            => r#"{"error":"HTTP version not supported","code":"VERSION_NOT_SUPPORTED"}"#;

        InternalError: "500 Internal Server Error", "54"
            => r#"{"error":"Internal server error","code":"INTERNAL_ERROR"}"#;
        Io: "500 Internal Server Error", "40"
            => r#"{"error":"I/O error","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_404() {
        let body = ErrorKind::NotFound.as_http(Version::Http11, false);
        assert!(body.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn method_not_allowed_is_405_json() {
        let body = ErrorKind::MethodNotAllowed.as_http(Version::Http11, true);
        assert!(body.starts_with(b"HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(body.ends_with(b"\"METHOD_NOT_ALLOWED\"}"));
    }

    #[test]
    fn uri_too_long_is_414() {
        let body = ErrorKind::UriTooLong.as_http(Version::Http10, false);
        assert!(body.starts_with(b"HTTP/1.0 414 URI Too Long\r\n"));
    }

    #[test]
    fn io_error_compares_by_kind() {
        let a = IoError(io::Error::new(io::ErrorKind::TimedOut, "x"));
        let b = IoError(io::Error::new(io::ErrorKind::TimedOut, "y"));
        assert_eq!(a, b);
    }
}
