use crate::{
    config::ReqLimits,
    errors::ErrorKind,
    http::{
        query::{self, Query},
        tokenizer::Tokenizer,
        types::{self, Header, HeaderMap, Method, Url, Version},
    },
};
use memchr::memchr;

/// A parsed HTTP request.
///
/// All data is zero-copy referenced from the session's [`Tokenizer`] buffer.
#[derive(Debug, Clone, PartialEq)]
#[repr(align(128))]
pub struct Request {
    method: Method,
    url: Url,
    version: Version,
    headers: HeaderMap,
    body: Option<&'static [u8]>,
    pub(crate) keep_alive: bool,
}

impl Request {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Request {
            method: Method::Get,
            url: Url::new(limits),
            version: Version::Http11,
            headers: HeaderMap::new(limits.header_count),
            body: None,
            keep_alive: true,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.url.clear();
        self.version = Version::Http11;
        self.headers.reset();
        self.body = None;
        self.keep_alive = true;
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// Returns the value of the `Content-Length` header if present.
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    /// Returns the request body if present.
    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }

    /// Returns the value of `name` from the `Cookie` header, if the header is
    /// present and contains a `name=value` pair. Cookie names are matched
    /// case-sensitively per [RFC 6265](https://tools.ietf.org/html/rfc6265#section-4.1.1).
    ///
    /// Only reads cookies the client already sent; the engine never sets or
    /// persists cookies on the client's behalf.
    pub fn cookie(&self, name: &[u8]) -> Option<&[u8]> {
        let header = self.header(b"cookie")?;

        header.split(|&b| b == b';').find_map(|pair| {
            let pair = trim_ascii_whitespace(pair);
            let eq = memchr(b'=', pair)?;
            (&pair[..eq] == name).then(|| &pair[eq + 1..])
        })
    }
}

#[inline(always)]
fn trim_ascii_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Distinguishes "not enough bytes have arrived yet" from a genuine parse
/// failure. [`RequestParser::parse`] is re-run from the start of the buffer
/// after every additional `recv`, so a caller sees `Incomplete` any number of
/// times before either `Ok` or a `Fatal` outcome.
#[derive(Debug, PartialEq)]
pub(crate) enum ParseError {
    Incomplete,
    Fatal(ErrorKind),
}

impl From<ErrorKind> for ParseError {
    fn from(kind: ErrorKind) -> Self {
        ParseError::Fatal(kind)
    }
}

impl From<query::Error> for ParseError {
    fn from(err: query::Error) -> Self {
        ParseError::Fatal(ErrorKind::from(err))
    }
}

/// Resolves a scan that came up empty: `Incomplete` if the buffer still has
/// room to receive more of the request, `hard` if it's already full and the
/// bytes present still don't satisfy the grammar.
#[inline]
fn required<T>(value: Option<T>, hard: ErrorKind, at_capacity: bool) -> Result<T, ParseError> {
    match value {
        Some(v) => Ok(v),
        None if at_capacity => Err(ParseError::Fatal(hard)),
        None => Err(ParseError::Incomplete),
    }
}

/// Bundles the mutable parsing state (tokenizer cursor, request scratch
/// object, and configured limits) for one request-line-through-body pass.
///
/// Mirrors the connection-bound parsing methods of the original design, just
/// narrowed down to the three pieces of state parsing actually needs — the
/// response object only ever mirrors `request.keep_alive` after parsing, so
/// it plays no part here.
pub(crate) struct RequestParser<'a> {
    pub(crate) tokenizer: &'a mut Tokenizer,
    pub(crate) request: &'a mut Request,
    pub(crate) limits: &'a ReqLimits,
}

impl<'a> RequestParser<'a> {
    pub(crate) fn new(
        tokenizer: &'a mut Tokenizer,
        request: &'a mut Request,
        limits: &'a ReqLimits,
    ) -> Self {
        Self {
            tokenizer,
            request,
            limits,
        }
    }

    /// Parses the request currently staged in `tokenizer` from byte 0.
    /// Returns [`ParseError::Incomplete`] rather than a hard error when the
    /// grammar simply hasn't fully arrived yet and the buffer still has room
    /// for more — the caller reads more bytes and calls `parse` again.
    #[inline]
    pub(crate) fn parse(&mut self) -> Result<Version, ParseError> {
        self.parse_method()?;
        self.parse_url()?;
        self.check_version()?;
        self.parse_headers()?;
        self.check_body()?;

        Ok(self.request.version)
    }
}

// Parse first line
impl RequestParser<'_> {
    #[inline]
    fn parse_method(&mut self) -> Result<(), ParseError> {
        // "OPTIONS " - The longest possible method with a space (8 bytes)
        let exhausted = self.tokenizer.scan_exhausted(0, 8);
        let slice = required(self.tokenizer.get_slice(0, 8).filter(|_| self.tokenizer.len >= 8), ErrorKind::BadRequest, exhausted)?;

        (self.request.method, self.tokenizer.position) = Method::from_bytes(slice)?;
        Ok(())
    }

    #[inline]
    fn parse_url(&mut self) -> Result<(), ParseError> {
        let limit = self.limits.url_size + 2;
        let exhausted = self.tokenizer.scan_exhausted(self.tokenizer.position, limit);
        let posit = required(self.tokenizer.find_char(limit, b' '), ErrorKind::UriTooLong, exhausted)?;

        let start = self.tokenizer.position;
        let slice = self
            .tokenizer
            .get_slice(start, posit)
            .ok_or(ErrorKind::BadRequest)?;

        if slice.first() != Some(&b'/') {
            return Err(ParseError::Fatal(ErrorKind::BadRequest));
        }

        let path_end = memchr(b'?', slice).unwrap_or(slice.len());

        let url = &mut self.request.url;
        url.target = self
            .tokenizer
            .get_slice_static(start, posit)
            .ok_or(ErrorKind::BadRequest)?;
        url.path = self
            .tokenizer
            .get_slice_static(start, path_end)
            .ok_or(ErrorKind::BadRequest)?;

        if path_end < slice.len() {
            let query = self
                .tokenizer
                .get_slice_static(start + path_end, slice.len() - path_end)
                .ok_or(ErrorKind::BadRequest)?;

            Query::parse_into(&mut url.query_parts, query, self.limits.url_query_parts)?;
            url.query = Some(query);
        }

        self.tokenizer.update_position(posit);
        Ok(())
    }

    #[inline]
    fn check_version(&mut self) -> Result<(), ParseError> {
        // "HTTP/1.X\r\n" - HTTP version with line break (10 bytes)
        let exhausted = self.tokenizer.scan_exhausted(self.tokenizer.position, 10);
        let slice = required(self.tokenizer.find_slice(10, b'\n'), ErrorKind::BadRequest, exhausted)?;

        if !matches!(slice.len(), 8 | 9) {
            return Err(ParseError::Fatal(ErrorKind::BadRequest));
        }

        let (version, keep_alive) = Version::from_bytes(&slice[..8])?;
        self.request.version = version;
        self.request.keep_alive = keep_alive;

        // Check for the use of the '\r' character
        self.tokenizer.has_crlf = slice.last() == Some(&b'\r');

        Ok(())
    }
}

// Parse headers
impl RequestParser<'_> {
    #[inline]
    fn parse_headers(&mut self) -> Result<(), ParseError> {
        for _ in 0..=self.limits.header_count {
            let Some(header) = self.parse_header()? else {
                return Ok(());
            };

            if !self.parse_special_header(&header)? {
                self.request.headers.headers.push(header);
            }
        }

        Err(ParseError::Fatal(ErrorKind::HeaderFieldsTooLarge))
    }

    #[inline]
    fn parse_header(&mut self) -> Result<Option<Header>, ParseError> {
        let tokenizer = &mut self.tokenizer;
        let h_line = self.limits.header_name_size + self.limits.header_value_size + 4;

        // HeaderName: Someone=data\r\n
        //                            |
        let exhausted = tokenizer.scan_exhausted(tokenizer.position, h_line);
        let end = required(tokenizer.find_char(h_line, b'\n'), ErrorKind::BadRequest, exhausted)?;

        match tokenizer.get_slice(tokenizer.position + end - 1, 2) {
            Some([b'\r', b'\n']) if tokenizer.has_crlf => {}
            Some([_, b'\n']) if !tokenizer.has_crlf => {}
            _ => return Err(ParseError::Fatal(ErrorKind::BadRequest)),
        }

        // HeaderName: Someone=data\r\n
        //           |
        let Some(split) = tokenizer.find_char(end, b':') else {
            self.check_end_of_headers(end)?;
            return Ok(None);
        };

        if tokenizer.get_slice(tokenizer.position + split, 2) != Some(b": ") {
            return Err(ParseError::Fatal(ErrorKind::BadRequest));
        }

        let value_start = split + 2;
        let len_value = end - value_start - tokenizer.has_crlf as usize;

        if split > self.limits.header_name_size || len_value > self.limits.header_value_size {
            return Err(ParseError::Fatal(ErrorKind::HeaderFieldsTooLarge));
        }

        let name = {
            let name = tokenizer
                .get_slice_mut(tokenizer.position, split)
                .ok_or(ErrorKind::BadRequest)?;

            if name.is_empty() {
                return Err(ParseError::Fatal(ErrorKind::BadRequest));
            }

            types::to_lower_case(name);
            unsafe { Tokenizer::into_static(name) }
        };

        let value = tokenizer
            .get_slice_static(tokenizer.position + value_start, len_value)
            .ok_or(ErrorKind::BadRequest)?;

        tokenizer.update_position(end);

        Ok(Some(Header::new(name, value)))
    }

    #[inline]
    fn parse_special_header(&mut self, header: &Header) -> Result<bool, ParseError> {
        match header.name {
            b"content-length" => self.parse_content_length(header.value),
            b"connection" => self.parse_connection(header.value),
            _ => return Ok(false),
        }
        .map(|_| true)
    }

    #[inline]
    fn check_end_of_headers(&mut self, start: usize) -> Result<(), ParseError> {
        let tokenizer = &mut self.tokenizer;
        // [\r, \n, \r, \n] or [x, x, \n, \n]
        let p_end = tokenizer
            .get_slice(tokenizer.position + start - 3, 4)
            .ok_or(ErrorKind::BadRequest)?;

        if !match tokenizer.has_crlf {
            true => p_end.ends_with(b"\r\n\r\n"),
            false => p_end.ends_with(b"\n\n"),
        } {
            return Err(ParseError::Fatal(ErrorKind::BadRequest));
        }

        tokenizer.position += tokenizer.has_crlf as usize + 1;

        Ok(())
    }

    #[inline]
    fn parse_content_length(&mut self, value: &[u8]) -> Result<(), ParseError> {
        let len = types::slice_to_usize(value).ok_or(ErrorKind::BadRequest)?;
        if len > self.limits.body_size {
            return Err(ParseError::Fatal(ErrorKind::BadRequest));
        }
        self.request.headers.content_length = Some(len);
        Ok(())
    }

    #[inline]
    fn parse_connection(&mut self, value: &[u8]) -> Result<(), ParseError> {
        let mut normalized = [0u8; 10];
        if value.len() > normalized.len() {
            return Err(ParseError::Fatal(ErrorKind::BadRequest));
        }
        normalized[..value.len()].copy_from_slice(value);
        types::to_lower_case(&mut normalized[..value.len()]);

        match &normalized[..value.len()] {
            b"keep-alive" => self.request.keep_alive = true,
            b"close" => self.request.keep_alive = false,
            _ => return Err(ParseError::Fatal(ErrorKind::BadRequest)),
        }

        Ok(())
    }
}

// Parse body
impl RequestParser<'_> {
    #[inline]
    fn check_body(&mut self) -> Result<(), ParseError> {
        let tokenizer = &self.tokenizer;
        let body = tokenizer.len - tokenizer.position;

        match self.request.headers.content_length {
            Some(0) => Ok(()),
            Some(len) if len == body => {
                let slice = tokenizer
                    .get_slice_static(tokenizer.position, len)
                    .ok_or(ErrorKind::BadRequest)?;

                self.request.body = Some(slice);
                Ok(())
            }
            // Fewer bytes than `Content-Length` promised have arrived so
            // far: wait for more, unless the buffer is already as large as
            // `ReqLimits` allows the whole request to be.
            Some(len) if len > body => match tokenizer.at_capacity() {
                true => Err(ParseError::Fatal(ErrorKind::BadRequest)),
                false => Err(ParseError::Incomplete),
            },
            Some(_) => Err(ParseError::Fatal(ErrorKind::BadRequest)),
            None => match body == 0 {
                true => Ok(()),
                false => Err(ParseError::Fatal(ErrorKind::LengthRequired)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    fn parser_for<'a>(
        tok: &'a mut Tokenizer,
        req: &'a mut Request,
        limits: &'a ReqLimits,
    ) -> RequestParser<'a> {
        RequestParser::new(tok, req, limits)
    }

    #[test]
    fn parse_method() {
        let limits = ReqLimits::default();

        // Method::from_bytes needs a fixed 8-byte lookahead, so every case
        // here carries enough trailing bytes to fill that window; shorter
        // inputs are covered separately by `parse_method_incomplete`.
        #[rustfmt::skip]
        let cases = [
            ("GET /url",     Some(Method::Get)),
            ("PUT /url",     Some(Method::Put)),
            ("POST /url",    Some(Method::Post)),
            ("HEAD /url",    Some(Method::Head)),
            ("PATCH /url",   Some(Method::Patch)),
            ("DELETE /url",  Some(Method::Delete)),
            ("OPTIONS /url", Some(Method::Options)),

            ("PYU /url",       None),
            ("GETGETGET /url", None),
        ];

        for (method, expected) in cases {
            let mut tok = Tokenizer::from(&limits, method);
            let mut req = Request::new(&limits);
            let mut p = parser_for(&mut tok, &mut req, &limits);

            if let Some(expected) = expected {
                assert_eq!(p.parse_method(), Ok(()));
                assert_eq!(p.request.method(), expected);
            } else {
                assert_eq!(p.parse_method(), Err(ParseError::Fatal(ErrorKind::BadRequest)));
            }
        }
    }

    #[test]
    fn parse_method_incomplete() {
        let limits = ReqLimits::default();

        for partial in ["", "G", "GET", "GET "] {
            let mut tok = Tokenizer::from(&limits, partial);
            let mut req = Request::new(&limits);
            let mut p = parser_for(&mut tok, &mut req, &limits);

            assert_eq!(p.parse_method(), Err(ParseError::Incomplete));
        }
    }

    #[test]
    fn parse_url() {
        let limits = ReqLimits::default();

        #[rustfmt::skip]
        let cases = [
            ("/ ",             Some(("/", None))),
            ("/api/user ",     Some(("/api/user", None))),
            ("/api/find?user=qwe&id=223 ", Some(("/api/find", Some("user=qwe&id=223")))),
            ("/?user=qwe ",    Some(("/", Some("user=qwe")))),

            ("qwe ",           None),
            (" ",              None),
        ];

        for (url, expected) in cases {
            let mut tok = Tokenizer::from(&limits, url);
            let mut req = Request::new(&limits);
            let mut p = parser_for(&mut tok, &mut req, &limits);

            if let Some((path, query)) = expected {
                assert_eq!(p.parse_url(), Ok(()));
                assert_eq!(str_op(p.request.url().path()), path);

                if let Some(query) = query {
                    let full = str_op(p.request.url().query_full().unwrap());
                    assert_eq!(&full[1..], query);
                } else {
                    assert_eq!(p.request.url().query_full(), None);
                }
            } else {
                assert_eq!(p.parse_url(), Err(ParseError::Fatal(ErrorKind::BadRequest)));
            }
        }
    }

    #[test]
    fn parse_url_incomplete() {
        let limits = ReqLimits::default();
        let mut tok = Tokenizer::from(&limits, "/partial/path");
        let mut req = Request::new(&limits);
        let mut p = parser_for(&mut tok, &mut req, &limits);

        assert_eq!(p.parse_url(), Err(ParseError::Incomplete));
    }

    #[test]
    fn check_version() {
        let limits = ReqLimits::default();

        #[rustfmt::skip]
        let cases = [
            ("HTTP/1.1\r\n e", Ok((Version::Http11, true, true))),
            ("HTTP/1.0\r\n",   Ok((Version::Http10, false, true))),
            ("HTTP/1.1\n",     Ok((Version::Http11, true, false))),

            ("HTTP/2.0\r\n",   Err(ParseError::Fatal(ErrorKind::VersionNotSupported))),
            ("HTTP/1.15\r\n",  Err(ParseError::Fatal(ErrorKind::BadRequest))),
        ];

        for (value, expected) in cases {
            let mut tok = Tokenizer::from(&limits, value);
            let mut req = Request::new(&limits);
            let mut p = parser_for(&mut tok, &mut req, &limits);

            match expected {
                Ok((version, keep_alive, has_crlf)) => {
                    assert_eq!(p.check_version(), Ok(()));
                    assert_eq!(p.request.version, version);
                    assert_eq!(p.request.keep_alive, keep_alive);
                    assert_eq!(p.tokenizer.has_crlf, has_crlf);
                }
                Err(e) => assert_eq!(p.check_version(), Err(e)),
            }
        }
    }

    #[test]
    fn check_version_incomplete_without_a_terminator() {
        let limits = ReqLimits::default();
        let mut tok = Tokenizer::from(&limits, "");
        let mut req = Request::new(&limits);
        let mut p = parser_for(&mut tok, &mut req, &limits);

        assert_eq!(p.check_version(), Err(ParseError::Incomplete));
    }

    #[test]
    fn parse_headers() {
        let limits = ReqLimits::default();

        #[rustfmt::skip]
        let cases = [
            (true, "HEADER: value\r\n\r\n", Some(("header", "value"))),
            (false, "HEADER: value\n\n", Some(("header", "value"))),
            (true, "Empty-Value: \r\n\r\n", Some(("empty-value", ""))),

            (true, ": empty-name\r\n\r\n", None),
            (true, "No-Colon value\r\n\r\n", None),
        ];

        for (has_crlf, headers, expected) in cases {
            let mut tok = Tokenizer::from(&limits, headers);
            tok.has_crlf = has_crlf;
            let mut req = Request::new(&limits);
            let mut p = parser_for(&mut tok, &mut req, &limits);

            if let Some((name, value)) = expected {
                assert_eq!(p.parse_headers(), Ok(()));
                assert_eq!(str(p.request.header(name.as_bytes())), Some(value));
            } else {
                assert_eq!(p.parse_headers(), Err(ParseError::Fatal(ErrorKind::BadRequest)));
            }
        }
    }

    #[test]
    fn full_request() {
        let limits = ReqLimits::default();
        let raw = "POST /upload HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"data\": \"value\"}";

        let mut tok = Tokenizer::from(&limits, raw);
        let mut req = Request::new(&limits);
        let mut p = parser_for(&mut tok, &mut req, &limits);

        assert_eq!(p.parse(), Ok(Version::Http11));
        assert_eq!(req.method(), Method::Post);
        assert_eq!(str_op(req.url().target()), "/upload");
        assert_eq!(str(req.header(b"content-type")), Some("application/json"));
        assert_eq!(req.body(), Some(b"{\"data\": \"value\"}" as &[u8]));
        assert!(req.keep_alive);
    }

    #[test]
    fn length_required_without_content_length() {
        let limits = ReqLimits::default();
        let raw = "POST / HTTP/1.1\r\n\r\nstray bytes";

        let mut tok = Tokenizer::from(&limits, raw);
        let mut req = Request::new(&limits);
        let mut p = parser_for(&mut tok, &mut req, &limits);

        assert_eq!(p.parse(), Err(ParseError::Fatal(ErrorKind::LengthRequired)));
    }

    #[test]
    fn body_too_large() {
        let limits = ReqLimits::default();
        let raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", limits.body_size + 1);

        let mut tok = Tokenizer::from(&limits, raw);
        let mut req = Request::new(&limits);
        let mut p = parser_for(&mut tok, &mut req, &limits);

        assert_eq!(p.parse(), Err(ParseError::Fatal(ErrorKind::BadRequest)));
    }

    #[test]
    fn cookie_reads_a_named_pair_out_of_the_cookie_header() {
        let limits = ReqLimits::default();
        let raw = "GET / HTTP/1.1\r\nCookie: session=abc123; theme=dark\r\n\r\n";

        let mut tok = Tokenizer::from(&limits, raw);
        let mut req = Request::new(&limits);
        let mut p = parser_for(&mut tok, &mut req, &limits);

        assert_eq!(p.parse(), Ok(Version::Http11));
        assert_eq!(str(req.cookie(b"session")), Some("abc123"));
        assert_eq!(str(req.cookie(b"theme")), Some("dark"));
        assert_eq!(req.cookie(b"missing"), None);
    }

    #[test]
    fn cookie_is_none_without_a_cookie_header() {
        let limits = ReqLimits::default();
        let raw = "GET / HTTP/1.1\r\n\r\n";

        let mut tok = Tokenizer::from(&limits, raw);
        let mut req = Request::new(&limits);
        let mut p = parser_for(&mut tok, &mut req, &limits);

        assert_eq!(p.parse(), Ok(Version::Http11));
        assert_eq!(req.cookie(b"session"), None);
    }
}
