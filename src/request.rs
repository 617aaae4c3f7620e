// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;

use atoi::atoi;
use tempfile::TempPath;

use crate::body::RequestBody;

/// HTTP method of a request.
///
/// The parser only accepts the methods listed here; anything else is turned
/// into a `501 Not Implemented` before a `Request` even exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    /// Parses a method token. Matching is case-sensitive, like the wire
    /// format demands.
    pub fn from_token(token: &str) -> Option<Method> {
        Some(match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "PATCH" => Method::Patch,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }

    /// True for methods that may carry a request body.
    pub fn admits_body(&self) -> bool {
        match *self {
            Method::Post | Method::Put | Method::Delete | Method::Patch => true,
            Method::Get | Method::Head => false,
        }
    }
}

/// HTTP version (1.0 or 1.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpVersion(pub u8, pub u8);

impl HttpVersion {
    #[inline]
    pub(crate) fn is_one_one(&self) -> bool {
        *self == HttpVersion(1, 1)
    }
}

/// One element of the `Accept-Encoding` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingPref {
    /// Name of the coding, as sent (eg. `gzip`, `identity`, `*`).
    pub name: String,
    /// Quality in thousandths, 0 to 1000. Absent `q` parameters count as
    /// 1000.
    pub q: u16,
}

/// One element of a `Range: bytes=` header. Bounds are inclusive byte
/// offsets as they appear on the wire; `first == None` is the suffix form
/// (`-n`, the final `n` bytes), `last == None` runs to the end.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    pub first: Option<u64>,
    pub last: Option<u64>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ConnectionFlags {
    pub close: bool,
    pub keep_alive: bool,
    pub upgrade: bool,
}

/// The headers of a request: the raw name/value list plus typed views of
/// the headers the server itself cares about.
#[derive(Debug)]
pub struct Headers {
    raw: Vec<(String, String)>,

    accept_encoding: Vec<EncodingPref>,
    pub(crate) connection: ConnectionFlags,
    pub(crate) content_length: Option<u64>,
    pub(crate) content_length_invalid: bool,
    content_type: Option<String>,
    cookies: Vec<(String, String)>,
    pub(crate) expect_continue: bool,
    pub(crate) expect_invalid: bool,
    host: Option<String>,
    if_modified_since: Option<SystemTime>,
    if_none_match: Option<String>,
    ranges: Option<Vec<RangeSpec>>,
    user_agent: Option<String>,
    x_forwarded_for: Vec<String>,
    pub(crate) upgrade_websocket: bool,
    sec_websocket_key: Option<String>,
}

impl Headers {
    /// Builds the typed views from a raw header list.
    pub(crate) fn build(raw: Vec<(String, String)>) -> Headers {
        let mut headers = Headers {
            raw,
            accept_encoding: Vec::new(),
            connection: ConnectionFlags::default(),
            content_length: None,
            content_length_invalid: false,
            content_type: None,
            cookies: Vec::new(),
            expect_continue: false,
            expect_invalid: false,
            host: None,
            if_modified_since: None,
            if_none_match: None,
            ranges: None,
            user_agent: None,
            x_forwarded_for: Vec::new(),
            upgrade_websocket: false,
            sec_websocket_key: None,
        };

        for i in 0..headers.raw.len() {
            let (name, value) = {
                let &(ref n, ref v) = &headers.raw[i];
                (n.clone(), v.clone())
            };

            if name.eq_ignore_ascii_case("Accept-Encoding") {
                headers
                    .accept_encoding
                    .extend(value.split(',').filter_map(parse_encoding_pref));
            } else if name.eq_ignore_ascii_case("Connection") {
                for token in value.split(',') {
                    let token = token.trim();
                    if token.eq_ignore_ascii_case("close") {
                        headers.connection.close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        headers.connection.keep_alive = true;
                    } else if token.eq_ignore_ascii_case("upgrade") {
                        headers.connection.upgrade = true;
                    }
                }
            } else if name.eq_ignore_ascii_case("Content-Length") {
                match parse_u64_strict(value.trim()) {
                    Some(len) => headers.content_length = Some(len),
                    None => headers.content_length_invalid = true,
                }
            } else if name.eq_ignore_ascii_case("Content-Type") {
                if headers.content_type.is_none() {
                    headers.content_type = Some(value);
                }
            } else if name.eq_ignore_ascii_case("Cookie") {
                for pair in value.split(';') {
                    let mut it = pair.splitn(2, '=');
                    if let (Some(k), Some(v)) = (it.next(), it.next()) {
                        headers
                            .cookies
                            .push((k.trim().to_owned(), v.trim().to_owned()));
                    }
                }
            } else if name.eq_ignore_ascii_case("Expect") {
                for token in value.split(',') {
                    if token.trim().eq_ignore_ascii_case("100-continue") {
                        headers.expect_continue = true;
                    } else if !token.trim().is_empty() {
                        headers.expect_invalid = true;
                    }
                }
            } else if name.eq_ignore_ascii_case("Host") {
                if headers.host.is_none() {
                    headers.host = Some(value);
                }
            } else if name.eq_ignore_ascii_case("If-Modified-Since") {
                headers.if_modified_since = httpdate::parse_http_date(value.trim()).ok();
            } else if name.eq_ignore_ascii_case("If-None-Match") {
                headers.if_none_match = Some(value.trim().to_owned());
            } else if name.eq_ignore_ascii_case("Range") {
                headers.ranges = parse_range_header(&value);
            } else if name.eq_ignore_ascii_case("User-Agent") {
                headers.user_agent = Some(value);
            } else if name.eq_ignore_ascii_case("X-Forwarded-For") {
                headers
                    .x_forwarded_for
                    .extend(value.split(',').map(|s| s.trim().to_owned()));
            } else if name.eq_ignore_ascii_case("Upgrade") {
                if value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("websocket"))
                {
                    headers.upgrade_websocket = true;
                }
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
                headers.sec_websocket_key = Some(value.trim().to_owned());
            }
        }

        // Most desired coding first; sort_by is stable so equal q values
        // keep their wire order.
        headers.accept_encoding.sort_by(|a, b| b.q.cmp(&a.q));

        headers
    }

    /// Value of the first header with this name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.raw
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| &v[..])
    }

    /// All values carried by headers of this name, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.raw
            .iter()
            .filter(move |&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| &v[..])
    }

    /// The raw header list, including everything the typed views don't
    /// cover.
    #[inline]
    pub fn raw(&self) -> &[(String, String)] {
        &self.raw
    }

    /// Codings from `Accept-Encoding`, sorted by quality descending.
    #[inline]
    pub fn accept_encoding(&self) -> &[EncodingPref] {
        &self.accept_encoding
    }

    /// True if the client listed `gzip` with a non-zero quality.
    pub fn accepts_gzip(&self) -> bool {
        self.accept_encoding
            .iter()
            .any(|e| e.q > 0 && e.name.eq_ignore_ascii_case("gzip"))
    }

    #[inline]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    #[inline]
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    #[inline]
    pub fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    /// Raw value of the `Host` header.
    #[inline]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    #[inline]
    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.if_modified_since
    }

    #[inline]
    pub fn if_none_match(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    /// Parsed `Range: bytes=` specs, in wire order. `None` when the header
    /// is absent or not a byte-range request.
    #[inline]
    pub fn ranges(&self) -> Option<&[RangeSpec]> {
        self.ranges.as_deref()
    }

    #[inline]
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    #[inline]
    pub fn x_forwarded_for(&self) -> &[String] {
        &self.x_forwarded_for
    }

    #[inline]
    pub fn sec_websocket_key(&self) -> Option<&str> {
        self.sec_websocket_key.as_deref()
    }
}

fn parse_encoding_pref(element: &str) -> Option<EncodingPref> {
    let mut parts = element.split(';');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }

    let mut q = 1000;
    for param in parts {
        let param = param.trim();
        if let Some(value) = param
            .strip_prefix("q=")
            .or_else(|| param.strip_prefix("Q="))
        {
            q = q_millis(value.trim())?;
        }
    }

    Some(EncodingPref {
        name: name.to_owned(),
        q,
    })
}

// Parses a quality value ("1", "0.5", "0.075") into thousandths without
// going through floating point.
fn q_millis(s: &str) -> Option<u16> {
    let mut parts = s.splitn(2, '.');
    let int: u16 = parts.next()?.parse().ok()?;
    if int > 1 {
        return None;
    }

    let mut millis = int * 1000;
    if let Some(frac) = parts.next() {
        if frac.len() > 3 || frac.chars().any(|c| !c.is_ascii_digit()) {
            return None;
        }
        let mut frac_val: u16 = frac.parse().ok()?;
        for _ in frac.len()..3 {
            frac_val *= 10;
        }
        millis += frac_val;
    }

    if millis > 1000 {
        None
    } else {
        Some(millis)
    }
}

// Digits only, no sign, no trailing garbage.
pub(crate) fn parse_u64_strict(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    atoi::<u64>(s.as_bytes())
}

// Parses `bytes=a-b,c-d`. Returns `None` when the header doesn't describe
// byte ranges at all; individual malformed elements poison the whole
// header, which then gets ignored.
fn parse_range_header(value: &str) -> Option<Vec<RangeSpec>> {
    let ranges = value.trim().strip_prefix("bytes=")?;

    let mut out = Vec::new();
    for element in ranges.split(',') {
        let element = element.trim();
        let dash = element.find('-')?;
        let (first, last) = element.split_at(dash);
        let last = &last[1..];

        let first = if first.is_empty() {
            None
        } else {
            Some(parse_u64_strict(first)?)
        };
        let last = if last.is_empty() {
            None
        } else {
            Some(parse_u64_strict(last)?)
        };

        if first.is_none() && last.is_none() {
            return None;
        }

        out.push(RangeSpec { first, last });
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// A request received by the server, handed to the request handler.
///
/// The headers are read-only once parsing is over. The body can be
/// extracted once with [`data()`](Request::data).
pub struct Request {
    method: Method,
    http_version: HttpVersion,
    secure: bool,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
    raw_url: String,
    headers: Headers,
    remote_addr: SocketAddr,
    data: Mutex<Option<RequestBody>>,
    // Deleting this path removes the spilled body, if any. Dropped with the
    // request, after the response is produced.
    _spill: Option<TempPath>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        http_version: HttpVersion,
        secure: bool,
        host: String,
        port: u16,
        path: String,
        query: Option<String>,
        raw_url: String,
        headers: Headers,
        remote_addr: SocketAddr,
        body: RequestBody,
        spill: Option<TempPath>,
    ) -> Request {
        Request {
            method,
            http_version,
            secure,
            host,
            port,
            path,
            query,
            raw_url,
            headers,
            remote_addr,
            data: Mutex::new(Some(body)),
            _spill: spill,
        }
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn http_version(&self) -> HttpVersion {
        self.http_version
    }

    /// True if the request arrived over TLS.
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Host name from the `Host` header, without the port.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port from the `Host` header, or the default for the scheme.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path component of the request target, as received.
    #[inline]
    pub fn url(&self) -> &str {
        &self.path
    }

    /// Query string without the leading `?`, if any.
    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The request target exactly as it appeared on the request line.
    #[inline]
    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    /// Value of the first header with this name, case-insensitive.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn remote_addr(&self) -> &SocketAddr {
        &self.remote_addr
    }

    /// Extracts the body of the request.
    ///
    /// Returns `None` the second time it is called.
    pub fn data(&self) -> Option<RequestBody> {
        let mut data = self.data.lock().unwrap();
        data.take()
    }

    /// Builds a fake HTTP request to be used during tests.
    pub fn fake_http<M, U>(
        method: M,
        url: U,
        headers: Vec<(String, String)>,
        data: Vec<u8>,
    ) -> Request
    where
        M: AsRef<str>,
        U: Into<String>,
    {
        let method = Method::from_token(method.as_ref()).expect("unknown method");
        let raw_url = url.into();
        let (path, query) = match raw_url.find('?') {
            Some(pos) => (
                raw_url[..pos].to_owned(),
                Some(raw_url[pos + 1..].to_owned()),
            ),
            None => (raw_url.clone(), None),
        };
        let headers = Headers::build(headers);
        let host = headers.host().unwrap_or("localhost").to_owned();

        Request {
            method,
            http_version: HttpVersion(1, 1),
            secure: false,
            host,
            port: 80,
            path,
            query,
            raw_url,
            headers,
            remote_addr: "127.0.0.1:12345".parse().unwrap(),
            data: Mutex::new(Some(RequestBody::from_data(data))),
            _spill: None,
        }
    }
}
