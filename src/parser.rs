// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Turns a block of header bytes into either a validated request head or a
//! pre-formed error response.
//!
//! Failures are ordinary values here, not errors: the caller sends the
//! returned `Response` and closes the connection.

use crate::pipeline::error_response;
use crate::request::{Headers, HttpVersion, Method};
use crate::Response;

/// Everything known about a request before its body has been read.
#[derive(Debug)]
pub(crate) struct Head {
    pub method: Method,
    pub version: HttpVersion,
    pub path: String,
    pub query: Option<String>,
    pub raw_url: String,
    pub host: String,
    pub port: u16,
    pub headers: Headers,
    /// Effective body length; 0 when no `Content-Length` was sent.
    pub body_len: u64,
    pub expect_continue: bool,
    /// True when the client side of the keep-alive negotiation allows
    /// another request on this connection.
    pub client_keepalive: bool,
}

/// Parses the header block of a request, *excluding* the final empty line.
///
/// `secure` selects the default port when the `Host` header has none.
pub(crate) fn parse_head(block: &[u8], secure: bool, max_body_bytes: u64) -> Result<Head, Response> {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");

    let request_line = match lines.next() {
        Some(l) if !l.is_empty() => l,
        _ => return Err(error_response(400)),
    };
    let (method, target, version) = parse_request_line(request_line)?;

    let raw_headers = parse_header_lines(lines)?;
    let headers = Headers::build(raw_headers);

    if headers.content_length_invalid {
        return Err(error_response(400));
    }

    // Request target: origin form, or the absolute form proxies send.
    let (target_host, path_and_query) = split_target(target).ok_or_else(|| error_response(400))?;

    let host_value = match target_host.or_else(|| headers.host()) {
        Some(h) => h,
        None => return Err(error_response(400)),
    };
    let (host, port) = parse_host(host_value, secure).ok_or_else(|| error_response(400))?;

    if headers.expect_invalid {
        return Err(error_response(417));
    }

    let body_len = match headers.content_length() {
        Some(len) if len > max_body_bytes => return Err(error_response(413)),
        Some(len) => len,
        // A method that admits a body may leave the Content-Length out;
        // that is tolerated as an empty body.
        None if method.admits_body() => 0,
        // Bodyless methods have nothing to read in the first place.
        None => 0,
    };

    if body_len > 0 && headers.content_type().is_none() {
        return Err(error_response(400));
    }

    let (path, query) = match path_and_query.find('?') {
        Some(pos) => (
            path_and_query[..pos].to_owned(),
            Some(path_and_query[pos + 1..].to_owned()),
        ),
        None => (path_and_query.to_owned(), None),
    };

    let client_keepalive = version.is_one_one() && !headers.connection.close;
    let expect_continue = headers.expect_continue;

    Ok(Head {
        method,
        version,
        path,
        query,
        raw_url: target.to_owned(),
        host,
        port,
        headers,
        body_len,
        expect_continue,
        client_keepalive,
    })
}

// Parses the request line of the request.
// eg. GET / HTTP/1.1
fn parse_request_line(line: &str) -> Result<(Method, &str, HttpVersion), Response> {
    let mut words = line.split(' ');

    let (method, target, version) = match (words.next(), words.next(), words.next(), words.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(error_response(400)),
    };

    let version = parse_http_version(version)?;
    let method = match Method::from_token(method) {
        Some(m) => m,
        None => return Err(error_response(501)),
    };

    Ok((method, target, version))
}

// Parses a "HTTP/1.1" string. A structurally valid version that isn't 1.0
// or 1.1 is a 505; anything else is a 400.
fn parse_http_version(version: &str) -> Result<HttpVersion, Response> {
    let digits = match version.strip_prefix("HTTP/") {
        Some(d) => d,
        None => return Err(error_response(400)),
    };

    let mut elems = digits.splitn(2, '.');
    let major: Option<u8> = elems.next().and_then(|n| n.parse().ok());
    let minor: Option<u8> = elems.next().and_then(|n| n.parse().ok());

    match (major, minor) {
        (Some(1), Some(0)) => Ok(HttpVersion(1, 0)),
        (Some(1), Some(1)) => Ok(HttpVersion(1, 1)),
        (Some(_), Some(_)) => Err(error_response(505)),
        _ => Err(error_response(400)),
    }
}

// Header lines after the request line. Lines starting with a space or tab
// continue the previous header's value.
fn parse_header_lines<'a, I>(lines: I) -> Result<Vec<(String, String)>, Response>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in lines {
        if line.is_empty() {
            break;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.last_mut() {
                Some(&mut (_, ref mut value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(error_response(400)),
            }
            continue;
        }

        let colon = match line.find(':') {
            Some(pos) => pos,
            None => return Err(error_response(400)),
        };

        let name = &line[..colon];
        if name.is_empty() || !name.bytes().all(valid_header_name_byte) {
            return Err(error_response(400));
        }

        headers.push((name.to_owned(), line[colon + 1..].trim().to_owned()));
    }

    Ok(headers)
}

#[inline]
fn valid_header_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

// Splits a request target into an optional authority (absolute form only)
// and the path-and-query part.
fn split_target(target: &str) -> Option<(Option<&str>, &str)> {
    if target.starts_with('/') {
        return Some((None, target));
    }

    for scheme in &["http://", "https://"] {
        if let Some(rest) = strip_prefix_ignore_case(target, scheme) {
            return match rest.find('/') {
                Some(slash) => Some((Some(&rest[..slash]), &rest[slash..])),
                None if !rest.is_empty() => Some((Some(rest), "/")),
                None => None,
            };
        }
    }

    None
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

// Splits `example.com:8080` or `[::1]:8080` into name and port.
fn parse_host(value: &str, secure: bool) -> Option<(String, u16)> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let default_port = if secure { 443 } else { 80 };

    if let Some(rest) = value.strip_prefix('[') {
        // IPv6 literal.
        let close = rest.find(']')?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        return match after.strip_prefix(':') {
            Some(port) => Some((host.to_owned(), port.parse().ok()?)),
            None if after.is_empty() => Some((host.to_owned(), default_port)),
            None => None,
        };
    }

    match value.rfind(':') {
        Some(pos) => {
            let port = value[pos + 1..].parse().ok()?;
            Some((value[..pos].to_owned(), port))
        }
        None => Some((value.to_owned(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_head;
    use crate::request::HttpVersion;
    use crate::request::Method;

    fn parse(block: &str) -> Result<super::Head, crate::Response> {
        parse_head(block.as_bytes(), false, 64 * 1024 * 1024)
    }

    #[test]
    fn simple_get() {
        let head = parse("GET /hello?a=b HTTP/1.1\r\nHost: example.com\r\n").unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.version, HttpVersion(1, 1));
        assert_eq!(head.path, "/hello");
        assert_eq!(head.query.as_deref(), Some("a=b"));
        assert_eq!(head.host, "example.com");
        assert_eq!(head.port, 80);
        assert_eq!(head.body_len, 0);
        assert!(head.client_keepalive);
    }

    #[test]
    fn unknown_method_is_501() {
        let response = parse("GETT /x HTTP/1.1\r\nHost: h\r\n").unwrap_err();
        assert_eq!(response.status_code, 501);
    }

    #[test]
    fn unknown_version_is_505() {
        let response = parse("GET /x HTTP/2.0\r\nHost: h\r\n").unwrap_err();
        assert_eq!(response.status_code, 505);

        let response = parse("GET /x HTPP/1.1\r\nHost: h\r\n").unwrap_err();
        assert_eq!(response.status_code, 400);
    }

    #[test]
    fn missing_host_is_400() {
        let response = parse("GET /x HTTP/1.1\r\nUser-Agent: test\r\n").unwrap_err();
        assert_eq!(response.status_code, 400);
    }

    #[test]
    fn host_with_port() {
        let head = parse("GET / HTTP/1.1\r\nHost: example.com:8080\r\n").unwrap();
        assert_eq!(head.host, "example.com");
        assert_eq!(head.port, 8080);

        let head = parse("GET / HTTP/1.1\r\nHost: [::1]:9000\r\n").unwrap();
        assert_eq!(head.host, "::1");
        assert_eq!(head.port, 9000);
    }

    #[test]
    fn absolute_form_target() {
        let head = parse("GET http://mirror.local:81/pkg?x=1 HTTP/1.1\r\nHost: other\r\n").unwrap();
        assert_eq!(head.host, "mirror.local");
        assert_eq!(head.port, 81);
        assert_eq!(head.path, "/pkg");
        assert_eq!(head.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn continuation_lines_extend_previous_header() {
        let head = parse(
            "GET / HTTP/1.1\r\nHost: h\r\nX-Long: first\r\n\tsecond part\r\n  third\r\n",
        )
        .unwrap();
        assert_eq!(
            head.headers.get("x-long"),
            Some("first second part third")
        );
    }

    #[test]
    fn continuation_without_header_is_400() {
        let response = parse("GET / HTTP/1.1\r\n  orphan\r\nHost: h\r\n").unwrap_err();
        assert_eq!(response.status_code, 400);
    }

    #[test]
    fn bad_header_name_is_400() {
        let response = parse("GET / HTTP/1.1\r\nHost: h\r\nB@d: x\r\n").unwrap_err();
        assert_eq!(response.status_code, 400);
    }

    #[test]
    fn unexpected_expectation_is_417() {
        let response = parse(
            "POST / HTTP/1.1\r\nHost: h\r\nExpect: something-else\r\n",
        )
        .unwrap_err();
        assert_eq!(response.status_code, 417);
    }

    #[test]
    fn expect_continue_is_recognised() {
        let head = parse(
            "POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nContent-Type: text/plain\r\nExpect: 100-continue\r\n",
        )
        .unwrap();
        assert!(head.expect_continue);
        assert_eq!(head.body_len, 5);
    }

    #[test]
    fn oversized_body_is_413() {
        let response = parse_head(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 2048\r\nContent-Type: text/plain\r\n",
            false,
            1024,
        )
        .unwrap_err();
        assert_eq!(response.status_code, 413);
    }

    #[test]
    fn body_without_content_type_is_400() {
        let response =
            parse("POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n").unwrap_err();
        assert_eq!(response.status_code, 400);
    }

    #[test]
    fn missing_length_tolerated_as_empty() {
        // Body-admitting method without a Content-Length.
        let head = parse("POST / HTTP/1.1\r\nHost: h\r\n").unwrap();
        assert_eq!(head.body_len, 0);

        // Bodyless method.
        let head = parse("GET / HTTP/1.1\r\nHost: h\r\n").unwrap();
        assert_eq!(head.body_len, 0);
    }

    #[test]
    fn http10_is_never_keepalive() {
        let head = parse("GET / HTTP/1.0\r\nHost: h\r\n").unwrap();
        assert!(!head.client_keepalive);
    }

    #[test]
    fn connection_close_disables_keepalive() {
        let head = parse("GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n").unwrap();
        assert!(!head.client_keepalive);
    }

    #[test]
    fn reparsing_emitted_headers_reproduces_typed_values() {
        let head = parse(
            "GET / HTTP/1.1\r\nHost: h\r\nAccept-Encoding: br;q=0.8, gzip\r\nContent-Length: 0\r\nCookie: k=v\r\n",
        )
        .unwrap();

        // Re-serialize the raw list the way the wire would carry it, parse
        // it again, and compare the typed views.
        let mut rebuilt = String::from("GET / HTTP/1.1\r\n");
        for &(ref name, ref value) in head.headers.raw() {
            rebuilt.push_str(name);
            rebuilt.push_str(": ");
            rebuilt.push_str(value);
            rebuilt.push_str("\r\n");
        }
        let reparsed = parse(&rebuilt).unwrap();

        assert_eq!(
            head.headers.accept_encoding(),
            reparsed.headers.accept_encoding()
        );
        assert_eq!(
            head.headers.content_length(),
            reparsed.headers.content_length()
        );
        assert_eq!(head.headers.cookies(), reparsed.headers.cookies());
    }
}
