// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Writes a [`Response`] out as wire bytes.
//!
//! The pipeline picks exactly one output mode per response: headers only,
//! WebSocket switch, single or multipart byte range, gzip (in memory,
//! streamed to close, or inside chunks), chunked, plain `Content-Length`
//! streaming, or stream-until-close. The response the handler built is
//! consumed here and never handed back.

use std::borrow::Cow;
use std::io;
use std::io::Read;
use std::io::Write;
use std::time::SystemTime;

use crate::config::Config;
use crate::request::{HttpVersion, RangeSpec};
use crate::response::{Response, ResponseBody};
use crate::Upgrade;

pub(crate) mod chunked;
pub(crate) mod content_encoding;
pub(crate) mod range;

use self::chunked::ChunkedWriter;

/// Bodies this large or smaller never get the `Accept-Ranges` treatment.
const MIN_RANGEABLE_BODY: u64 = 16 * 1024;

/// The facts about the request that the pipeline needs after the `Request`
/// object itself has been consumed by the handler.
pub(crate) struct RequestFacts {
    pub is_head: bool,
    pub version: HttpVersion,
    pub accepts_gzip: bool,
    pub ranges: Option<Vec<RangeSpec>>,
    pub connection_upgrade: bool,
    pub upgrade_websocket: bool,
    pub websocket_key: Option<String>,
}

/// What happened to the connection once the response went out.
pub(crate) struct Emitted {
    pub keep_alive: bool,
    pub upgrade: Option<Box<dyn Upgrade + Send>>,
}

fn done(keep_alive: bool) -> Emitted {
    Emitted {
        keep_alive,
        upgrade: None,
    }
}

// Runs the response's cleanup callback when the emission scope exits,
// whatever the reason.
struct CleanupGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

/// Serializes `response` into `out`.
///
/// `keep_alive_in` is the verdict of the keep-alive negotiation so far
/// (client headers and server shutdown state); the pipeline can only
/// downgrade it. Write errors on `out` are transport errors and bubble up;
/// body *read* errors are rendered into the stream per the configuration.
pub(crate) fn emit_response(
    mut response: Response,
    facts: &RequestFacts,
    keep_alive_in: bool,
    config: &Config,
    out: &mut dyn Write,
) -> io::Result<Emitted> {
    let _cleanup = CleanupGuard(response.cleanup.take());

    // The switch variant branches off before anything else.
    if response.upgrade.is_some() {
        return emit_switch(response, facts, out);
    }

    let status = response.status_code;
    let keep_alive = keep_alive_in;

    // Statuses that don't allow a body: headers only. A 304 also hides the
    // Content-Type, and never announces a length.
    if status / 100 == 1 || status == 204 || status == 304 {
        if response.data.len() != Some(0) {
            log::warn!(
                "response with status {} carries a body; it will not be sent",
                status
            );
        }
        write_head(
            out,
            HeadParams {
                version: facts.version,
                status,
                user_headers: &response.headers,
                suppress_content_type: status == 304,
                default_content_type: None,
                extra: &[],
                connection: conn(keep_alive),
            },
        )?;
        return Ok(done(keep_alive));
    }

    let len = response.data.len();

    // Empty body of known length.
    if len == Some(0) {
        write_head(
            out,
            HeadParams {
                version: facts.version,
                status,
                user_headers: &response.headers,
                suppress_content_type: false,
                default_content_type: None,
                extra: &[("Content-Length", "0".into())],
                connection: conn(keep_alive),
            },
        )?;
        return Ok(done(keep_alive));
    }

    // Byte ranges, for large seekable 200 responses on HTTP/1.1.
    let mut advertise_ranges = false;
    if facts.version.is_one_one() && status == 200 && response.data.is_seekable() {
        if let Some(total) = len {
            if total > MIN_RANGEABLE_BODY {
                advertise_ranges = true;
                if let Some(specs) = facts.ranges.as_deref() {
                    let set = range::canonicalize(specs, total);
                    if !set.is_empty() && !range::spans_whole(&set, total) {
                        if set.len() == 1 {
                            return emit_single_range(
                                response, facts, keep_alive, config, set[0], total, out,
                            );
                        } else {
                            return emit_multipart_ranges(
                                response, facts, keep_alive, config, &set, total, out,
                            );
                        }
                    }
                }
            }
        }
    }

    // Gzip?
    #[allow(unused_mut)]
    let mut use_gzip = content_encoding::gzip_enabled(
        facts.accepts_gzip,
        facts.version.is_one_one(),
        response.gzip,
        len,
    );

    #[cfg(feature = "gzip")]
    {
        use crate::response::GzipPolicy;

        if use_gzip && response.gzip == GzipPolicy::Autodetect {
            if let Some(total) = len {
                if total >= config.gzip_auto_threshold && response.data.is_seekable() {
                    if !content_encoding::sample_compresses_well(
                        &mut response.data,
                        total,
                        config.gzip_auto_threshold,
                    )? {
                        use_gzip = false;
                    }
                }
            }
        }

        if use_gzip {
            return emit_gzip(response, facts, keep_alive, config, advertise_ranges, out);
        }
    }
    let _ = use_gzip;

    // Plain framing.
    if let Some(total) = len {
        let total_str = itoa::Buffer::new().format(total).to_owned();
        write_head(
            out,
            HeadParams {
                version: facts.version,
                status,
                user_headers: &response.headers,
                suppress_content_type: false,
                default_content_type: Some(&config.default_content_type),
                extra: &with_ranges(advertise_ranges, &[("Content-Length", total_str.into())]),
                connection: conn(keep_alive),
            },
        )?;
        if facts.is_head {
            return Ok(done(keep_alive));
        }

        let (outcome, copied) = pump(&mut response.data.by_ref().take(total), out)?;
        match outcome {
            CopyOutcome::Clean if copied == total => Ok(done(keep_alive)),
            CopyOutcome::Clean => {
                // The body ran dry before the announced length.
                let err = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "response body shorter than its announced length",
                );
                append_producer_error(out, &response.headers, &err, config)?;
                Ok(done(false))
            }
            CopyOutcome::ProducerError(err) => {
                append_producer_error(out, &response.headers, &err, config)?;
                Ok(done(false))
            }
        }
    } else if keep_alive {
        write_head(
            out,
            HeadParams {
                version: facts.version,
                status,
                user_headers: &response.headers,
                suppress_content_type: false,
                default_content_type: Some(&config.default_content_type),
                extra: &[("Transfer-Encoding", "chunked".into())],
                connection: conn(true),
            },
        )?;
        if facts.is_head {
            return Ok(done(true));
        }

        let mut chunked = ChunkedWriter::new(&mut *out);
        let (outcome, _) = pump(&mut response.data, &mut chunked)?;
        match outcome {
            CopyOutcome::Clean => {
                chunked.finish()?;
                Ok(done(true))
            }
            CopyOutcome::ProducerError(err) => {
                // Leaving the chunked stream unterminated tells the client
                // something went wrong.
                drop(chunked);
                append_producer_error(out, &response.headers, &err, config)?;
                Ok(done(false))
            }
        }
    } else {
        // Unknown length without keep-alive: the end of the connection
        // delimits the body.
        write_head(
            out,
            HeadParams {
                version: facts.version,
                status,
                user_headers: &response.headers,
                suppress_content_type: false,
                default_content_type: Some(&config.default_content_type),
                extra: &[],
                connection: ConnectionDirective::Close,
            },
        )?;
        if facts.is_head {
            return Ok(done(false));
        }

        let (outcome, _) = pump(&mut response.data, out)?;
        if let CopyOutcome::ProducerError(err) = outcome {
            append_producer_error(out, &response.headers, &err, config)?;
        }
        Ok(done(false))
    }
}

// 101 Switching Protocols. The caller takes over the socket afterwards.
fn emit_switch(
    mut response: Response,
    facts: &RequestFacts,
    out: &mut dyn Write,
) -> io::Result<Emitted> {
    let upgrade = response.upgrade.take().unwrap();

    let key = match facts.websocket_key {
        Some(ref key) if facts.connection_upgrade && facts.upgrade_websocket => key,
        _ => {
            log::warn!("switch response to a request that is not a websocket upgrade");
            write_head(
                out,
                HeadParams {
                    version: facts.version,
                    status: 500,
                    user_headers: &[],
                    suppress_content_type: false,
                    default_content_type: None,
                    extra: &[("Content-Length", "0".into())],
                    connection: ConnectionDirective::Close,
                },
            )?;
            return Ok(done(false));
        }
    };

    let accept = crate::websocket::accept_key(key);
    write_head(
        out,
        HeadParams {
            version: facts.version,
            status: 101,
            user_headers: &response.headers,
            suppress_content_type: false,
            default_content_type: None,
            extra: &[("Upgrade", "websocket".into()), ("Sec-WebSocket-Accept", accept.into())],
            connection: ConnectionDirective::Upgrade,
        },
    )?;

    Ok(Emitted {
        keep_alive: false,
        upgrade: Some(upgrade),
    })
}

// 206 with a single sub-range.
fn emit_single_range(
    mut response: Response,
    facts: &RequestFacts,
    keep_alive: bool,
    config: &Config,
    (first, last): (u64, u64),
    total: u64,
    out: &mut dyn Write,
) -> io::Result<Emitted> {
    let part_len = last - first + 1;
    let content_range = format!("bytes {}-{}/{}", first, last, total);
    let len_str = itoa::Buffer::new().format(part_len).to_owned();

    write_head(
        out,
        HeadParams {
            version: facts.version,
            status: 206,
            user_headers: &response.headers,
            suppress_content_type: false,
            default_content_type: Some(&config.default_content_type),
            extra: &[
                ("Accept-Ranges", "bytes".into()),
                ("Content-Range", content_range.into()),
                ("Content-Length", len_str.into()),
            ],
            connection: conn(keep_alive),
        },
    )?;
    if facts.is_head {
        return Ok(done(keep_alive));
    }

    response.data.seek_to(first)?;
    let (outcome, copied) = pump(&mut response.data.by_ref().take(part_len), out)?;
    match outcome {
        CopyOutcome::Clean if copied == part_len => Ok(done(keep_alive)),
        CopyOutcome::Clean => Ok(done(false)),
        CopyOutcome::ProducerError(err) => {
            append_producer_error(out, &response.headers, &err, config)?;
            Ok(done(false))
        }
    }
}

// 206 with several sub-ranges, as a multipart/byteranges body whose exact
// length is known before the headers go out.
fn emit_multipart_ranges(
    mut response: Response,
    facts: &RequestFacts,
    keep_alive: bool,
    config: &Config,
    set: &[(u64, u64)],
    total: u64,
    out: &mut dyn Write,
) -> io::Result<Emitted> {
    let part_content_type = response
        .headers
        .iter()
        .find(|&&(ref k, _)| k.eq_ignore_ascii_case("Content-Type"))
        .map(|&(_, ref v)| v.to_string())
        .unwrap_or_else(|| config.default_content_type.to_string());

    let layout = range::MultipartRanges::new(set, total, Some(&part_content_type));
    let top_content_type = format!("multipart/byteranges; boundary={}", layout.boundary);
    let len_str = itoa::Buffer::new().format(layout.total_len).to_owned();

    write_head(
        out,
        HeadParams {
            version: facts.version,
            status: 206,
            user_headers: &response.headers,
            // The original Content-Type moves into the parts.
            suppress_content_type: true,
            default_content_type: None,
            extra: &[
                ("Accept-Ranges", "bytes".into()),
                ("Content-Type", top_content_type.into()),
                ("Content-Length", len_str.into()),
            ],
            connection: conn(keep_alive),
        },
    )?;
    if facts.is_head {
        return Ok(done(keep_alive));
    }

    for &(ref header, first, last) in &layout.parts {
        out.write_all(header.as_bytes())?;

        response.data.seek_to(first)?;
        let part_len = last - first + 1;
        let (outcome, copied) = pump(&mut response.data.by_ref().take(part_len), out)?;
        match outcome {
            CopyOutcome::Clean if copied == part_len => {}
            CopyOutcome::Clean => return Ok(done(false)),
            CopyOutcome::ProducerError(err) => {
                append_producer_error(out, &response.headers, &err, config)?;
                return Ok(done(false));
            }
        }
        out.write_all(b"\r\n")?;
    }
    out.write_all(layout.closing.as_bytes())?;

    Ok(done(keep_alive))
}

// All the gzip framings. Only compiled with the `gzip` feature.
#[cfg(feature = "gzip")]
fn emit_gzip(
    mut response: Response,
    facts: &RequestFacts,
    keep_alive: bool,
    config: &Config,
    advertise_ranges: bool,
    out: &mut dyn Write,
) -> io::Result<Emitted> {
    use deflate::write::GzEncoder;
    use deflate::Compression;

    let status = response.status_code;
    let len = response.data.len();

    // Small enough: compress fully in memory and announce the exact size.
    if let Some(total) = len {
        if total < config.gzip_inmemory_max {
            let mut raw = Vec::with_capacity(total as usize);
            if let Err(err) = response.data.read_to_end(&mut raw) {
                // Nothing sent yet, so this can still be a clean 500.
                return emit_read_failure_500(facts, out, err);
            }

            let zipped = content_encoding::compress_in_memory(&raw);
            let len_str = itoa::Buffer::new().format(zipped.len()).to_owned();
            write_head(
                out,
                HeadParams {
                    version: facts.version,
                    status,
                    user_headers: &response.headers,
                    suppress_content_type: false,
                    default_content_type: Some(&config.default_content_type),
                    extra: &with_ranges(
                        advertise_ranges,
                        &[
                            ("Content-Encoding", "gzip".into()),
                            ("Content-Length", len_str.into()),
                        ],
                    ),
                    connection: conn(keep_alive),
                },
            )?;
            if !facts.is_head {
                out.write_all(&zipped)?;
            }
            return Ok(done(keep_alive));
        }
    }

    if !keep_alive {
        // Compressed stream, delimited by closing the connection.
        write_head(
            out,
            HeadParams {
                version: facts.version,
                status,
                user_headers: &response.headers,
                suppress_content_type: false,
                default_content_type: Some(&config.default_content_type),
                extra: &with_ranges(advertise_ranges, &[("Content-Encoding", "gzip".into())]),
                connection: ConnectionDirective::Close,
            },
        )?;
        if facts.is_head {
            return Ok(done(false));
        }

        let mut encoder = GzEncoder::new(&mut *out, Compression::Default);
        let (outcome, _) = pump(&mut response.data, &mut encoder)?;
        match outcome {
            CopyOutcome::Clean => {
                encoder.finish()?;
            }
            CopyOutcome::ProducerError(err) => {
                drop(encoder);
                append_producer_error(out, &response.headers, &err, config)?;
            }
        }
        return Ok(done(false));
    }

    // Compressed stream inside chunked framing, keeping the connection.
    write_head(
        out,
        HeadParams {
            version: facts.version,
            status,
            user_headers: &response.headers,
            suppress_content_type: false,
            default_content_type: Some(&config.default_content_type),
            extra: &with_ranges(
                advertise_ranges,
                &[
                    ("Content-Encoding", "gzip".into()),
                    ("Transfer-Encoding", "chunked".into()),
                ],
            ),
            connection: conn(true),
        },
    )?;
    if facts.is_head {
        return Ok(done(true));
    }

    let chunked = ChunkedWriter::new(&mut *out);
    let mut encoder = GzEncoder::new(chunked, Compression::Default);
    let (outcome, _) = pump(&mut response.data, &mut encoder)?;
    match outcome {
        CopyOutcome::Clean => {
            let chunked = encoder.finish()?;
            chunked.finish()?;
            Ok(done(true))
        }
        CopyOutcome::ProducerError(err) => {
            drop(encoder);
            append_producer_error(out, &response.headers, &err, config)?;
            Ok(done(false))
        }
    }
}

// A body read failed before any byte hit the wire: a plain 500 is still
// possible.
fn emit_read_failure_500(
    facts: &RequestFacts,
    out: &mut dyn Write,
    err: io::Error,
) -> io::Result<Emitted> {
    log::error!("error while reading a response body: {}", err);
    write_head(
        out,
        HeadParams {
            version: facts.version,
            status: 500,
            user_headers: &[],
            suppress_content_type: false,
            default_content_type: None,
            extra: &[("Content-Length", "0".into())],
            connection: ConnectionDirective::Close,
        },
    )?;
    Ok(done(false))
}

enum CopyOutcome {
    Clean,
    ProducerError(io::Error),
}

// Copies a body into the output. Read failures are the producer's fault
// and come back as a value; write failures are transport errors and come
// back as `Err`.
fn pump(reader: &mut dyn Read, out: &mut dyn Write) -> io::Result<(CopyOutcome, u64)> {
    let mut buf = [0u8; 8192];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok((CopyOutcome::Clean, copied)),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Ok((CopyOutcome::ProducerError(e), copied)),
        };
        out.write_all(&buf[..n])?;
        copied += n as u64;
    }
}

// Renders a body-producer failure into the already-started output stream,
// then reports it. The framing is knowingly left broken so the client sees
// the truncation.
fn append_producer_error(
    out: &mut dyn Write,
    response_headers: &[(Cow<'static, str>, Cow<'static, str>)],
    err: &io::Error,
    config: &Config,
) -> io::Result<()> {
    log::error!("error while producing a response body: {}", err);
    if let Some(ref hook) = config.error_hook {
        hook(err);
    }

    let is_html = response_headers.iter().any(|&(ref k, ref v)| {
        k.eq_ignore_ascii_case("Content-Type") && v.to_ascii_lowercase().starts_with("text/html")
    });

    if is_html {
        out.write_all(b"\n<h1>Internal Server Error</h1>")?;
        out.write_all(b"\n<p>An error has occurred while producing this response.</p>")?;
        if config.output_exception_info {
            write!(out, "\n<pre>{}</pre>", err)?;
        }
    } else {
        out.write_all(b"\n\nInternal Server Error: the response was cut short.")?;
        if config.output_exception_info {
            write!(out, "\n{}", err)?;
        }
    }
    Ok(())
}

// Prepends the Accept-Ranges advertisement when it applies.
fn with_ranges(
    advertise: bool,
    extra: &[(&'static str, Cow<'static, str>)],
) -> Vec<(&'static str, Cow<'static, str>)> {
    let mut out = Vec::with_capacity(extra.len() + 1);
    if advertise {
        out.push(("Accept-Ranges", Cow::from("bytes")));
    }
    out.extend(extra.iter().cloned());
    out
}

enum ConnectionDirective {
    KeepAlive,
    Close,
    Upgrade,
}

fn conn(keep_alive: bool) -> ConnectionDirective {
    if keep_alive {
        ConnectionDirective::KeepAlive
    } else {
        ConnectionDirective::Close
    }
}

struct HeadParams<'a> {
    version: HttpVersion,
    status: u16,
    user_headers: &'a [(Cow<'static, str>, Cow<'static, str>)],
    suppress_content_type: bool,
    /// When set, a `Content-Type` is guaranteed: the user's if present,
    /// this one otherwise.
    default_content_type: Option<&'a str>,
    extra: &'a [(&'static str, Cow<'a, str>)],
    connection: ConnectionDirective,
}

// Headers whose values describe the connection framing; the pipeline owns
// them and ignores handler-provided values.
fn is_managed_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("Accept-Ranges")
        || name.eq_ignore_ascii_case("Connection")
        || name.eq_ignore_ascii_case("Content-Encoding")
        || name.eq_ignore_ascii_case("Content-Length")
        || name.eq_ignore_ascii_case("Content-Range")
        || name.eq_ignore_ascii_case("Trailer")
        || name.eq_ignore_ascii_case("Transfer-Encoding")
        || name.eq_ignore_ascii_case("Upgrade")
}

// Writes the status line and headers of the response to `out`.
fn write_head(out: &mut dyn Write, params: HeadParams<'_>) -> io::Result<()> {
    let mut status_buf = itoa::Buffer::new();

    write!(out, "HTTP/{}.{} ", params.version.0, params.version.1)?;
    out.write_all(status_buf.format(params.status).as_bytes())?;
    out.write_all(b" ")?;
    out.write_all(reason_phrase(params.status).as_bytes())?;
    out.write_all(b"\r\n")?;

    let mut found_server = false;
    let mut found_date = false;
    let mut found_content_type = false;

    for &(ref name, ref value) in params.user_headers {
        if is_managed_header(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("Content-Type") {
            if params.suppress_content_type {
                continue;
            }
            found_content_type = true;
        }
        if name.eq_ignore_ascii_case("Server") {
            found_server = true;
        }
        if name.eq_ignore_ascii_case("Date") {
            found_date = true;
        }

        out.write_all(name.as_bytes())?;
        out.write_all(b": ")?;
        out.write_all(value.as_bytes())?;
        out.write_all(b"\r\n")?;
    }

    if !found_server {
        out.write_all(b"Server: hearth\r\n")?;
    }
    if !found_date {
        write!(out, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()))?;
    }
    if let Some(default_ct) = params.default_content_type {
        if !found_content_type && !params.suppress_content_type {
            write!(out, "Content-Type: {}\r\n", default_ct)?;
        }
    }

    for &(name, ref value) in params.extra {
        out.write_all(name.as_bytes())?;
        out.write_all(b": ")?;
        out.write_all(value.as_bytes())?;
        out.write_all(b"\r\n")?;
    }

    match params.connection {
        ConnectionDirective::KeepAlive => {}
        ConnectionDirective::Close => out.write_all(b"Connection: close\r\n")?,
        ConnectionDirective::Upgrade => out.write_all(b"Connection: Upgrade\r\n")?,
    }

    out.write_all(b"\r\n")?;
    Ok(())
}

/// A pre-formed error response for a protocol violation. The caller is
/// expected to forbid keep-alive when sending one of these.
pub(crate) fn error_response(status: u16) -> Response {
    use crate::response::GzipPolicy;

    let body = match status {
        505 => Cow::from("This server only supports HTTP versions 1.0 and 1.1"),
        _ => Cow::from(reason_phrase(status)),
    };

    Response {
        status_code: status,
        headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
        data: ResponseBody::from_string(body.into_owned()),
        gzip: GzipPolicy::Never,
        upgrade: None,
        cleanup: None,
    }
}

// Returns the phrase corresponding to a status code.
pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
