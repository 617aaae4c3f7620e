// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::borrow::Cow;
use std::fs::File;
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

use crate::Request;
use crate::Upgrade;

/// Whether the server may compress the body of a response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GzipPolicy {
    /// Never compress this response.
    Never,
    /// Compress whenever the client supports it.
    Always,
    /// Compress unless a sample of the body shows it's already dense
    /// (media files, archives, ...).
    Autodetect,
}

/// Contains a prototype of a response.
///
/// The response is only sent to the client when you return the `Response`
/// object from your request handler.
pub struct Response {
    /// The status code to return to the user.
    pub status_code: u16,

    /// List of headers to be returned in the response.
    ///
    /// The value of the following headers is managed by the connection and
    /// will be ignored from this list, even if present:
    ///
    /// - Accept-Ranges
    /// - Connection
    /// - Content-Encoding
    /// - Content-Length
    /// - Content-Range
    /// - Trailer
    /// - Transfer-Encoding
    /// - Upgrade
    ///
    /// The reason is that these headers are too low-level; they describe
    /// the framing of the connection rather than the content, and the
    /// framing is chosen when the response is written out.
    pub headers: Vec<(Cow<'static, str>, Cow<'static, str>)>,

    /// An opaque type that contains the body of the response.
    pub data: ResponseBody,

    /// Compression policy for the body.
    pub gzip: GzipPolicy,

    /// If set, the connection hands its socket to this object after the
    /// response headers have been written, and stops speaking HTTP on it.
    pub upgrade: Option<Box<dyn Upgrade + Send>>,

    /// Runs once the response has been written out, whether or not writing
    /// succeeded.
    pub cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status_code", &self.status_code)
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("gzip", &self.gzip)
            .field("upgrade", &self.upgrade.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

impl Response {
    /// Returns true if the status code of this `Response` indicates success.
    ///
    /// This is the range [200-399].
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 400
    }

    /// Shortcut for `!response.is_success()`.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    fn with_body(status_code: u16, content_type: &'static str, data: ResponseBody) -> Response {
        Response {
            status_code,
            headers: vec![("Content-Type".into(), content_type.into())],
            data,
            gzip: GzipPolicy::Autodetect,
            upgrade: None,
            cleanup: None,
        }
    }

    /// Builds a `Response` that outputs HTML.
    #[inline]
    pub fn html<D>(content: D) -> Response
    where
        D: Into<String>,
    {
        Response::with_body(
            200,
            "text/html; charset=utf-8",
            ResponseBody::from_string(content),
        )
    }

    /// Builds a `Response` that outputs plain text.
    #[inline]
    pub fn text<S>(text: S) -> Response
    where
        S: Into<String>,
    {
        Response::with_body(
            200,
            "text/plain; charset=utf-8",
            ResponseBody::from_string(text),
        )
    }

    /// Builds a `Response` that outputs SVG.
    #[inline]
    pub fn svg<D>(content: D) -> Response
    where
        D: Into<String>,
    {
        Response::with_body(
            200,
            "image/svg+xml; charset=utf-8",
            ResponseBody::from_string(content),
        )
    }

    /// Builds a `Response` that serves a file, with the given content type.
    ///
    /// Files are seekable, which makes the response eligible for byte-range
    /// serving when it is large enough.
    #[inline]
    pub fn from_file<C>(content_type: C, file: File) -> Response
    where
        C: Into<Cow<'static, str>>,
    {
        Response {
            status_code: 200,
            headers: vec![("Content-Type".into(), content_type.into())],
            data: ResponseBody::from_file(file),
            gzip: GzipPolicy::Autodetect,
            upgrade: None,
            cleanup: None,
        }
    }

    /// Builds an empty `Response` with the given status code.
    #[inline]
    pub fn empty(status_code: u16) -> Response {
        Response {
            status_code,
            headers: Vec::new(),
            data: ResponseBody::empty(),
            gzip: GzipPolicy::Autodetect,
            upgrade: None,
            cleanup: None,
        }
    }

    /// Builds an empty `Response` with a 400 status code.
    #[inline]
    pub fn empty_400() -> Response {
        Response::empty(400)
    }

    /// Builds an empty `Response` with a 404 status code.
    #[inline]
    pub fn empty_404() -> Response {
        Response::empty(404)
    }

    /// Builds a `Response` that redirects the user to another URL with a
    /// 301 status code. This semantically means a permanent redirect.
    #[inline]
    pub fn redirect_301<S>(target: S) -> Response
    where
        S: Into<Cow<'static, str>>,
    {
        Response {
            status_code: 301,
            headers: vec![("Location".into(), target.into())],
            data: ResponseBody::empty(),
            gzip: GzipPolicy::Autodetect,
            upgrade: None,
            cleanup: None,
        }
    }

    /// Builds a `Response` that redirects the user to another URL with a
    /// 302 status code. This semantically means a temporary redirect.
    #[inline]
    pub fn redirect_302<S>(target: S) -> Response
    where
        S: Into<Cow<'static, str>>,
    {
        Response {
            status_code: 302,
            headers: vec![("Location".into(), target.into())],
            data: ResponseBody::empty(),
            gzip: GzipPolicy::Autodetect,
            upgrade: None,
            cleanup: None,
        }
    }

    /// Builds a `Response` that redirects with a 303 "See Other" status
    /// code, usually returned from a POST to point at the result page.
    #[inline]
    pub fn redirect_303<S>(target: S) -> Response
    where
        S: Into<Cow<'static, str>>,
    {
        Response {
            status_code: 303,
            headers: vec![("Location".into(), target.into())],
            data: ResponseBody::empty(),
            gzip: GzipPolicy::Autodetect,
            upgrade: None,
            cleanup: None,
        }
    }

    /// Changes the status code of the response.
    #[inline]
    pub fn with_status_code(mut self, code: u16) -> Response {
        self.status_code = code;
        self
    }

    /// Changes the compression policy of the response.
    #[inline]
    pub fn with_gzip_policy(mut self, policy: GzipPolicy) -> Response {
        self.gzip = policy;
        self
    }

    /// Registers a function to run once the response has been written out,
    /// successfully or not. Use this to release resources tied to the body.
    #[inline]
    pub fn with_cleanup<F>(mut self, cleanup: F) -> Response
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Adds or replaces a `ETag` header to the response, and turns the
    /// response into an empty 304 response if the ETag matches a
    /// `If-None-Match` header of the request.
    ///
    /// An ETag is a unique representation of the content of a resource.
    /// If the content of the resource changes, the ETag should change as
    /// well.
    pub fn with_etag<E>(mut self, request: &Request, etag: E) -> Response
    where
        E: Into<Cow<'static, str>>,
    {
        if !self.is_success() {
            return self;
        }

        let etag = etag.into();

        let not_modified = request.headers().if_none_match() == Some(&etag[..]);
        if not_modified {
            self.data = ResponseBody::empty();
            self.status_code = 304;
        }

        self.with_etag_keep(etag)
    }

    /// Adds a `ETag` header to the response, or replaces an existing header
    /// if there is one, without comparing it against the request.
    pub fn with_etag_keep<E>(mut self, etag: E) -> Response
    where
        E: Into<Cow<'static, str>>,
    {
        let mut etag = Some(etag.into());

        for &mut (ref key, ref mut val) in self.headers.iter_mut() {
            if key.eq_ignore_ascii_case("ETag") {
                *val = etag.take().unwrap();
                break;
            }
        }

        if let Some(etag) = etag {
            self.headers.push(("ETag".into(), etag));
        }

        self
    }
}

/// An opaque type that represents the body of a response.
///
/// You can't access the inside of this struct, but you can build one by
/// using one of the provided constructors.
pub struct ResponseBody {
    inner: ResponseBodyInner,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody").finish()
    }
}

enum ResponseBodyInner {
    Empty,
    Buffer(Cursor<Vec<u8>>),
    File {
        file: File,
        len: u64,
    },
    Reader {
        reader: Box<dyn Read + Send>,
        len: Option<u64>,
    },
}

impl ResponseBody {
    /// Builds a `ResponseBody` that doesn't return any data.
    #[inline]
    pub fn empty() -> ResponseBody {
        ResponseBody {
            inner: ResponseBodyInner::Empty,
        }
    }

    /// Builds a new `ResponseBody` that returns the given data.
    #[inline]
    pub fn from_data<D>(data: D) -> ResponseBody
    where
        D: Into<Vec<u8>>,
    {
        ResponseBody {
            inner: ResponseBodyInner::Buffer(Cursor::new(data.into())),
        }
    }

    /// Builds a new `ResponseBody` that returns an UTF-8 string.
    #[inline]
    pub fn from_string<S>(data: S) -> ResponseBody
    where
        S: Into<String>,
    {
        ResponseBody::from_data(data.into().into_bytes())
    }

    /// Builds a new `ResponseBody` that returns the content of the given
    /// file.
    pub fn from_file(file: File) -> ResponseBody {
        match file.metadata() {
            Ok(metadata) => ResponseBody {
                inner: ResponseBodyInner::File {
                    file,
                    len: metadata.len(),
                },
            },
            // Without a length the body is still usable, just not seekable.
            Err(_) => ResponseBody {
                inner: ResponseBodyInner::Reader {
                    reader: Box::new(file),
                    len: None,
                },
            },
        }
    }

    /// Builds a new `ResponseBody` that will read the data from a `Read`.
    ///
    /// The length isn't known in advance, so the response can't be served
    /// with an exact `Content-Length` nor by ranges.
    #[inline]
    pub fn from_reader<R>(data: R) -> ResponseBody
    where
        R: Read + Send + 'static,
    {
        ResponseBody {
            inner: ResponseBodyInner::Reader {
                reader: Box::new(data),
                len: None,
            },
        }
    }

    /// Same as `from_reader`, but with a length promise. The reader must
    /// yield exactly that many bytes.
    #[inline]
    pub fn from_reader_and_size<R>(data: R, size: u64) -> ResponseBody
    where
        R: Read + Send + 'static,
    {
        ResponseBody {
            inner: ResponseBodyInner::Reader {
                reader: Box::new(data),
                len: Some(size),
            },
        }
    }

    /// Number of bytes the body will yield, when known.
    pub(crate) fn len(&self) -> Option<u64> {
        match self.inner {
            ResponseBodyInner::Empty => Some(0),
            ResponseBodyInner::Buffer(ref cursor) => Some(cursor.get_ref().len() as u64),
            ResponseBodyInner::File { len, .. } => Some(len),
            ResponseBodyInner::Reader { len, .. } => len,
        }
    }

    /// True when the body supports `seek_to`, which byte-range serving and
    /// gzip autodetection need.
    pub(crate) fn is_seekable(&self) -> bool {
        match self.inner {
            ResponseBodyInner::Buffer(_) | ResponseBodyInner::File { .. } => true,
            ResponseBodyInner::Empty | ResponseBodyInner::Reader { .. } => false,
        }
    }

    /// Moves the read position. Only valid on seekable bodies.
    pub(crate) fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        match self.inner {
            ResponseBodyInner::Buffer(ref mut cursor) => {
                cursor.set_position(pos);
                Ok(())
            }
            ResponseBodyInner::File { ref mut file, .. } => {
                file.seek(SeekFrom::Start(pos)).map(|_| ())
            }
            ResponseBodyInner::Empty | ResponseBodyInner::Reader { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "body is not seekable",
            )),
        }
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner {
            ResponseBodyInner::Empty => Ok(0),
            ResponseBodyInner::Buffer(ref mut cursor) => cursor.read(buf),
            ResponseBodyInner::File { ref mut file, .. } => file.read(buf),
            ResponseBodyInner::Reader { ref mut reader, .. } => reader.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Response, ResponseBody};
    use crate::Request;
    use std::io::Read;

    #[test]
    fn body_lengths() {
        assert_eq!(ResponseBody::empty().len(), Some(0));
        assert_eq!(ResponseBody::from_string("hello").len(), Some(5));
        assert_eq!(ResponseBody::from_reader(std::io::empty()).len(), None);
        assert_eq!(
            ResponseBody::from_reader_and_size(std::io::empty(), 0).len(),
            Some(0)
        );
    }

    #[test]
    fn buffer_seek() {
        let mut body = ResponseBody::from_string("hello world");
        assert!(body.is_seekable());
        body.seek_to(6).unwrap();
        let mut out = String::new();
        body.read_to_string(&mut out).unwrap();
        assert_eq!(out, "world");
    }

    #[test]
    fn etag_match_turns_into_304() {
        let request = Request::fake_http(
            "GET",
            "/",
            vec![
                ("Host".to_owned(), "h".to_owned()),
                ("If-None-Match".to_owned(), "tag-1".to_owned()),
            ],
            Vec::new(),
        );

        let response = Response::text("hello").with_etag(&request, "tag-1");
        assert_eq!(response.status_code, 304);
        assert_eq!(response.data.len(), Some(0));

        let response = Response::text("hello").with_etag(&request, "tag-2");
        assert_eq!(response.status_code, 200);
    }
}
