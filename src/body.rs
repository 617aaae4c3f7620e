// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::fs::File;
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use tempfile::{NamedTempFile, TempPath};

/// The body of a request, either held in memory or spilled to a temporary
/// file depending on its size.
///
/// Obtained from [`Request::data()`](crate::Request::data). Reading yields
/// exactly the bytes the client declared with `Content-Length`.
pub struct RequestBody {
    inner: RequestBodyInner,
    len: u64,
}

enum RequestBodyInner {
    Buffer(Cursor<Vec<u8>>),
    File(File),
}

impl RequestBody {
    pub(crate) fn from_data<D>(data: D) -> RequestBody
    where
        D: Into<Vec<u8>>,
    {
        let data = data.into();
        let len = data.len() as u64;
        RequestBody {
            inner: RequestBodyInner::Buffer(Cursor::new(data)),
            len,
        }
    }

    pub(crate) fn from_file(file: File, len: u64) -> RequestBody {
        RequestBody {
            inner: RequestBodyInner::File(file),
            len,
        }
    }

    /// Number of bytes of the body.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner {
            RequestBodyInner::Buffer(ref mut cursor) => cursor.read(buf),
            RequestBodyInner::File(ref mut file) => file.read(buf),
        }
    }
}

/// Accumulates the bytes of an incoming body as they arrive.
///
/// Bodies up to the spill threshold stay in a pre-sized vector; larger ones
/// go to a random-named file in the configured temporary directory. The
/// file is deleted when the [`TempPath`] returned by `finish` is dropped.
pub(crate) enum BodySink {
    Memory(Vec<u8>),
    Spill { file: NamedTempFile, written: u64 },
}

impl BodySink {
    /// `total` is the declared `Content-Length` of the body.
    pub fn new(total: u64, spill_threshold: u64, temp_dir: &Path) -> io::Result<BodySink> {
        if total > spill_threshold {
            let file = tempfile::Builder::new()
                .prefix("hearth-body-")
                .tempfile_in(temp_dir)?;
            Ok(BodySink::Spill { file, written: 0 })
        } else {
            Ok(BodySink::Memory(Vec::with_capacity(total as usize)))
        }
    }

    pub fn push(&mut self, data: &[u8]) -> io::Result<()> {
        match *self {
            BodySink::Memory(ref mut buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            BodySink::Spill {
                ref mut file,
                ref mut written,
            } => {
                file.write_all(data)?;
                *written += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Turns the accumulated bytes into a readable body. For spilled bodies
    /// the second element owns the file's path; dropping it deletes the
    /// file.
    pub fn finish(self) -> io::Result<(RequestBody, Option<TempPath>)> {
        match self {
            BodySink::Memory(buf) => Ok((RequestBody::from_data(buf), None)),
            BodySink::Spill { mut file, written } => {
                file.flush()?;
                let reader = file.reopen()?;
                let path = file.into_temp_path();
                Ok((RequestBody::from_file(reader, written), Some(path)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BodySink;
    use std::io::Read;

    #[test]
    fn small_body_stays_in_memory() {
        let mut sink = BodySink::new(11, 1024, &std::env::temp_dir()).unwrap();
        sink.push(b"hello ").unwrap();
        sink.push(b"world").unwrap();

        let (mut body, path) = sink.finish().unwrap();
        assert!(path.is_none());
        assert_eq!(body.len(), 11);

        let mut out = String::new();
        body.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn body_exactly_at_the_threshold_stays_in_memory() {
        let payload = vec![b'a'; 1024];
        let mut sink = BodySink::new(1024, 1024, &std::env::temp_dir()).unwrap();
        sink.push(&payload).unwrap();

        let (_, path) = sink.finish().unwrap();
        assert!(path.is_none());

        // One byte more spills.
        let mut sink = BodySink::new(1025, 1024, &std::env::temp_dir()).unwrap();
        sink.push(&payload).unwrap();
        sink.push(b"b").unwrap();

        let (_, path) = sink.finish().unwrap();
        assert!(path.is_some());
    }

    #[test]
    fn large_body_spills_to_disk() {
        let payload = vec![0x61u8; 4096];
        let mut sink = BodySink::new(payload.len() as u64, 1024, &std::env::temp_dir()).unwrap();
        for chunk in payload.chunks(100) {
            sink.push(chunk).unwrap();
        }

        let (mut body, path) = sink.finish().unwrap();
        let path = path.expect("body should have spilled");
        assert!(path.exists());
        assert_eq!(body.len(), 4096);

        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);

        let kept = path.to_path_buf();
        drop(path);
        assert!(!kept.exists());
    }
}
