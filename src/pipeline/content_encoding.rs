// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The gzip half of the output-mode decision.
//!
//! Compression is supported only if you enable the `gzip` feature of the
//! crate (which is enabled by default); without it every response goes out
//! uncompressed.

use crate::response::GzipPolicy;

/// Bodies of known length at or below this many bytes are never compressed.
pub(crate) const MIN_GZIP_BODY: u64 = 1024;

/// Whether the response qualifies for gzip at all. The `Autodetect`
/// sampling happens separately, because it needs to touch the body.
#[cfg(feature = "gzip")]
pub(crate) fn gzip_enabled(
    accepts_gzip: bool,
    version_is_one_one: bool,
    policy: GzipPolicy,
    body_len: Option<u64>,
) -> bool {
    accepts_gzip
        && version_is_one_one
        && policy != GzipPolicy::Never
        && body_len.map_or(true, |l| l > MIN_GZIP_BODY)
}

#[cfg(not(feature = "gzip"))]
#[inline]
pub(crate) fn gzip_enabled(
    _accepts_gzip: bool,
    _version_is_one_one: bool,
    _policy: GzipPolicy,
    _body_len: Option<u64>,
) -> bool {
    false
}

/// Compresses a whole body in one go. Used when the result fits in memory,
/// so that the exact `Content-Length` can be announced.
#[cfg(feature = "gzip")]
pub(crate) fn compress_in_memory(data: &[u8]) -> Vec<u8> {
    deflate::deflate_bytes_gzip(data)
}

/// Samples the middle of a seekable body and test-compresses it at the
/// fastest level. Returns false when the sample shrinks by less than 1%,
/// meaning the content is already dense and gzip would waste cycles.
/// The body is rewound to the start afterwards.
#[cfg(feature = "gzip")]
pub(crate) fn sample_compresses_well(
    body: &mut crate::response::ResponseBody,
    total_len: u64,
    sample_size: u64,
) -> std::io::Result<bool> {
    use deflate::deflate_bytes_gzip_conf;
    use deflate::Compression;
    use std::io::Read;

    let sample_len = sample_size.min(total_len);
    let start = (total_len - sample_len) / 2;

    body.seek_to(start)?;
    let mut sample = Vec::with_capacity(sample_len as usize);
    body.by_ref().take(sample_len).read_to_end(&mut sample)?;
    body.seek_to(0)?;

    let compressed = deflate_bytes_gzip_conf(&sample, Compression::Fast, gzip_header::GzBuilder::new());
    let worthwhile = (compressed.len() as u64) * 100 < (sample.len() as u64) * 99;
    Ok(worthwhile)
}
