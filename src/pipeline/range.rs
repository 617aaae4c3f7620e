// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use rand::Rng;

use crate::request::RangeSpec;

/// Resolves the ranges of a request against the length of the resource.
///
/// Suffix and open-ended forms are made concrete, ends are clamped to the
/// resource, empty or inverted elements are dropped, and the survivors are
/// sorted and merged when they overlap or touch. The result is a list of
/// inclusive `(first, last)` pairs.
pub(crate) fn canonicalize(specs: &[RangeSpec], len: u64) -> Vec<(u64, u64)> {
    if len == 0 {
        return Vec::new();
    }

    let mut resolved: Vec<(u64, u64)> = Vec::with_capacity(specs.len());
    for spec in specs {
        let (first, last) = match (spec.first, spec.last) {
            (Some(first), Some(last)) => (first, last),
            (Some(first), None) => (first, len - 1),
            // Suffix form: the final `n` bytes.
            (None, Some(suffix)) => {
                if suffix == 0 {
                    continue;
                }
                (len.saturating_sub(suffix), len - 1)
            }
            (None, None) => continue,
        };

        if first >= len || first > last {
            continue;
        }
        let last = last.min(len - 1);
        resolved.push((first, last));
    }

    resolved.sort();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(resolved.len());
    for (first, last) in resolved {
        match merged.last_mut() {
            Some(&mut (_, ref mut prev_last)) if first <= prev_last.saturating_add(1) => {
                *prev_last = (*prev_last).max(last);
            }
            _ => merged.push((first, last)),
        }
    }

    merged
}

/// True when the set covers the resource from the first byte to the last.
pub(crate) fn spans_whole(set: &[(u64, u64)], len: u64) -> bool {
    set.len() == 1 && set[0] == (0, len - 1)
}

/// Boundary token for `multipart/byteranges` bodies: 64 random characters
/// from the hexadecimal alphabet.
pub(crate) fn random_boundary() -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..64)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Precomputed layout of a `multipart/byteranges` body, so the overall
/// `Content-Length` is exact before anything is sent.
pub(crate) struct MultipartRanges {
    pub boundary: String,
    /// For each range: the textual part header and the byte range itself.
    pub parts: Vec<(String, u64, u64)>,
    pub closing: String,
    pub total_len: u64,
}

impl MultipartRanges {
    pub fn new(set: &[(u64, u64)], full_len: u64, content_type: Option<&str>) -> MultipartRanges {
        let boundary = random_boundary();

        let mut total_len = 0u64;
        let mut parts = Vec::with_capacity(set.len());
        for &(first, last) in set {
            let mut header = format!("--{}\r\n", boundary);
            if let Some(ct) = content_type {
                header.push_str("Content-Type: ");
                header.push_str(ct);
                header.push_str("\r\n");
            }
            header.push_str(&format!(
                "Content-Range: bytes {}-{}/{}\r\n\r\n",
                first, last, full_len
            ));

            // Part payload is followed by a CRLF before the next delimiter.
            total_len += header.len() as u64 + (last - first + 1) + 2;
            parts.push((header, first, last));
        }

        let closing = format!("--{}--\r\n", boundary);
        total_len += closing.len() as u64;

        MultipartRanges {
            boundary,
            parts,
            closing,
            total_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{canonicalize, random_boundary, spans_whole, MultipartRanges};
    use crate::request::RangeSpec;

    fn spec(first: Option<u64>, last: Option<u64>) -> RangeSpec {
        RangeSpec { first, last }
    }

    #[test]
    fn simple_range() {
        let set = canonicalize(&[spec(Some(0), Some(15))], 100);
        assert_eq!(set, vec![(0, 15)]);
    }

    #[test]
    fn open_and_suffix_forms() {
        let set = canonicalize(&[spec(Some(90), None)], 100);
        assert_eq!(set, vec![(90, 99)]);

        let set = canonicalize(&[spec(None, Some(10))], 100);
        assert_eq!(set, vec![(90, 99)]);

        // A suffix longer than the resource covers all of it.
        let set = canonicalize(&[spec(None, Some(500))], 100);
        assert_eq!(set, vec![(0, 99)]);
    }

    #[test]
    fn clamping_and_dropping() {
        // End clamped to the resource.
        assert_eq!(canonicalize(&[spec(Some(50), Some(500))], 100), vec![(50, 99)]);
        // Entirely past the end: dropped.
        assert!(canonicalize(&[spec(Some(100), Some(120))], 100).is_empty());
        // Inverted: dropped.
        assert!(canonicalize(&[spec(Some(20), Some(10))], 100).is_empty());
    }

    #[test]
    fn overlapping_ranges_are_merged() {
        let set = canonicalize(
            &[
                spec(Some(40), Some(60)),
                spec(Some(0), Some(10)),
                spec(Some(5), Some(25)),
            ],
            100,
        );
        assert_eq!(set, vec![(0, 25), (40, 60)]);

        // Adjacent ranges coalesce too.
        let set = canonicalize(&[spec(Some(0), Some(9)), spec(Some(10), Some(19))], 100);
        assert_eq!(set, vec![(0, 19)]);
    }

    #[test]
    fn whole_resource_detection() {
        let set = canonicalize(&[spec(Some(0), None)], 100);
        assert!(spans_whole(&set, 100));

        let set = canonicalize(&[spec(Some(0), Some(98))], 100);
        assert!(!spans_whole(&set, 100));
    }

    #[test]
    fn boundary_shape() {
        let b = random_boundary();
        assert_eq!(b.len(), 64);
        assert!(b.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(b, random_boundary());
    }

    #[test]
    fn multipart_length_is_exact() {
        let set = vec![(0, 15), (100, 115)];
        let layout = MultipartRanges::new(&set, 102400, Some("text/plain"));

        // Rebuild the body and compare its real size with the announced one.
        let mut body = Vec::new();
        for &(ref header, first, last) in &layout.parts {
            body.extend_from_slice(header.as_bytes());
            body.extend(std::iter::repeat(b'x').take((last - first + 1) as usize));
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(layout.closing.as_bytes());

        assert_eq!(body.len() as u64, layout.total_len);
        // Each part advertises its own range.
        assert!(layout.parts[0].0.contains("Content-Range: bytes 0-15/102400"));
        assert!(layout.parts[1].0.contains("Content-Range: bytes 100-115/102400"));
    }
}
