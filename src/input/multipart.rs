// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Parsing data sent with `multipart/form-data`, including file uploads.
//!
//! [`get_multipart_input`] iterates over the parts one by one and lets you
//! stream each part's data. [`get_saved_multipart_input`] is the batteries
//! included version: it collects text fields into strings and writes file
//! uploads either to memory or to temporary files, depending on their
//! size.

use std::error;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use multipart::server::Multipart as InnerMultipart;
use tempfile::TempPath;

pub use mime::Mime;
pub use multipart::server::MultipartData;
pub use multipart::server::MultipartField;

use crate::body::RequestBody;
use crate::Request;

/// Error that can happen when decoding multipart data.
#[derive(Debug, Clone)]
pub enum MultipartError {
    /// The `Content-Type` header of the request indicates that it doesn't
    /// contain multipart data or is invalid.
    WrongContentType,

    /// Can't parse the body of the request because it was already
    /// extracted.
    BodyAlreadyExtracted,
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MultipartError::WrongContentType => {
                write!(f, "the request doesn't contain multipart data")
            }
            MultipartError::BodyAlreadyExtracted => {
                write!(f, "the body of the request was already extracted")
            }
        }
    }
}

impl error::Error for MultipartError {}

/// Attempts to decode the content of the request as `multipart/form-data`
/// data, iterating over the parts as they are read off the body.
pub fn get_multipart_input(request: &Request) -> Result<Multipart, MultipartError> {
    let boundary = match multipart_boundary(request) {
        Some(boundary) => boundary,
        None => return Err(MultipartError::WrongContentType),
    };

    let body = match request.data() {
        Some(body) => body,
        None => return Err(MultipartError::BodyAlreadyExtracted),
    };

    Ok(Multipart {
        inner: InnerMultipart::with_body(body, boundary),
    })
}

/// Allows you to inspect the content of the multipart input of a request.
pub struct Multipart {
    inner: InnerMultipart<RequestBody>,
}

impl Multipart {
    /// Reads the next part, if any. The returned field borrows the
    /// `Multipart`, so the parts have to be processed one at a time.
    pub fn next(&mut self) -> Option<MultipartField<&mut InnerMultipart<RequestBody>>> {
        self.inner.read_entry().unwrap_or(None)
    }
}

/// A form decoded by [`get_saved_multipart_input`].
pub struct FormData {
    /// Text fields, in the order they were sent.
    pub fields: Vec<(String, String)>,
    /// File uploads, in the order they were sent.
    pub uploads: Vec<Upload>,
}

impl FormData {
    /// Value of the first text field with this name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|&&(ref n, _)| n == name)
            .map(|&(_, ref v)| &v[..])
    }
}

/// One uploaded file.
pub struct Upload {
    /// Name of the form field the file was attached to.
    pub field_name: String,
    /// File name announced by the client, if any.
    pub filename: Option<String>,
    /// Content type announced by the client, if any.
    pub content_type: Option<String>,
    /// The file's content, in memory or spilled to disk.
    pub data: RequestBody,
    // Owning this path keeps the spilled file alive; dropping the upload
    // deletes it.
    temp: Option<TempPath>,
}

impl Upload {
    /// Where the upload is stored on disk, for uploads large enough to
    /// have spilled. In-memory uploads have no location.
    pub fn stored_path(&self) -> Option<&Path> {
        self.temp.as_deref()
    }
}

/// Decodes a whole `multipart/form-data` body in one call.
///
/// Text fields are collected as strings. File parts (the ones with a file
/// name or a content type) larger than `spill_threshold` bytes are written
/// to temporary files under `temp_dir`; smaller ones stay in memory. The
/// temporary files are deleted when the returned `FormData` is dropped.
pub fn get_saved_multipart_input(
    request: &Request,
    temp_dir: &Path,
    spill_threshold: u64,
) -> Result<io::Result<FormData>, MultipartError> {
    let mut multipart = get_multipart_input(request)?;
    Ok(save_all(&mut multipart, temp_dir, spill_threshold))
}

fn save_all(
    multipart: &mut Multipart,
    temp_dir: &Path,
    spill_threshold: u64,
) -> io::Result<FormData> {
    let mut form = FormData {
        fields: Vec::new(),
        uploads: Vec::new(),
    };

    while let Some(mut entry) = multipart.next() {
        let name = entry.headers.name.to_string();
        let filename = entry.headers.filename.clone();
        let content_type = entry.headers.content_type.as_ref().map(|m| m.to_string());

        if filename.is_none() && content_type.is_none() {
            let mut value = String::new();
            entry.data.read_to_string(&mut value)?;
            form.fields.push((name, value));
        } else {
            let (data, temp) = save_part(&mut entry.data, temp_dir, spill_threshold)?;
            form.uploads.push(Upload {
                field_name: name,
                filename,
                content_type,
                data,
                temp,
            });
        }
    }

    Ok(form)
}

// Reads one part, keeping it in memory until it crosses the threshold and
// moving it to a temporary file beyond that.
fn save_part<R: Read>(
    data: &mut R,
    temp_dir: &Path,
    spill_threshold: u64,
) -> io::Result<(RequestBody, Option<TempPath>)> {
    let mut memory: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = match data.read(&mut chunk) {
            Ok(0) => return Ok((RequestBody::from_data(memory), None)),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        memory.extend_from_slice(&chunk[..n]);

        if memory.len() as u64 > spill_threshold {
            break;
        }
    }

    // Too big for memory: move what we have to a file and stream the rest.
    let mut file = tempfile::Builder::new()
        .prefix("hearth-upload-")
        .tempfile_in(temp_dir)?;
    file.write_all(&memory)?;
    let mut written = memory.len() as u64;
    drop(memory);

    loop {
        let n = match data.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        file.write_all(&chunk[..n])?;
        written += n as u64;
    }

    file.flush()?;
    let reader: File = file.reopen()?;
    let path = file.into_temp_path();
    Ok((RequestBody::from_file(reader, written), Some(path)))
}

fn multipart_boundary(request: &Request) -> Option<String> {
    const BOUNDARY: &str = "boundary=";

    let content_type = request.header("Content-Type")?;
    if !content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return None;
    }

    let start = content_type.find(BOUNDARY)? + BOUNDARY.len();
    let end = content_type[start..]
        .find(';')
        .map_or(content_type.len(), |end| start + end);
    Some(content_type[start..end].trim_matches('"').to_owned())
}

#[cfg(test)]
mod tests {
    use super::{get_saved_multipart_input, multipart_boundary};
    use crate::Request;
    use std::io::Read;

    fn form_request(boundary: &str, body: Vec<u8>) -> Request {
        Request::fake_http(
            "POST",
            "/upload",
            vec![
                ("Host".to_owned(), "h".to_owned()),
                (
                    "Content-Type".to_owned(),
                    format!("multipart/form-data; boundary={}", boundary),
                ),
                ("Content-Length".to_owned(), body.len().to_string()),
            ],
            body,
        )
    }

    #[test]
    fn boundary_extraction() {
        let request = form_request("AaB03x", Vec::new());
        assert_eq!(multipart_boundary(&request).as_deref(), Some("AaB03x"));

        let request = Request::fake_http(
            "POST",
            "/",
            vec![
                ("Host".to_owned(), "h".to_owned()),
                ("Content-Type".to_owned(), "text/plain".to_owned()),
            ],
            Vec::new(),
        );
        assert_eq!(multipart_boundary(&request), None);
    }

    #[test]
    fn fields_and_files_are_separated() {
        let body = b"--AaB03x\r\n\
            Content-Disposition: form-data; name=\"caption\"\r\n\
            \r\n\
            holiday photo\r\n\
            --AaB03x\r\n\
            Content-Disposition: form-data; name=\"photo\"; filename=\"p.bin\"\r\n\
            Content-Type: application/octet-stream\r\n\
            \r\n\
            binarydata\r\n\
            --AaB03x--\r\n"
            .to_vec();

        let request = form_request("AaB03x", body);
        let form = get_saved_multipart_input(&request, &std::env::temp_dir(), 1024 * 1024)
            .unwrap()
            .unwrap();

        assert_eq!(form.field("caption"), Some("holiday photo"));
        assert_eq!(form.uploads.len(), 1);
        let upload = &form.uploads[0];
        assert_eq!(upload.field_name, "photo");
        assert_eq!(upload.filename.as_deref(), Some("p.bin"));
        assert!(upload.stored_path().is_none());
    }

    #[test]
    fn large_uploads_spill_to_disk() {
        let payload = vec![b'z'; 8192];
        let mut body = Vec::new();
        body.extend_from_slice(
            b"--XYZ\r\n\
            Content-Disposition: form-data; name=\"blob\"; filename=\"big.bin\"\r\n\
            Content-Type: application/octet-stream\r\n\
            \r\n",
        );
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--XYZ--\r\n");

        let request = form_request("XYZ", body);
        let mut form = get_saved_multipart_input(&request, &std::env::temp_dir(), 1024)
            .unwrap()
            .unwrap();

        assert_eq!(form.uploads.len(), 1);
        let upload = &mut form.uploads[0];
        let path = upload.stored_path().expect("should have spilled").to_path_buf();
        assert!(path.exists());

        let mut stored = Vec::new();
        upload.data.read_to_end(&mut stored).unwrap();
        assert_eq!(stored, payload);

        drop(form);
        assert!(!path.exists());
    }
}
