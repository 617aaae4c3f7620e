// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Parsing data sent with `application/x-www-form-urlencoded` bodies.

use std::error;
use std::fmt;
use std::io::Error as IoError;
use std::io::Read;

use url::form_urlencoded;

use crate::Request;

/// Error that can happen when decoding POST data.
#[derive(Debug)]
pub enum PostError {
    /// The `Content-Type` header of the request indicates that it doesn't
    /// contain POST data.
    WrongContentType,

    /// Can't parse the body of the request because it was already
    /// extracted.
    BodyAlreadyExtracted,

    /// Could not read the body from the request.
    IoError(IoError),
}

impl From<IoError> for PostError {
    #[inline]
    fn from(err: IoError) -> PostError {
        PostError::IoError(err)
    }
}

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PostError::WrongContentType => write!(f, "the request doesn't contain POST data"),
            PostError::BodyAlreadyExtracted => {
                write!(f, "the body of the request was already extracted")
            }
            PostError::IoError(ref err) => write!(f, "could not read the body: {}", err),
        }
    }
}

impl error::Error for PostError {}

/// Attempts to decode the `POST` data received by the request.
///
/// If successful, returns the list of fields and values, percent-decoded,
/// in the order they were sent.
///
/// Returns an error if the request's content type is not form data, or if
/// the body was already extracted.
///
/// # Example
///
/// ```no_run
/// use hearth::{Request, Response};
/// use hearth::input::get_raw_post_input;
///
/// fn handle(request: &Request) -> Response {
///     let fields = match get_raw_post_input(request) {
///         Ok(fields) => fields,
///         Err(_) => return Response::empty_400(),
///     };
///
///     Response::text(format!("you sent {} fields", fields.len()))
/// }
/// ```
pub fn get_raw_post_input(request: &Request) -> Result<Vec<(String, String)>, PostError> {
    let is_form = request
        .header("Content-Type")
        .map(|ct| {
            ct.trim()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
        .unwrap_or(false);
    if !is_form {
        return Err(PostError::WrongContentType);
    }

    let mut body = match request.data() {
        Some(body) => body,
        None => return Err(PostError::BodyAlreadyExtracted),
    };

    let mut raw = Vec::new();
    body.read_to_end(&mut raw)?;

    Ok(form_urlencoded::parse(&raw).into_owned().collect())
}
