// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic;

use quick_error::quick_error;

quick_error! {
    /// Error that can happen when starting the server.
    #[derive(Debug)]
    pub enum ServerError {
        /// Binding one of the configured endpoints failed.
        Bind(addr: SocketAddr, err: io::Error) {
            display("failed to bind {}: {}", addr, err)
        }
        /// Two endpoints share the same address and port.
        DuplicateEndpoint(addr: SocketAddr) {
            display("endpoint {} is configured twice", addr)
        }
        /// The configuration doesn't contain any endpoint.
        NoEndpoints {
            display("no endpoint to listen on")
        }
        /// An endpoint is marked as secure but no TLS configuration was provided.
        MissingTlsConfig(addr: SocketAddr) {
            display("endpoint {} is secure but no TLS configuration is set", addr)
        }
        /// Any other I/O error during startup.
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
        }
    }
}

/// An error value that request handlers can panic with in order to turn the
/// failure into a response with a chosen status code.
///
/// # Example
///
/// ```no_run
/// use hearth::HttpError;
///
/// # let authorized = false;
/// if !authorized {
///     HttpError::new(403).raise();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HttpError {
    /// The status code of the generated response.
    pub status_code: u16,
    /// Short description included in the generated body.
    pub message: String,
}

impl HttpError {
    /// Builds an `HttpError` with the default reason phrase as its message.
    #[inline]
    pub fn new(status_code: u16) -> HttpError {
        HttpError {
            status_code,
            message: String::new(),
        }
    }

    /// Builds an `HttpError` with a custom message.
    #[inline]
    pub fn with_message<S>(status_code: u16, message: S) -> HttpError
    where
        S: Into<String>,
    {
        HttpError {
            status_code,
            message: message.into(),
        }
    }

    /// Starts unwinding with `self` as the payload. The connection handler
    /// catches the unwind and produces a response with `self.status_code`.
    #[inline]
    pub fn raise(self) -> ! {
        panic::panic_any(self)
    }
}

/// Information about a handler that panicked, passed to the error handler.
pub struct HandlerCrash {
    message: String,
    http: Option<HttpError>,
}

impl HandlerCrash {
    /// Extracts whatever printable information the panic payload carries.
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> HandlerCrash {
        let payload = match payload.downcast::<HttpError>() {
            Ok(http) => {
                return HandlerCrash {
                    message: http.message.clone(),
                    http: Some(*http),
                };
            }
            Err(other) => other,
        };

        let message = if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else {
            "Box<dyn Any>".to_owned()
        };

        HandlerCrash {
            message,
            http: None,
        }
    }

    /// The textual content of the panic, if any.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The status code carried by the payload when the handler raised an
    /// [`HttpError`](crate::HttpError).
    #[inline]
    pub fn status_code(&self) -> Option<u16> {
        self.http.as_ref().map(|h| h.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::{HandlerCrash, HttpError};
    use std::panic;

    #[test]
    fn crash_from_http_error() {
        let err = panic::catch_unwind(|| {
            HttpError::with_message(404, "no such user").raise();
        })
        .unwrap_err();

        let crash = HandlerCrash::from_payload(err);
        assert_eq!(crash.status_code(), Some(404));
        assert_eq!(crash.message(), "no such user");
    }

    #[test]
    fn crash_from_str() {
        let err = panic::catch_unwind(|| panic!("database on fire")).unwrap_err();
        let crash = HandlerCrash::from_payload(err);
        assert_eq!(crash.status_code(), None);
        assert!(crash.message().contains("database on fire"));
    }
}
