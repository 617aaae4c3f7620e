// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::borrow::Cow;
use std::env;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tls")]
use crate::socket_handler::tls::TlsConfig;

/// A socket the server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Local address to bind.
    pub address: IpAddr,
    /// Local port to bind.
    pub port: u16,
    /// If true, connections on this endpoint go through TLS.
    pub secure: bool,
}

impl Endpoint {
    /// Builds a plaintext endpoint.
    #[inline]
    pub fn http<A>(address: A, port: u16) -> Endpoint
    where
        A: Into<IpAddr>,
    {
        Endpoint {
            address: address.into(),
            port,
            secure: false,
        }
    }

    /// Builds a TLS endpoint.
    #[inline]
    pub fn https<A>(address: A, port: u16) -> Endpoint
    where
        A: Into<IpAddr>,
    {
        Endpoint {
            address: address.into(),
            port,
            secure: true,
        }
    }

    #[inline]
    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Called when writing a response body fails after the headers have already
/// been sent, so that the embedder can report the failure somewhere.
pub type ErrorHook = Arc<dyn Fn(&io::Error) + Send + Sync>;

/// Tuning knobs of the server.
///
/// All the fields are public so that the configuration can be built with the
/// struct-update syntax:
///
/// ```
/// use hearth::{Config, Endpoint};
///
/// let config = Config {
///     endpoints: vec![Endpoint::http([127, 0, 0, 1], 8000)],
///     max_body_bytes: 4 * 1024 * 1024,
///     ..Config::default()
/// };
/// ```
#[derive(Clone)]
pub struct Config {
    /// Sockets to listen on. Two endpoints must not share an address and
    /// port; this is checked when the server starts.
    pub endpoints: Vec<Endpoint>,

    /// Connections whose request headers grow beyond this size are closed
    /// without a response.
    pub max_header_bytes: usize,

    /// Requests declaring a body larger than this are rejected with a 413.
    pub max_body_bytes: u64,

    /// Request bodies larger than this are written to a temporary file
    /// instead of being held in memory.
    pub spill_to_file_threshold: u64,

    /// Sample size for the gzip autodetection. A body of at least this size
    /// has this many bytes from its middle test-compressed; if they shrink
    /// by less than 1%, the body is sent uncompressed.
    pub gzip_auto_threshold: u64,

    /// Bodies of known length below this are gzipped fully in memory before
    /// the headers go out, so the `Content-Length` is exact.
    pub gzip_inmemory_max: u64,

    /// How long a keep-alive connection may sit idle between requests.
    pub idle_timeout: Duration,

    /// `Content-Type` used when the handler didn't set one on a non-empty
    /// response.
    pub default_content_type: Cow<'static, str>,

    /// Where spilled request bodies and uploaded files are stored.
    pub temp_dir: PathBuf,

    /// Certificate store for the secure endpoints.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsConfig>,

    /// If true, a panicking handler closes the connection instead of being
    /// rendered as a 500 response. Useful under a debugger.
    pub propagate_exceptions: bool,

    /// If true, the default 500 page includes the text of the panic.
    /// Leave off in production.
    pub output_exception_info: bool,

    /// Notified when writing a response fails after its headers were sent.
    pub error_hook: Option<ErrorHook>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            endpoints: Vec::new(),
            max_header_bytes: 16 * 1024,
            max_body_bytes: 64 * 1024 * 1024,
            spill_to_file_threshold: 1024 * 1024,
            gzip_auto_threshold: 64 * 1024,
            gzip_inmemory_max: 1024 * 1024,
            idle_timeout: Duration::from_secs(10),
            default_content_type: "text/html; charset=utf-8".into(),
            temp_dir: env::temp_dir(),
            #[cfg(feature = "tls")]
            tls: None,
            propagate_exceptions: false,
            output_exception_info: false,
            error_hook: None,
        }
    }
}

impl Config {
    /// Configuration with a single plaintext endpoint and default limits.
    pub fn with_endpoint<A>(address: A, port: u16) -> Config
    where
        A: Into<IpAddr>,
    {
        Config {
            endpoints: vec![Endpoint::http(address, port)],
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Endpoint};

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.max_header_bytes >= 1024);
        assert!(config.spill_to_file_threshold <= config.max_body_bytes);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn endpoint_shortcuts() {
        let e = Endpoint::http([127, 0, 0, 1], 8080);
        assert!(!e.secure);
        let e = Endpoint::https([0, 0, 0, 0], 8443);
        assert!(e.secure);
        assert_eq!(e.port, 8443);
    }
}
