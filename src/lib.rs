// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Hearth is a small library to embed an HTTP/1.1 server into your
//! program.
//!
//! There is no router, no middleware tower, no async runtime to buy into:
//! you give the server one function from [`Request`] to [`Response`] and
//! it takes care of the protocol around it — keep-alive, chunked transfer
//! encoding, gzip, byte ranges, `100-continue`, TLS with per-domain
//! certificates, and handing sockets over to a WebSocket implementation.
//!
//! # Getting started
//!
//! ```no_run
//! use hearth::{Config, Response, Server};
//!
//! let server = Server::new(Config::with_endpoint([127, 0, 0, 1], 8000), |request| {
//!     Response::text(format!("you asked for {}", request.url()))
//! }).unwrap();
//!
//! println!("listening on {}", server.local_addrs()[0]);
//! server.run().unwrap();
//! ```
//!
//! The handler is called from a pool of worker threads, one call per
//! request, and must therefore be `Send + Sync`. Connections themselves
//! are multiplexed on a single event loop; a slow or idle client never
//! occupies a worker.
//!
//! # Requests and responses
//!
//! A [`Request`] gives access to the method, URL, typed headers and the
//! body ([`Request::data`]). Bodies larger than the configured threshold
//! are transparently spooled to temporary files that are deleted when the
//! request is done. The [`input`] module decodes HTML form bodies,
//! including `multipart/form-data` file uploads.
//!
//! A [`Response`] is a status code, a list of headers and a body. How the
//! body is framed on the wire — `Content-Length`, chunked, gzipped,
//! sliced into byte ranges for a `Range` request — is decided by the
//! server, not by the handler; headers like `Transfer-Encoding` set on
//! the response are ignored.
//!
//! # Panics in handlers
//!
//! A panicking handler produces a `500 Internal Server Error` (or the
//! status carried by an [`HttpError`] payload), optionally through an
//! error handler installed with [`Server::with_error_handler`]. Set
//! [`Config::propagate_exceptions`](Config) to close the connection
//! instead, and
//! [`Config::output_exception_info`](Config) to include panic messages in
//! the error pages.
//!
//! # WebSockets
//!
//! The [`websocket`] module validates upgrade handshakes and builds the
//! `101 Switching Protocols` response. The frame protocol itself is out
//! of scope: implement [`Upgrade`] and the connection's raw byte stream
//! is yours once the handshake is on the wire.

use std::io::Read;
use std::io::Write;

pub use crate::body::RequestBody;
pub use crate::config::{Config, Endpoint, ErrorHook};
pub use crate::errors::{HandlerCrash, HttpError, ServerError};
pub use crate::request::{EncodingPref, Headers, HttpVersion, Method, RangeSpec, Request};
pub use crate::response::{GzipPolicy, Response, ResponseBody};
pub use crate::server::{Server, ServerStats, ShutdownHandle};
#[cfg(feature = "tls")]
pub use crate::socket_handler::tls::TlsConfig;

pub mod input;
pub mod websocket;

mod body;
mod config;
mod errors;
mod parser;
mod pipeline;
mod request;
mod response;
mod server;
mod socket_handler;

/// Combination of the `Read` and `Write` traits, for objects that
/// represent both directions of a socket.
pub trait ReadWrite: Read + Write {}
impl<T> ReadWrite for T where T: Read + Write {}

/// Receives the raw byte stream of a connection whose response switched
/// protocols.
///
/// The stream is handed over right after the `101 Switching Protocols`
/// block has been flushed, in blocking mode, with any bytes the client
/// sent early already queued in front. The call happens on the server's
/// event loop thread, so implementations should move the stream to a
/// thread of their own rather than block.
pub trait Upgrade {
    /// Takes ownership of the connection. The server will never touch the
    /// socket again.
    fn take_stream(&mut self, stream: Box<dyn ReadWrite + Send>);
}

/// Builds a server with the given configuration and runs it until
/// shutdown.
///
/// This is a shortcut for [`Server::new`] followed by [`Server::run`].
pub fn start_server<F>(config: Config, handler: F) -> Result<(), ServerError>
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    let server = Server::new(config, handler)?;
    server.run().map_err(ServerError::Io)
}
