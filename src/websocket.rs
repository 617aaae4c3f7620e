// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The WebSocket upgrade handshake.
//!
//! This module covers the HTTP side of RFC 6455 only: validating the
//! upgrade request and building the `101 Switching Protocols` response.
//! Speaking the frame protocol afterwards is the job of the [`Upgrade`]
//! object you provide, which receives the raw socket once the handshake
//! response has been flushed:
//!
//! ```no_run
//! use hearth::{Request, Response, ReadWrite, Upgrade};
//! use hearth::websocket;
//!
//! struct EchoFrames;
//!
//! impl Upgrade for EchoFrames {
//!     fn take_stream(&mut self, stream: Box<dyn ReadWrite + Send>) {
//!         // Drive the frame protocol on `stream`, typically from a new
//!         // thread.
//!     }
//! }
//!
//! fn handle(request: &Request) -> Response {
//!     match websocket::switch_protocols(request, Some("echo"), Box::new(EchoFrames)) {
//!         Ok(response) => response,
//!         Err(_) => Response::empty_400(),
//!     }
//! }
//! ```

use std::vec::IntoIter as VecIntoIter;

use sha1::Sha1;

use crate::request::Method;
use crate::response::{GzipPolicy, Response, ResponseBody};
use crate::Request;
use crate::Upgrade;

// Fixed by RFC 6455; appended to the client's key before hashing.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Error that can happen when attempting to start a websocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebsocketError {
    /// The request does not match a websocket upgrade request.
    ///
    /// The conditions are:
    /// - The method must be `GET`.
    /// - The HTTP version must be at least 1.1.
    /// - The `Connection` header must include `upgrade`.
    /// - The `Upgrade` header must include `websocket`.
    /// - The `Sec-WebSocket-Version` header must be `13`.
    /// - Must have a `Sec-WebSocket-Key` header.
    InvalidWebsocketRequest,

    /// The subprotocol passed to the function was not requested by the
    /// client.
    WrongSubprotocol,
}

/// Builds the `Response` that switches the connection to the websocket
/// protocol.
///
/// After the response has been written out, the connection stops speaking
/// HTTP and `handler` receives the raw byte stream.
pub fn switch_protocols(
    request: &Request,
    subprotocol: Option<&str>,
    handler: Box<dyn Upgrade + Send>,
) -> Result<Response, WebsocketError> {
    if request.method() != Method::Get {
        return Err(WebsocketError::InvalidWebsocketRequest);
    }

    if !request.http_version().is_one_one() {
        return Err(WebsocketError::InvalidWebsocketRequest);
    }

    if !request.headers().connection.upgrade {
        return Err(WebsocketError::InvalidWebsocketRequest);
    }

    if !request.headers().upgrade_websocket {
        return Err(WebsocketError::InvalidWebsocketRequest);
    }

    match request.header("Sec-WebSocket-Version") {
        Some(h) if h.trim() == "13" => (),
        _ => return Err(WebsocketError::InvalidWebsocketRequest),
    }

    if request.headers().sec_websocket_key().is_none() {
        return Err(WebsocketError::InvalidWebsocketRequest);
    }

    if let Some(sp) = subprotocol {
        if !requested_protocols(request).any(|p| p == sp) {
            return Err(WebsocketError::WrongSubprotocol);
        }
    }

    let mut headers = Vec::with_capacity(1);
    if let Some(sp) = subprotocol {
        headers.push(("Sec-WebSocket-Protocol".into(), sp.to_owned().into()));
    }

    Ok(Response {
        status_code: 101,
        headers,
        data: ResponseBody::empty(),
        gzip: GzipPolicy::Never,
        upgrade: Some(handler),
        cleanup: None,
    })
}

/// Returns the list of websocket subprotocols requested by the client.
pub fn requested_protocols(request: &Request) -> RequestedProtocolsIter {
    match request.header("Sec-WebSocket-Protocol") {
        None => RequestedProtocolsIter {
            iter: Vec::new().into_iter(),
        },
        Some(h) => {
            let iter = h
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_owned())
                .collect::<Vec<_>>()
                .into_iter();
            RequestedProtocolsIter { iter }
        }
    }
}

/// Iterator to the list of subprotocols requested by the client.
pub struct RequestedProtocolsIter {
    iter: VecIntoIter<String>,
}

impl Iterator for RequestedProtocolsIter {
    type Item = String;

    #[inline]
    fn next(&mut self) -> Option<String> {
        self.iter.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

impl ExactSizeIterator for RequestedProtocolsIter {}

/// Turns a `Sec-WebSocket-Key` value into the matching
/// `Sec-WebSocket-Accept` value.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(ACCEPT_GUID.as_bytes());
    base64::encode(sha1.digest().bytes())
}
