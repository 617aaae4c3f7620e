// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-connection protocol machinery.
//!
//! A handler is driven entirely through [`SocketHandler::update`]: the
//! event loop fills `pending_read_buffer` with bytes from the socket,
//! calls `update`, then sends whatever ended up in `pending_write_buffer`
//! back to the client. Handlers never touch the socket themselves, which
//! is what lets the TLS wrapper slot in between transparently.

use std::io;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use mio::Registration;
use mio::SetReadiness;

use crate::ReadWrite;

pub(crate) mod http1;
pub(crate) mod task_pool;
#[cfg(feature = "tls")]
pub(crate) mod tls;

/// Consumes the raw byte stream of a connection that stopped speaking
/// HTTP. Built by the HTTP handler when a response switches protocols.
pub(crate) type Handoff = Box<dyn FnOnce(Box<dyn ReadWrite + Send>) + Send>;

/// Parses the data received on a socket and produces the data to send
/// back.
pub(crate) trait SocketHandler {
    /// Call this whenever new data arrived on the socket, the socket hit
    /// end-of-stream (`update.eof`), or the registration returned by a
    /// previous call woke up.
    fn update(&mut self, update: &mut Update) -> UpdateResult;

    /// True while the connection is parked between two keep-alive
    /// requests. Idle connections are the ones a graceful shutdown and the
    /// idle timeout may close.
    fn is_idle(&self) -> bool;
}

/// Communication between a [`SocketHandler`] and the event loop that owns
/// the socket.
pub(crate) struct Update {
    /// Bytes received from the client and not yet consumed by the handler.
    pub pending_read_buffer: Vec<u8>,

    /// Set by the event loop when the client will never send more data.
    pub eof: bool,

    /// Filled by the handler. Bytes that must be sent back to the client.
    pub pending_write_buffer: Vec<u8>,
}

impl Update {
    pub fn empty() -> Update {
        Update {
            pending_read_buffer: Vec::with_capacity(1024),
            eof: false,
            pending_write_buffer: Vec::with_capacity(1024),
        }
    }
}

/// What the event loop must do after an `update` call.
pub(crate) struct UpdateResult {
    /// When set, the handler is waiting for background work; call `update`
    /// again when the registration becomes ready. The loop must clear the
    /// readiness (through the paired [`SetReadiness`]) before draining, so
    /// that a completion arriving mid-drain still wakes it up.
    pub registration: Option<(Arc<Registration>, SetReadiness)>,

    /// The handler will not process any further incoming data. Once
    /// `pending_write_buffer` is flushed the socket can be dropped.
    pub close_read: bool,

    /// A response just completed; a flush to the wire is worth it (the
    /// loop toggles `TCP_NODELAY` around it).
    pub write_flush_suggested: bool,

    /// The connection stops speaking HTTP: flush the write buffer, then
    /// give the raw stream (with any unconsumed read bytes prepended) to
    /// this callback and forget the socket.
    pub upgrade: Option<Handoff>,
}

impl UpdateResult {
    pub fn idle() -> UpdateResult {
        UpdateResult {
            registration: None,
            close_read: false,
            write_flush_suggested: false,
            upgrade: None,
        }
    }
}

/// Protocol of the endpoint a connection was accepted on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Protocol {
    Http,
    Https,
}

/// A stream with some already-buffered bytes in front of it. Used during
/// protocol handoffs so that bytes the HTTP layer had already read are not
/// lost.
pub(crate) struct PrependedStream<S> {
    head: Cursor<Vec<u8>>,
    stream: S,
}

impl<S> PrependedStream<S> {
    pub fn new(head: Vec<u8>, stream: S) -> PrependedStream<S> {
        PrependedStream {
            head: Cursor::new(head),
            stream,
        }
    }
}

impl<S: Read> Read for PrependedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let from_head = self.head.read(buf)?;
        if from_head > 0 {
            return Ok(from_head);
        }
        self.stream.read(buf)
    }
}

impl<S: Write> Write for PrependedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::PrependedStream;
    use std::io::{Cursor, Read, Write};

    #[test]
    fn prepended_bytes_come_first() {
        let mut stream =
            PrependedStream::new(b"head-".to_vec(), Cursor::new(b"tail".to_vec()));
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "head-tail");
    }

    #[test]
    fn writes_bypass_the_head() {
        let mut stream = PrependedStream::new(b"unread".to_vec(), Cursor::new(Vec::new()));
        stream.write_all(b"reply").unwrap();
        assert_eq!(stream.stream.into_inner(), b"reply");
    }
}
