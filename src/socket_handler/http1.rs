// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The HTTP/1.x connection state machine.
//!
//! One `Http1Handler` serves one TCP connection for its whole life:
//! accumulate header bytes, parse, buffer the declared body, dispatch the
//! handler and the response serialization to the task pool, stream the
//! produced blocks back out, then either recycle the connection for the
//! next request or close it.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use mio::{Ready, Registration, SetReadiness};
use tempfile::TempPath;

use crate::body::{BodySink, RequestBody};
use crate::errors::HandlerCrash;
use crate::parser;
use crate::parser::Head;
use crate::pipeline;
use crate::pipeline::RequestFacts;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::server::ServerContext;
use crate::socket_handler::task_pool::TaskPool;
use crate::socket_handler::{Protocol, SocketHandler, Update, UpdateResult};

// Response bytes travel from the worker to the event loop in blocks of
// roughly this size.
const OUTPUT_BLOCK_SIZE: usize = 8 * 1024;

// A slow client eventually blocks the worker producing its response
// instead of buffering the whole body in memory.
const RESPONSE_CHANNEL_DEPTH: usize = 16;

// Stop draining response blocks into the write buffer past this point;
// socket writability pulls the rest.
const OUTPUT_HIGH_WATER: usize = 128 * 1024;

/// Handles the processing of one client connection.
pub(crate) struct Http1Handler {
    // The handler is a state machine.
    state: Http1HandlerState,

    // Address of the client. Necessary for the request objects.
    client_addr: SocketAddr,

    // Protocol of the endpoint that accepted the connection.
    original_protocol: Protocol,

    // Configuration, user handler and shared counters.
    ctx: Arc<ServerContext>,

    // The pool where handler invocations are dispatched.
    task_pool: TaskPool,

    // Number of responses completed on this connection.
    served: u64,

    // Parked between two keep-alive requests.
    idle: bool,
}

enum Http1HandlerState {
    // A panic happened during the processing. Any call to `update` will
    // panic.
    Poisoned,

    // Accumulating bytes until the buffer holds the whole header block.
    WaitingForHeaders {
        // Everything before this offset was already scanned for the
        // delimiter during an earlier `update`.
        new_data_start: usize,
    },

    // Headers parsed; moving the declared body into its sink.
    BufferingBody {
        head: Head,
        sink: BodySink,
        remaining: u64,
    },

    // The handler and the response serialization are running in the task
    // pool; blocks of output arrive over the channel.
    ExecutingHandler {
        response_getter: Receiver<ResponseChunk>,
        registration: Arc<Registration>,
        set_ready: SetReadiness,
    },

    // The socket now belongs to an upgrade handler; nothing more to do.
    Upgraded,

    // The connection is finished. Flush the write buffer and drop the
    // socket.
    Closed,
}

// What the background task streams back to the state machine.
pub(crate) enum ResponseChunk {
    /// Wire bytes, ready to send.
    Data(Vec<u8>),
    /// The response is complete; the verdict says whether the connection
    /// survives.
    Done { keep_alive: bool },
    /// A `101 Switching Protocols` block was sent; hand over the socket.
    Switch(Box<dyn crate::Upgrade + Send>),
}

impl Http1Handler {
    pub fn new(
        client_addr: SocketAddr,
        original_protocol: Protocol,
        task_pool: TaskPool,
        ctx: Arc<ServerContext>,
    ) -> Http1Handler {
        Http1Handler {
            state: Http1HandlerState::WaitingForHeaders { new_data_start: 0 },
            client_addr,
            original_protocol,
            ctx,
            task_pool,
            served: 0,
            idle: false,
        }
    }

    fn set_idle(&mut self, idle: bool) {
        if self.idle != idle {
            self.idle = idle;
            if idle {
                self.ctx.idle_keepalive.fetch_add(1, Ordering::SeqCst);
            } else {
                self.ctx.idle_keepalive.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    // Common plumbing of the two dispatch paths: a channel for the output
    // blocks, a registration so the event loop hears about them, and a
    // task on the pool.
    fn spawn_task<F>(&self, task: F) -> Http1HandlerState
    where
        F: FnOnce(BlockWriter) + Send + 'static,
    {
        let (tx, rx) = bounded(RESPONSE_CHANNEL_DEPTH);
        let (registration, set_ready) = Registration::new2();

        let writer = BlockWriter {
            sender: tx,
            set_ready: set_ready.clone(),
            buffer: Vec::with_capacity(OUTPUT_BLOCK_SIZE),
        };
        self.task_pool.spawn(move || task(writer));

        Http1HandlerState::ExecutingHandler {
            response_getter: rx,
            registration: Arc::new(registration),
            set_ready,
        }
    }

    // A protocol violation: send the pre-formed response and close.
    fn dispatch_error(&self, response: Response) -> Http1HandlerState {
        let ctx = self.ctx.clone();
        let facts = RequestFacts {
            is_head: false,
            version: crate::request::HttpVersion(1, 1),
            accepts_gzip: false,
            ranges: None,
            connection_upgrade: false,
            upgrade_websocket: false,
            websocket_key: None,
        };

        self.spawn_task(move |mut writer| {
            match pipeline::emit_response(response, &facts, false, &ctx.config, &mut writer) {
                Ok(_) => writer.finish(false),
                Err(err) => {
                    log::debug!("failed to write error response: {}", err);
                    writer.finish(false);
                }
            }
        })
    }

    // A complete request: run the handler and serialize its response.
    fn dispatch_request(
        &self,
        head: Head,
        body: RequestBody,
        spill: Option<TempPath>,
    ) -> Http1HandlerState {
        let ctx = self.ctx.clone();

        let facts = RequestFacts {
            is_head: head.method == Method::Head,
            version: head.version,
            accepts_gzip: head.headers.accepts_gzip(),
            ranges: head.headers.ranges().map(|r| r.to_vec()),
            connection_upgrade: head.headers.connection.upgrade,
            upgrade_websocket: head.headers.upgrade_websocket,
            websocket_key: head.headers.sec_websocket_key().map(String::from),
        };

        let keep_alive_in =
            head.client_keepalive && !self.ctx.shutting_down.load(Ordering::SeqCst);

        let request = Request::new(
            head.method,
            head.version,
            self.original_protocol == Protocol::Https,
            head.host,
            head.port,
            head.path,
            head.query,
            head.raw_url,
            head.headers,
            self.client_addr,
            body,
            spill,
        );

        self.spawn_task(move |mut writer| {
            let response = run_handler(&ctx, &request);

            // Dropping the request here deletes its spilled body, if any,
            // before the next request can start.
            drop(request);

            let response = match response {
                Some(response) => response,
                None => {
                    // propagate_exceptions: no rendering, just close.
                    writer.finish(false);
                    return;
                }
            };

            match pipeline::emit_response(response, &facts, keep_alive_in, &ctx.config, &mut writer)
            {
                Ok(emitted) => match emitted.upgrade {
                    Some(upgrade) => writer.finish_switch(upgrade),
                    None => writer.finish(emitted.keep_alive),
                },
                Err(err) => {
                    log::debug!("transport error while writing a response: {}", err);
                    if let Some(ref hook) = ctx.config.error_hook {
                        hook(&err);
                    }
                    writer.finish(false);
                }
            }
        })
    }
}

impl SocketHandler for Http1Handler {
    fn update(&mut self, update: &mut Update) -> UpdateResult {
        let mut flush_suggested = false;

        loop {
            match mem::replace(&mut self.state, Http1HandlerState::Poisoned) {
                Http1HandlerState::Poisoned => {
                    panic!("poisoned connection handler");
                }

                Http1HandlerState::WaitingForHeaders { new_data_start } => {
                    if !update.pending_read_buffer.is_empty() {
                        self.set_idle(false);
                    }

                    // Try to find the `\r\n\r\n` that closes the header
                    // block, scanning only what wasn't scanned before.
                    let off = new_data_start.saturating_sub(3);
                    let delimiter = if update.pending_read_buffer.len() > off {
                        update.pending_read_buffer[off..]
                            .windows(4)
                            .position(|w| w == b"\r\n\r\n")
                            .map(|p| off + p)
                    } else {
                        None
                    };

                    match delimiter {
                        Some(pos) => {
                            let parsed = parser::parse_head(
                                &update.pending_read_buffer[..pos],
                                self.original_protocol == Protocol::Https,
                                self.ctx.config.max_body_bytes,
                            );

                            // Remove the header block from the buffer;
                            // whatever follows is body or the next request.
                            update.pending_read_buffer.drain(..pos + 4);

                            match parsed {
                                Ok(head) => {
                                    if head.expect_continue {
                                        update
                                            .pending_write_buffer
                                            .extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
                                    }

                                    match BodySink::new(
                                        head.body_len,
                                        self.ctx.config.spill_to_file_threshold,
                                        &self.ctx.config.temp_dir,
                                    ) {
                                        Ok(sink) => {
                                            let remaining = head.body_len;
                                            self.state = Http1HandlerState::BufferingBody {
                                                head,
                                                sink,
                                                remaining,
                                            };
                                        }
                                        Err(err) => {
                                            log::error!(
                                                "cannot create a sink for a request body: {}",
                                                err
                                            );
                                            self.state = self
                                                .dispatch_error(pipeline::error_response(500));
                                        }
                                    }
                                }
                                Err(response) => {
                                    log::debug!(
                                        "rejecting request from {} with status {}",
                                        self.client_addr,
                                        response.status_code
                                    );
                                    self.state = self.dispatch_error(response);
                                }
                            }
                        }

                        None => {
                            if update.pending_read_buffer.len() > self.ctx.config.max_header_bytes
                            {
                                // Oversized headers: close without a
                                // response.
                                log::debug!(
                                    "closing connection from {}: headers exceed {} bytes",
                                    self.client_addr,
                                    self.ctx.config.max_header_bytes
                                );
                                self.state = Http1HandlerState::Closed;
                                continue;
                            }

                            if update.eof {
                                // End of stream while idle or mid-headers:
                                // close silently.
                                self.state = Http1HandlerState::Closed;
                                continue;
                            }

                            if self.served > 0 && update.pending_read_buffer.is_empty() {
                                self.set_idle(true);
                            }
                            self.state = Http1HandlerState::WaitingForHeaders {
                                new_data_start: update.pending_read_buffer.len(),
                            };
                            return UpdateResult {
                                registration: None,
                                close_read: false,
                                write_flush_suggested: flush_suggested,
                                upgrade: None,
                            };
                        }
                    }
                }

                Http1HandlerState::BufferingBody {
                    head,
                    mut sink,
                    mut remaining,
                } => {
                    let available = update.pending_read_buffer.len() as u64;
                    let take = remaining.min(available) as usize;
                    if take > 0 {
                        if let Err(err) = sink.push(&update.pending_read_buffer[..take]) {
                            log::error!("failed to store a request body: {}", err);
                            self.state = Http1HandlerState::Closed;
                            continue;
                        }
                        update.pending_read_buffer.drain(..take);
                        remaining -= take as u64;
                    }

                    if remaining == 0 {
                        match sink.finish() {
                            Ok((body, spill)) => {
                                self.state = self.dispatch_request(head, body, spill);
                            }
                            Err(err) => {
                                log::error!("failed to finish a request body: {}", err);
                                self.state = Http1HandlerState::Closed;
                            }
                        }
                        continue;
                    }

                    if update.eof {
                        // The client went away mid-body: the request is
                        // aborted, nothing is sent back.
                        log::debug!(
                            "connection from {} closed before the request body completed",
                            self.client_addr
                        );
                        self.state = Http1HandlerState::Closed;
                        continue;
                    }

                    self.state = Http1HandlerState::BufferingBody {
                        head,
                        sink,
                        remaining,
                    };
                    return UpdateResult {
                        registration: None,
                        close_read: false,
                        write_flush_suggested: flush_suggested,
                        upgrade: None,
                    };
                }

                Http1HandlerState::ExecutingHandler {
                    response_getter,
                    registration,
                    set_ready,
                } => {
                    match response_getter.try_recv() {
                        Ok(ResponseChunk::Data(mut data)) => {
                            update.pending_write_buffer.append(&mut data);
                            let backed_up =
                                update.pending_write_buffer.len() >= OUTPUT_HIGH_WATER;
                            let result_registration = if backed_up {
                                Some((registration.clone(), set_ready.clone()))
                            } else {
                                None
                            };
                            self.state = Http1HandlerState::ExecutingHandler {
                                response_getter,
                                registration,
                                set_ready,
                            };
                            if backed_up {
                                return UpdateResult {
                                    registration: result_registration,
                                    close_read: false,
                                    write_flush_suggested: flush_suggested,
                                    upgrade: None,
                                };
                            }
                        }

                        Ok(ResponseChunk::Done { keep_alive }) => {
                            self.served += 1;
                            flush_suggested = true;

                            if keep_alive && !self.ctx.shutting_down.load(Ordering::SeqCst) {
                                // Re-enter header reading right away: the
                                // buffer may already hold the start of the
                                // next request.
                                self.state =
                                    Http1HandlerState::WaitingForHeaders { new_data_start: 0 };
                            } else {
                                self.state = Http1HandlerState::Closed;
                            }
                        }

                        Ok(ResponseChunk::Switch(upgrade)) => {
                            self.served += 1;
                            self.state = Http1HandlerState::Upgraded;

                            let mut upgrade = upgrade;
                            return UpdateResult {
                                registration: None,
                                close_read: false,
                                write_flush_suggested: true,
                                upgrade: Some(Box::new(move |stream| {
                                    upgrade.take_stream(stream)
                                })),
                            };
                        }

                        Err(TryRecvError::Empty) => {
                            let result_registration =
                                Some((registration.clone(), set_ready.clone()));
                            self.state = Http1HandlerState::ExecutingHandler {
                                response_getter,
                                registration,
                                set_ready,
                            };
                            return UpdateResult {
                                registration: result_registration,
                                close_read: false,
                                write_flush_suggested: flush_suggested,
                                upgrade: None,
                            };
                        }

                        Err(TryRecvError::Disconnected) => {
                            // The producing task died without a verdict.
                            log::warn!(
                                "response task for {} disappeared; closing the connection",
                                self.client_addr
                            );
                            self.state = Http1HandlerState::Closed;
                        }
                    }
                }

                Http1HandlerState::Upgraded => {
                    self.state = Http1HandlerState::Upgraded;
                    return UpdateResult {
                        registration: None,
                        close_read: false,
                        write_flush_suggested: false,
                        upgrade: None,
                    };
                }

                Http1HandlerState::Closed => {
                    self.state = Http1HandlerState::Closed;
                    return UpdateResult {
                        registration: None,
                        close_read: true,
                        write_flush_suggested: flush_suggested,
                        upgrade: None,
                    };
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.idle
    }
}

impl Drop for Http1Handler {
    fn drop(&mut self) {
        if self.idle {
            self.ctx.idle_keepalive.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Invokes the user handler, routing panics through the error handler or
// the default error page. `None` means "close the connection without a
// response" (propagate_exceptions).
fn run_handler(ctx: &ServerContext, request: &Request) -> Option<Response> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (ctx.handler)(request)));

    let payload = match outcome {
        Ok(response) => return Some(response),
        Err(payload) => payload,
    };

    let crash = HandlerCrash::from_payload(payload);
    log::error!(
        "handler panicked while serving {} {}: {}",
        request.method().as_str(),
        request.raw_url(),
        crash.message()
    );

    if ctx.config.propagate_exceptions {
        return None;
    }

    if let Some(ref error_handler) = ctx.error_handler {
        let rendered =
            panic::catch_unwind(AssertUnwindSafe(|| error_handler(request, &crash)));
        match rendered {
            Ok(Some(response)) => return Some(response),
            Ok(None) => {}
            Err(_) => log::error!("the error handler panicked as well"),
        }
    }

    Some(default_error_response(&crash, ctx))
}

fn default_error_response(crash: &HandlerCrash, ctx: &ServerContext) -> Response {
    let status = crash.status_code().unwrap_or(500);

    let mut body = format!(
        "<h1>{} {}</h1>\n<p>An internal error has occurred on the server.</p>\n",
        status,
        pipeline::reason_phrase(status)
    );
    if ctx.config.output_exception_info {
        body.push_str("<pre>");
        body.push_str(&escape_html(crash.message()));
        body.push_str("</pre>\n");
    }

    Response::html(body).with_status_code(status)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `io::Write` adapter that ships bytes to the state machine as
/// [`ResponseChunk`]s, waking the event loop after every send.
pub(crate) struct BlockWriter {
    sender: Sender<ResponseChunk>,
    set_ready: SetReadiness,
    buffer: Vec<u8>,
}

impl BlockWriter {
    fn send(&mut self, chunk: ResponseChunk) -> io::Result<()> {
        self.sender
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "the connection is gone"))?;
        let _ = self.set_ready.set_readiness(Ready::readable());
        Ok(())
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let block = mem::replace(&mut self.buffer, Vec::with_capacity(OUTPUT_BLOCK_SIZE));
        self.send(ResponseChunk::Data(block))
    }

    fn finish(mut self, keep_alive: bool) {
        let _ = self
            .flush_block()
            .and_then(|_| self.send(ResponseChunk::Done { keep_alive }));
    }

    fn finish_switch(mut self, upgrade: Box<dyn crate::Upgrade + Send>) {
        let _ = self
            .flush_block()
            .and_then(|_| self.send(ResponseChunk::Switch(upgrade)));
    }
}

impl io::Write for BlockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= OUTPUT_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()
    }
}
