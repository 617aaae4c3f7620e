// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The listening server: accepts sockets and drives every connection's
//! state machine from a single poll loop.
//!
//! The loop owns the sockets and nothing else: all protocol work happens
//! in the [`SocketHandler`]s, and all application work happens on the task
//! pool. Handlers communicate completions back through `mio`
//! registrations.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::config::Config;
use crate::errors::{HandlerCrash, ServerError};
use crate::request::Request;
use crate::response::Response;
use crate::socket_handler::http1::Http1Handler;
use crate::socket_handler::task_pool::TaskPool;
#[cfg(feature = "tls")]
use crate::socket_handler::tls::TlsHandler;
use crate::socket_handler::{
    Handoff, PrependedStream, Protocol, SocketHandler, Update, UpdateResult,
};

pub(crate) type RequestHandler = dyn Fn(&Request) -> Response + Send + Sync;
pub(crate) type ErrorRequestHandler =
    dyn Fn(&Request, &HandlerCrash) -> Option<Response> + Send + Sync;

/// Everything a connection may touch besides its own state: the
/// configuration snapshot, the user's handlers, and the shared counters.
pub(crate) struct ServerContext {
    pub config: Config,
    pub handler: Box<RequestHandler>,
    pub error_handler: Option<Box<ErrorRequestHandler>>,
    pub shutting_down: AtomicBool,
    pub connections_received: AtomicU64,
    pub active_connections: AtomicUsize,
    pub idle_keepalive: AtomicUsize,
}

// Token space: listeners first, then the shutdown wakeup, then two tokens
// per connection (socket and handler registration).
const SHUTDOWN_TOKEN: Token = Token(std::usize::MAX - 1);
const FIRST_CONNECTION_TOKEN: usize = 1024;

struct Connection {
    socket: TcpStream,
    handler: Box<dyn SocketHandler>,
    update: Update,
    socket_token: Token,
    registration_token: Token,
    // Present while the handler waits on background work.
    registration: Option<(Arc<Registration>, SetReadiness)>,
    // Interest currently registered for the socket; `None` when the
    // socket is not registered at all (after EOF with writes pending).
    interest: Option<Ready>,
    close_read: bool,
    pending_upgrade: Option<Handoff>,
    last_activity: Instant,
}

enum ConnAction {
    Keep,
    Close,
    Upgrade,
}

/// A listening server.
///
/// # Example
///
/// ```no_run
/// use hearth::{Config, Response, Server};
///
/// let server = Server::new(Config::with_endpoint([127, 0, 0, 1], 8000), |request| {
///     Response::text("hello world")
/// }).unwrap();
/// server.run().unwrap();
/// ```
pub struct Server {
    ctx: Arc<ServerContext>,
    poll: Poll,
    listeners: Vec<(TcpListener, bool)>,
    local_addrs: Vec<SocketAddr>,
    task_pool: TaskPool,
    shutdown: Arc<ShutdownState>,
    shutdown_registration: Registration,
}

struct ShutdownState {
    wake: SetReadiness,
    requested: AtomicBool,
    brutal: AtomicBool,
    complete: Mutex<bool>,
    condvar: Condvar,
}

/// Requests the shutdown of a running server, from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<ShutdownState>,
    ctx: Arc<ServerContext>,
}

impl ShutdownHandle {
    /// Stops accepting connections, closes the connections idling between
    /// keep-alive requests, and lets in-flight requests finish.
    pub fn graceful(&self) {
        self.ctx.shutting_down.store(true, Ordering::SeqCst);
        self.state.requested.store(true, Ordering::SeqCst);
        let _ = self.state.wake.set_readiness(Ready::readable());
    }

    /// Stops accepting connections and closes every connection
    /// immediately, in-flight or not.
    pub fn brutal(&self) {
        self.ctx.shutting_down.store(true, Ordering::SeqCst);
        self.state.brutal.store(true, Ordering::SeqCst);
        self.state.requested.store(true, Ordering::SeqCst);
        let _ = self.state.wake.set_readiness(Ready::readable());
    }

    /// Blocks until the server's connection set has drained and `run` has
    /// returned.
    pub fn wait_complete(&self) {
        let mut complete = self.state.complete.lock().unwrap();
        while !*complete {
            complete = self.state.condvar.wait(complete).unwrap();
        }
    }
}

/// Read-only view of a server's counters.
#[derive(Clone)]
pub struct ServerStats {
    ctx: Arc<ServerContext>,
}

impl ServerStats {
    /// Number of connections accepted since the server started.
    pub fn connections_received(&self) -> u64 {
        self.ctx.connections_received.load(Ordering::SeqCst)
    }

    /// Number of connections currently open.
    pub fn active_connections(&self) -> usize {
        self.ctx.active_connections.load(Ordering::SeqCst)
    }

    /// Number of open connections currently idle between two keep-alive
    /// requests.
    pub fn idle_keepalive_connections(&self) -> usize {
        self.ctx.idle_keepalive.load(Ordering::SeqCst)
    }
}

impl Server {
    /// Builds a new `Server` listening on the configured endpoints.
    ///
    /// After this function returns, every endpoint is bound; call
    /// [`run`](Server::run) to start serving.
    pub fn new<F>(config: Config, handler: F) -> Result<Server, ServerError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        Server::build(config, Box::new(handler), None)
    }

    /// Same as [`new`](Server::new), with an error handler that renders
    /// handler panics into responses. Returning `None` falls back to the
    /// default error page.
    pub fn with_error_handler<F, E>(
        config: Config,
        handler: F,
        error_handler: E,
    ) -> Result<Server, ServerError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
        E: Fn(&Request, &HandlerCrash) -> Option<Response> + Send + Sync + 'static,
    {
        Server::build(config, Box::new(handler), Some(Box::new(error_handler)))
    }

    fn build(
        config: Config,
        handler: Box<RequestHandler>,
        error_handler: Option<Box<ErrorRequestHandler>>,
    ) -> Result<Server, ServerError> {
        if config.endpoints.is_empty() {
            return Err(ServerError::NoEndpoints);
        }

        let mut seen = HashSet::new();
        for endpoint in &config.endpoints {
            if !seen.insert(endpoint.socket_addr()) {
                return Err(ServerError::DuplicateEndpoint(endpoint.socket_addr()));
            }
        }

        #[cfg(feature = "tls")]
        {
            if config.tls.is_none() {
                if let Some(secure) = config.endpoints.iter().find(|e| e.secure) {
                    return Err(ServerError::MissingTlsConfig(secure.socket_addr()));
                }
            }
        }
        #[cfg(not(feature = "tls"))]
        {
            if let Some(secure) = config.endpoints.iter().find(|e| e.secure) {
                return Err(ServerError::MissingTlsConfig(secure.socket_addr()));
            }
        }

        let poll = Poll::new()?;

        let mut listeners = Vec::with_capacity(config.endpoints.len());
        let mut local_addrs = Vec::with_capacity(config.endpoints.len());
        for (index, endpoint) in config.endpoints.iter().enumerate() {
            let addr = endpoint.socket_addr();
            let listener =
                TcpListener::bind(&addr).map_err(|err| ServerError::Bind(addr, err))?;
            let local_addr = listener.local_addr()?;
            poll.register(&listener, Token(index), Ready::readable(), PollOpt::level())?;
            log::debug!("listening on {}{}", local_addr, if endpoint.secure { " (tls)" } else { "" });
            listeners.push((listener, endpoint.secure));
            local_addrs.push(local_addr);
        }

        let (shutdown_registration, wake) = Registration::new2();
        poll.register(
            &shutdown_registration,
            SHUTDOWN_TOKEN,
            Ready::readable(),
            PollOpt::edge(),
        )?;

        let shutdown = Arc::new(ShutdownState {
            wake,
            requested: AtomicBool::new(false),
            brutal: AtomicBool::new(false),
            complete: Mutex::new(false),
            condvar: Condvar::new(),
        });

        let ctx = Arc::new(ServerContext {
            config,
            handler,
            error_handler,
            shutting_down: AtomicBool::new(false),
            connections_received: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
            idle_keepalive: AtomicUsize::new(0),
        });

        Ok(Server {
            ctx,
            poll,
            listeners,
            local_addrs,
            task_pool: TaskPool::new(),
            shutdown,
            shutdown_registration,
        })
    }

    /// The addresses the server is actually bound to. Useful with port 0.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Returns an object that can stop this server from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: self.shutdown.clone(),
            ctx: self.ctx.clone(),
        }
    }

    /// Returns a view of the server's counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            ctx: self.ctx.clone(),
        }
    }

    /// Runs the server until a shutdown is requested and the connection
    /// set drains.
    pub fn run(self) -> io::Result<()> {
        let Server {
            ctx,
            poll,
            listeners,
            local_addrs: _,
            task_pool,
            shutdown,
            shutdown_registration,
        } = self;
        // Keeps the shutdown wakeup channel alive for the whole loop.
        let _shutdown_registration = shutdown_registration;

        let mut events = Events::with_capacity(1024);
        let mut connections: HashMap<usize, Connection> = HashMap::new();
        let mut next_id: usize = 0;
        let mut accepting = true;

        loop {
            poll.poll(&mut events, Some(Duration::from_millis(500)))?;

            let mut pending: Vec<usize> = Vec::new();
            for event in events.iter() {
                let token = event.token();

                if token == SHUTDOWN_TOKEN {
                    // Flags are inspected below; reset so an escalation to
                    // brutal wakes the loop again.
                    let _ = shutdown.wake.set_readiness(Ready::empty());
                    continue;
                }

                if token.0 < listeners.len() {
                    if accepting {
                        accept_connections(
                            &poll,
                            &ctx,
                            &task_pool,
                            &listeners[token.0],
                            &mut connections,
                            &mut next_id,
                        );
                    }
                    continue;
                }

                let id = (token.0 - FIRST_CONNECTION_TOKEN) / 2;
                if connections.contains_key(&id) && !pending.contains(&id) {
                    pending.push(id);
                }
            }

            for id in pending {
                let action = match connections.get_mut(&id) {
                    Some(conn) => process_connection(&poll, conn),
                    None => continue,
                };
                match action {
                    ConnAction::Keep => {}
                    ConnAction::Close => {
                        if let Some(conn) = connections.remove(&id) {
                            close_connection(&poll, &ctx, conn);
                        }
                    }
                    ConnAction::Upgrade => {
                        if let Some(conn) = connections.remove(&id) {
                            perform_handoff(&poll, &ctx, conn);
                        }
                    }
                }
            }

            // Receive timeout: connections that are only waiting for the
            // client (fresh, mid-headers or keep-alive idle) get closed
            // after the configured idle period.
            let now = Instant::now();
            let idle_timeout = ctx.config.idle_timeout;
            let timed_out: Vec<usize> = connections
                .iter()
                .filter(|&(_, conn)| {
                    conn.registration.is_none()
                        && conn.update.pending_write_buffer.is_empty()
                        && conn.pending_upgrade.is_none()
                        && now.duration_since(conn.last_activity) >= idle_timeout
                })
                .map(|(&id, _)| id)
                .collect();
            for id in timed_out {
                if let Some(conn) = connections.remove(&id) {
                    log::debug!("closing connection: receive timeout");
                    close_connection(&poll, &ctx, conn);
                }
            }

            // Shutdown orchestration.
            if shutdown.requested.load(Ordering::SeqCst) {
                if accepting {
                    accepting = false;
                    for &(ref listener, _) in &listeners {
                        let _ = poll.deregister(listener);
                    }
                }

                if shutdown.brutal.load(Ordering::SeqCst) {
                    for (_, conn) in connections.drain() {
                        close_connection(&poll, &ctx, conn);
                    }
                } else {
                    let idle: Vec<usize> = connections
                        .iter()
                        .filter(|&(_, conn)| conn.handler.is_idle())
                        .map(|(&id, _)| id)
                        .collect();
                    for id in idle {
                        if let Some(conn) = connections.remove(&id) {
                            close_connection(&poll, &ctx, conn);
                        }
                    }
                }

                if connections.is_empty() {
                    let mut complete = shutdown.complete.lock().unwrap();
                    *complete = true;
                    shutdown.condvar.notify_all();
                    return Ok(());
                }
            }
        }
    }
}

fn accept_connections(
    poll: &Poll,
    ctx: &Arc<ServerContext>,
    task_pool: &TaskPool,
    listener: &(TcpListener, bool),
    connections: &mut HashMap<usize, Connection>,
    next_id: &mut usize,
) {
    let &(ref listener, secure) = listener;

    loop {
        let (socket, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("failed to accept a connection: {}", err);
                break;
            }
        };

        ctx.connections_received.fetch_add(1, Ordering::SeqCst);

        let handler = match build_handler(ctx, task_pool, addr, secure) {
            Some(handler) => handler,
            None => continue,
        };

        let id = *next_id;
        *next_id += 1;
        let socket_token = Token(FIRST_CONNECTION_TOKEN + id * 2);
        let registration_token = Token(FIRST_CONNECTION_TOKEN + id * 2 + 1);

        if let Err(err) = poll.register(&socket, socket_token, Ready::readable(), PollOpt::level())
        {
            log::warn!("failed to register a connection: {}", err);
            continue;
        }

        log::debug!(
            "connection from {} ({} active)",
            addr,
            ctx.active_connections.load(Ordering::SeqCst) + 1
        );
        ctx.active_connections.fetch_add(1, Ordering::SeqCst);

        connections.insert(
            id,
            Connection {
                socket,
                handler,
                update: Update::empty(),
                socket_token,
                registration_token,
                registration: None,
                interest: Some(Ready::readable()),
                close_read: false,
                pending_upgrade: None,
                last_activity: Instant::now(),
            },
        );
    }
}

fn build_handler(
    ctx: &Arc<ServerContext>,
    task_pool: &TaskPool,
    addr: SocketAddr,
    secure: bool,
) -> Option<Box<dyn SocketHandler>> {
    if !secure {
        return Some(Box::new(Http1Handler::new(
            addr,
            Protocol::Http,
            task_pool.clone(),
            ctx.clone(),
        )));
    }

    #[cfg(feature = "tls")]
    {
        // Checked at startup.
        let tls_config = ctx.config.tls.as_ref().expect("TLS configuration missing");
        let inner = Http1Handler::new(addr, Protocol::Https, task_pool.clone(), ctx.clone());
        match TlsHandler::new(tls_config, inner) {
            Ok(handler) => return Some(Box::new(handler)),
            Err(err) => {
                log::warn!("failed to start a TLS session: {}", err);
                return None;
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    {
        let _ = addr;
        unreachable!("secure endpoints are rejected at startup without the tls feature");
    }
}

// One round of reading, updating and writing for a connection.
fn process_connection(poll: &Poll, conn: &mut Connection) -> ConnAction {
    // Read everything currently available.
    if !conn.close_read && conn.pending_upgrade.is_none() && !conn.update.eof {
        let mut chunk = [0u8; 4096];
        loop {
            match conn.socket.read(&mut chunk) {
                Ok(0) => {
                    conn.update.eof = true;
                    break;
                }
                Ok(n) => {
                    conn.update.pending_read_buffer.extend_from_slice(&chunk[..n]);
                    conn.last_activity = Instant::now();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Client-side transport error: close silently.
                    log::debug!("read error on a connection: {}", err);
                    return ConnAction::Close;
                }
            }
        }
    }

    // Clear the completion readiness *before* draining, so a completion
    // that lands mid-drain still produces a wakeup.
    if let Some((_, ref set_ready)) = conn.registration {
        let _ = set_ready.set_readiness(Ready::empty());
    }

    let result = conn.handler.update(&mut conn.update);

    if !apply_registration(poll, conn, &result) {
        return ConnAction::Close;
    }

    // Ship what the handler produced.
    if result.write_flush_suggested {
        let _ = conn.socket.set_nodelay(true);
    }
    let alive = flush_writes(conn);
    if result.write_flush_suggested {
        let _ = conn.socket.set_nodelay(false);
    }
    if !alive {
        return ConnAction::Close;
    }

    if let Some(handoff) = result.upgrade {
        conn.pending_upgrade = Some(handoff);
    }
    conn.close_read = conn.close_read || result.close_read;

    if conn.pending_upgrade.is_some() && conn.update.pending_write_buffer.is_empty() {
        return ConnAction::Upgrade;
    }
    if conn.close_read && conn.update.pending_write_buffer.is_empty() {
        return ConnAction::Close;
    }

    // Adjust the socket's registration to what we now wait for.
    let mut interest = Ready::empty();
    if !conn.close_read && conn.pending_upgrade.is_none() && !conn.update.eof {
        interest |= Ready::readable();
    }
    if !conn.update.pending_write_buffer.is_empty() {
        interest |= Ready::writable();
    }

    let ok = if interest == Ready::empty() {
        match conn.interest.take() {
            Some(_) => poll.deregister(&conn.socket).is_ok(),
            None => true,
        }
    } else if conn.interest == Some(interest) {
        true
    } else {
        let ok = if conn.interest.is_some() {
            poll.reregister(&conn.socket, conn.socket_token, interest, PollOpt::level())
                .is_ok()
        } else {
            poll.register(&conn.socket, conn.socket_token, interest, PollOpt::level())
                .is_ok()
        };
        conn.interest = Some(interest);
        ok
    };
    if !ok {
        return ConnAction::Close;
    }

    ConnAction::Keep
}

// Registers, replaces or drops the handler's completion registration.
fn apply_registration(poll: &Poll, conn: &mut Connection, result: &UpdateResult) -> bool {
    match result.registration {
        Some((ref registration, ref set_ready)) => {
            let replace = match conn.registration {
                Some((ref current, _)) => !Arc::ptr_eq(current, registration),
                None => true,
            };
            if replace {
                if let Some((old, _)) = conn.registration.take() {
                    let _ = poll.deregister(&*old);
                }
                if poll
                    .register(
                        &**registration,
                        conn.registration_token,
                        Ready::readable(),
                        PollOpt::edge(),
                    )
                    .is_err()
                {
                    return false;
                }
                conn.registration = Some((registration.clone(), set_ready.clone()));
            }
        }
        None => {
            if let Some((old, _)) = conn.registration.take() {
                let _ = poll.deregister(&*old);
            }
        }
    }
    true
}

// Sends as much of the pending write buffer as the socket accepts.
// Returns false when the connection is dead.
fn flush_writes(conn: &mut Connection) -> bool {
    while !conn.update.pending_write_buffer.is_empty() {
        match conn.socket.write(&conn.update.pending_write_buffer) {
            Ok(0) => return false,
            Ok(n) => {
                conn.update.pending_write_buffer.drain(..n);
                conn.last_activity = Instant::now();
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::debug!("write error on a connection: {}", err);
                return false;
            }
        }
    }
    true
}

fn close_connection(poll: &Poll, ctx: &ServerContext, conn: Connection) {
    if conn.interest.is_some() {
        let _ = poll.deregister(&conn.socket);
    }
    if let Some((ref registration, _)) = conn.registration {
        let _ = poll.deregister(&**registration);
    }
    ctx.active_connections.fetch_sub(1, Ordering::SeqCst);
    // Dropping the connection closes the socket and, through the handler,
    // releases any TLS session.
}

// Gives the socket to the upgrade handler, with bytes the HTTP layer had
// already buffered put back in front of the stream.
fn perform_handoff(poll: &Poll, ctx: &ServerContext, conn: Connection) {
    let Connection {
        socket,
        mut update,
        registration,
        pending_upgrade,
        interest,
        ..
    } = conn;

    if interest.is_some() {
        let _ = poll.deregister(&socket);
    }
    if let Some((ref reg, _)) = registration {
        let _ = poll.deregister(&**reg);
    }
    ctx.active_connections.fetch_sub(1, Ordering::SeqCst);

    let leftover = mem::replace(&mut update.pending_read_buffer, Vec::new());
    let handoff = match pending_upgrade {
        Some(handoff) => handoff,
        None => return,
    };

    match into_std(socket) {
        Ok(stream) => {
            let _ = stream.set_nonblocking(false);
            handoff(Box::new(PrependedStream::new(leftover, stream)));
        }
        Err(err) => {
            log::error!("failed to hand a socket over for an upgrade: {}", err);
        }
    }
}

#[cfg(unix)]
fn into_std(socket: TcpStream) -> io::Result<std::net::TcpStream> {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    Ok(unsafe { std::net::TcpStream::from_raw_fd(socket.into_raw_fd()) })
}

#[cfg(windows)]
fn into_std(socket: TcpStream) -> io::Result<std::net::TcpStream> {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    Ok(unsafe { std::net::TcpStream::from_raw_socket(socket.into_raw_socket()) })
}

#[cfg(test)]
mod tests {
    use super::Server;
    use crate::config::{Config, Endpoint};
    use crate::errors::ServerError;
    use crate::Response;

    #[test]
    fn no_endpoints_is_an_error() {
        let result = Server::new(Config::default(), |_| Response::text("x"));
        assert!(matches!(result, Err(ServerError::NoEndpoints)));
    }

    #[test]
    fn duplicate_endpoints_are_rejected() {
        let config = Config {
            endpoints: vec![
                Endpoint::http([127, 0, 0, 1], 39999),
                Endpoint::http([127, 0, 0, 1], 39999),
            ],
            ..Config::default()
        };
        let result = Server::new(config, |_| Response::text("x"));
        assert!(matches!(result, Err(ServerError::DuplicateEndpoint(_))));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn secure_endpoint_requires_tls_config() {
        let config = Config {
            endpoints: vec![Endpoint::https([127, 0, 0, 1], 0)],
            ..Config::default()
        };
        let result = Server::new(config, |_| Response::text("x"));
        assert!(matches!(result, Err(ServerError::MissingTlsConfig(_))));
    }

    #[test]
    fn binds_to_an_ephemeral_port() {
        let server = Server::new(Config::with_endpoint([127, 0, 0, 1], 0), |_| {
            Response::text("x")
        })
        .unwrap();
        assert_ne!(server.local_addrs()[0].port(), 0);
    }
}
