//! End-to-end tests: a real server on a loopback port, driven by a plain
//! TCP client speaking raw HTTP/1.1.

use std::io::Read;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hearth::input::get_raw_post_input;
use hearth::websocket;
use hearth::{
    Config, GzipPolicy, HttpError, ReadWrite, Request, Response, ResponseBody, Server,
    ShutdownHandle, Upgrade,
};

fn start_with_config<F>(config: Config, handler: F) -> (SocketAddr, ShutdownHandle)
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    let server = Server::new(config, handler).unwrap();
    let addr = server.local_addrs()[0];
    let shutdown = server.shutdown_handle();
    thread::spawn(move || {
        let _ = server.run();
    });
    (addr, shutdown)
}

fn start<F>(handler: F) -> (SocketAddr, ShutdownHandle)
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    start_with_config(Config::with_endpoint([127, 0, 0, 1], 0), handler)
}

// A client that owns its receive buffer, so bytes belonging to the next
// response on a keep-alive connection are never lost.
struct Client {
    stream: TcpStream,
    buffer: Vec<u8>,
}

#[derive(Debug)]
struct WireResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl WireResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| &v[..])
    }
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client {
            stream,
            buffer: Vec::new(),
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    // Pulls more bytes into the buffer. Returns false on EOF.
    fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) => false,
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                true
            }
            Err(err) => panic!("read error: {}", err),
        }
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        while self.buffer.len() < n {
            assert!(self.fill(), "connection closed while expecting {} bytes", n);
        }
        let rest = self.buffer.split_off(n);
        std::mem::replace(&mut self.buffer, rest)
    }

    fn take_until_crlfcrlf(&mut self) -> Vec<u8> {
        loop {
            if let Some(pos) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                return self.take(pos + 4);
            }
            assert!(self.fill(), "connection closed while reading headers");
        }
    }

    fn read_response(&mut self) -> WireResponse {
        let head = self.take_until_crlfcrlf();
        let head = String::from_utf8(head).unwrap();
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap();
        assert!(status_line.starts_with("HTTP/1."), "bad status line: {}", status_line);
        let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon = line.find(':').unwrap();
            headers.push((
                line[..colon].to_owned(),
                line[colon + 1..].trim().to_owned(),
            ));
        }

        let mut response = WireResponse {
            status,
            headers,
            body: Vec::new(),
        };

        // Interim and bodyless statuses carry nothing else.
        if status == 100 || status == 101 || status == 204 || status == 304 {
            return response;
        }

        if response
            .header("Transfer-Encoding")
            .map_or(false, |v| v.eq_ignore_ascii_case("chunked"))
        {
            loop {
                let size_line = self.take_line();
                let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
                if size == 0 {
                    let blank = self.take_line();
                    assert_eq!(blank, "");
                    break;
                }
                let mut chunk = self.take(size);
                response.body.append(&mut chunk);
                let blank = self.take_line();
                assert_eq!(blank, "");
            }
        } else if let Some(len) = response.header("Content-Length") {
            let len: usize = len.parse().unwrap();
            response.body = self.take(len);
        } else {
            // Read until the server closes.
            while self.fill() {}
            response.body = std::mem::replace(&mut self.buffer, Vec::new());
        }

        response
    }

    fn take_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let line = self.take(pos + 2);
                return String::from_utf8(line[..pos].to_vec()).unwrap();
            }
            assert!(self.fill(), "connection closed while reading a line");
        }
    }

    // True if the server has closed the connection.
    fn at_eof(&mut self) -> bool {
        if !self.buffer.is_empty() {
            return false;
        }
        let mut chunk = [0u8; 64];
        match self.stream.read(&mut chunk) {
            Ok(0) => true,
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                false
            }
            // A reset also counts as closed.
            Err(_) => true,
        }
    }
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}

#[test]
fn compressible_body_is_gzipped_and_connection_survives() {
    let (addr, shutdown) = start(|_| Response::text("a".repeat(10 * 1024)));

    let mut client = Client::connect(addr);
    client.send(b"GET /x HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\n\r\n");
    let response = client.read_response();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Encoding"), Some("gzip"));
    let body = gunzip(&response.body);
    assert_eq!(body.len(), 10 * 1024);
    assert!(body.iter().all(|&b| b == b'a'));

    // The connection was kept alive: a second request goes through.
    client.send(b"GET /again HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 200);

    shutdown.brutal();
}

#[test]
fn small_body_is_not_gzipped() {
    let (addr, shutdown) = start(|_| Response::text("b".repeat(500)));

    let mut client = Client::connect(addr);
    client.send(b"GET /x HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\n\r\n");
    let response = client.read_response();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Encoding"), None);
    assert_eq!(response.header("Content-Length"), Some("500"));
    assert_eq!(response.body.len(), 500);

    shutdown.brutal();
}

#[test]
fn head_with_range_sends_headers_only() {
    let (addr, shutdown) = start(|_| {
        let payload: Vec<u8> = (0..100 * 1024u32).map(|n| (n % 251) as u8).collect();
        Response {
            status_code: 200,
            headers: vec![("Content-Type".into(), "application/octet-stream".into())],
            data: ResponseBody::from_data(payload),
            gzip: GzipPolicy::Never,
            upgrade: None,
            cleanup: None,
        }
    });

    let mut client = Client::connect(addr);
    client.send(b"HEAD /y HTTP/1.1\r\nHost: h\r\nRange: bytes=0-15\r\n\r\n");
    let head = client.take_until_crlfcrlf();
    let head = String::from_utf8(head).unwrap();

    assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
    assert!(head.contains("Content-Range: bytes 0-15/102400\r\n"));
    assert!(head.contains("Content-Length: 16\r\n"));

    // No body bytes followed: the next request parses cleanly.
    client.send(b"GET /z HTTP/1.1\r\nHost: h\r\nRange: bytes=3-4\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 206);
    assert_eq!(response.body, vec![3u8, 4u8]);

    shutdown.brutal();
}

#[test]
fn multiple_ranges_produce_multipart_byteranges() {
    let (addr, shutdown) = start(|_| {
        let payload: Vec<u8> = (0..100 * 1024u32).map(|n| (n % 251) as u8).collect();
        Response {
            status_code: 200,
            headers: vec![("Content-Type".into(), "application/octet-stream".into())],
            data: ResponseBody::from_data(payload),
            gzip: GzipPolicy::Never,
            upgrade: None,
            cleanup: None,
        }
    });

    let mut client = Client::connect(addr);
    client.send(b"GET /z HTTP/1.1\r\nHost: h\r\nRange: bytes=0-15,100-115\r\n\r\n");
    let response = client.read_response();

    assert_eq!(response.status, 206);
    let content_type = response.header("Content-Type").unwrap().to_owned();
    let boundary = content_type
        .strip_prefix("multipart/byteranges; boundary=")
        .expect("not a multipart response");
    assert_eq!(boundary.len(), 64);

    let body = String::from_utf8_lossy(&response.body).into_owned();
    assert!(body.contains("Content-Range: bytes 0-15/102400"));
    assert!(body.contains("Content-Range: bytes 100-115/102400"));
    assert!(body.ends_with(&format!("--{}--\r\n", boundary)));

    shutdown.brutal();
}

#[test]
fn expect_continue_gets_interim_response_and_parsed_form() {
    let (addr, shutdown) = start(|request| match get_raw_post_input(request) {
        Ok(fields) => Response::text(format!("k={}", fields[0].1)),
        Err(_) => Response::empty_400(),
    });

    let mut client = Client::connect(addr);
    client.send(
        b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 7\r\n\
          Content-Type: application/x-www-form-urlencoded\r\nExpect: 100-continue\r\n\r\nk=v%20w",
    );

    let interim = client.read_response();
    assert_eq!(interim.status, 100);

    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"k=v w");

    shutdown.brutal();
}

#[test]
fn unknown_method_is_501_and_closes() {
    let (addr, shutdown) = start(|_| Response::text("unreachable"));

    let mut client = Client::connect(addr);
    client.send(b"GETT /x HTTP/1.1\r\nHost: h\r\n\r\n");
    let response = client.read_response();

    assert_eq!(response.status, 501);
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(client.at_eof());

    shutdown.brutal();
}

#[test]
fn early_bytes_of_the_next_request_are_not_lost() {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    let (addr, shutdown) = start(move |request| {
        c.fetch_add(1, Ordering::SeqCst);
        Response::text(format!("path={}", request.url()))
    });

    let mut client = Client::connect(addr);
    // Both requests in a single write: the second one sits in the receive
    // buffer while the first response is produced.
    client.send(
        b"GET /one HTTP/1.1\r\nHost: h\r\n\r\nGET /two HTTP/1.1\r\nHost: h\r\n\r\n",
    );

    let first = client.read_response();
    assert_eq!(first.body, b"path=/one");
    let second = client.read_response();
    assert_eq!(second.body, b"path=/two");
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    shutdown.brutal();
}

#[test]
fn oversized_headers_close_without_a_response() {
    let config = Config {
        max_header_bytes: 1024,
        ..Config::with_endpoint([127, 0, 0, 1], 0)
    };
    let (addr, shutdown) = start_with_config(config, |_| Response::text("unreachable"));

    let mut client = Client::connect(addr);
    let mut request = b"GET /x HTTP/1.1\r\n".to_vec();
    request.extend_from_slice(b"X-Padding: ");
    request.extend(std::iter::repeat(b'p').take(4096));
    // No terminating blank line: the server must give up on size alone.
    client.send(&request);

    assert!(client.at_eof());
    shutdown.brutal();
}

#[test]
fn large_request_bodies_are_received_in_full() {
    let config = Config {
        spill_to_file_threshold: 128,
        ..Config::with_endpoint([127, 0, 0, 1], 0)
    };
    let (addr, shutdown) = start_with_config(config, |request| {
        let mut body = Vec::new();
        request.data().unwrap().read_to_end(&mut body).unwrap();
        Response::text(format!("got {} bytes", body.len()))
    });

    let mut client = Client::connect(addr);
    client.send(b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 4096\r\nContent-Type: application/octet-stream\r\n\r\n");
    // Body delivered in pieces, with pauses, to exercise partial reads.
    let payload = vec![b'x'; 4096];
    for piece in payload.chunks(1000) {
        client.send(piece);
        thread::sleep(Duration::from_millis(20));
    }

    let response = client.read_response();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"got 4096 bytes");

    shutdown.brutal();
}

#[test]
fn body_too_large_is_413() {
    let config = Config {
        max_body_bytes: 256,
        ..Config::with_endpoint([127, 0, 0, 1], 0)
    };
    let (addr, shutdown) = start_with_config(config, |_| Response::text("unreachable"));

    let mut client = Client::connect(addr);
    client.send(
        b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 1024\r\nContent-Type: text/plain\r\n\r\n",
    );
    let response = client.read_response();
    assert_eq!(response.status, 413);
    assert_eq!(response.header("Connection"), Some("close"));

    shutdown.brutal();
}

#[test]
fn panicking_handler_turns_into_an_error_page() {
    let (addr, shutdown) = start(|request| {
        if request.url() == "/missing" {
            HttpError::new(404).raise();
        }
        panic!("boom");
    });

    let mut client = Client::connect(addr);
    client.send(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 404);

    let mut client = Client::connect(addr);
    client.send(b"GET /other HTTP/1.1\r\nHost: h\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 500);

    shutdown.brutal();
}

#[test]
fn http10_requests_are_served_and_closed() {
    let (addr, shutdown) = start(|_| Response::text("hello"));

    let mut client = Client::connect(addr);
    client.send(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n");
    let response = client.read_response();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.body, b"hello");
    assert!(client.at_eof());

    shutdown.brutal();
}

struct PongOnce;

impl Upgrade for PongOnce {
    fn take_stream(&mut self, mut stream: Box<dyn ReadWrite + Send>) {
        thread::spawn(move || {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").unwrap();
        });
    }
}

#[test]
fn websocket_upgrade_hands_over_the_socket() {
    let (addr, shutdown) = start(|request| {
        match websocket::switch_protocols(request, None, Box::new(PongOnce)) {
            Ok(response) => response,
            Err(_) => Response::empty_400(),
        }
    });

    let mut client = Client::connect(addr);
    client.send(
        b"GET /ws HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
          Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
    );

    let response = client.read_response();
    assert_eq!(response.status, 101);
    assert_eq!(
        response.header("Sec-WebSocket-Accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    assert_eq!(response.header("Upgrade"), Some("websocket"));

    // The socket now belongs to the upgrade handler.
    client.send(b"ping");
    let reply = client.take(4);
    assert_eq!(reply, b"pong");

    shutdown.brutal();
}

#[test]
fn graceful_shutdown_closes_idle_connections() {
    let (addr, shutdown) = start(|_| Response::text("done"));

    let mut client = Client::connect(addr);
    client.send(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 200);

    // The connection is now idle between keep-alive requests; a graceful
    // shutdown may close it.
    shutdown.graceful();
    shutdown.wait_complete();
    assert!(client.at_eof());
}
