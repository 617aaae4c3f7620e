//! Accepts WebSocket upgrade handshakes and echoes raw bytes back.
//!
//! The library hands over the socket after the `101 Switching Protocols`
//! response; everything after that, including the WebSocket frame format,
//! belongs to the embedder. This demo keeps it simple and echoes the raw
//! byte stream, which is enough to watch the handshake work with netcat
//! or a custom client.

use std::io::{Read, Write};
use std::thread;

use hearth::{websocket, Config, ReadWrite, Response, Server, Upgrade};

struct RawEcho;

impl Upgrade for RawEcho {
    fn take_stream(&mut self, mut stream: Box<dyn ReadWrite + Send>) {
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

fn main() {
    env_logger::init();

    let server = Server::new(Config::with_endpoint([127, 0, 0, 1], 8000), |request| {
        if request.url() == "/ws" {
            match websocket::switch_protocols(request, None, Box::new(RawEcho)) {
                Ok(response) => response,
                Err(_) => Response::empty_400(),
            }
        } else {
            Response::html("<p>connect a websocket to <code>/ws</code></p>")
        }
    })
    .expect("failed to start the server");

    println!("listening on http://{}", server.local_addrs()[0]);
    server.run().expect("server failed");
}
