use hearth::{Config, Response, Server};

fn main() {
    env_logger::init();

    let server = Server::new(Config::with_endpoint([127, 0, 0, 1], 8000), |request| {
        Response::text(format!("hello! you asked for {}\n", request.url()))
    })
    .expect("failed to start the server");

    println!("listening on http://{}", server.local_addrs()[0]);
    server.run().expect("server failed");
}
