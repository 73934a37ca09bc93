//! CLI entrypoint: `server <port>` (spec.md §6). Registers a couple of
//! demonstration routes — the teacher ships this shape as `examples/
//! hello_json.rs`; this core is a `server <port>` binary rather than a
//! library-with-examples, so the demonstration routes live here instead.
use httpcore::protocol::{HttpMethod, HttpStatus};
use httpcore::request::Request;
use httpcore::response::Response;
use httpcore::server::Server;

fn hello(_req: Request) -> Option<Response> {
    Some(Response::from_string(HttpStatus::Ok, r#"{"message":"Hello, World!"}"#))
}

fn echo(mut req: Request) -> Option<Response> {
    let body = req.body.read_to_vec().unwrap_or_default();
    Some(Response::from_string(HttpStatus::Ok, body))
}

fn main() {
    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => match arg.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("usage: server <port> (got non-numeric port '{}')", arg);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("usage: server <port>");
            std::process::exit(1);
        }
    };

    let server = Server::bind(port)
        .route(HttpMethod::Get, "/hello", hello)
        .route(HttpMethod::Post, "/echo", echo);

    if let Err(e) = server.launch() {
        eprintln!("server failed to start: {}", e);
        std::process::exit(1);
    }
}
