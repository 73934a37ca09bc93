//! Wire-level scenarios mirroring spec.md §8's end-to-end list: a real
//! listener, a real `TcpStream`, byte-for-byte checks against the literal
//! response fragments the spec calls out.
mod common;

use common::{TestServer, split_response};
use httpcore::protocol::HttpMethod;
use httpcore::request::Request;
use httpcore::response::Response;
use httpcore::route::RouteTrie;

fn returns_r1(_req: Request) -> Option<Response> {
    Some(Response::from_string(httpcore::protocol::HttpStatus::Ok, "{\"r\":1}"))
}

fn echo_body(mut req: Request) -> Option<Response> {
    let body = req.body.read_to_vec().unwrap_or_default();
    Some(Response::from_string(httpcore::protocol::HttpStatus::Ok, body))
}

#[test]
fn simple_get_returns_200_with_exact_body_and_headers() {
    let mut routes = RouteTrie::new();
    routes.register(HttpMethod::Get, "/v1/api/test", returns_r1);
    let server = TestServer::start(routes);

    let raw = server.roundtrip(b"GET /v1/api/test HTTP/1.0\r\nHost: x\r\n\r\n");
    let (status_line, headers, body) = split_response(&raw);

    assert_eq!(status_line, "HTTP/1.0 200 OK");
    assert!(headers.iter().any(|h| h == "Content-Length: 7"));
    assert!(headers.iter().any(|h| h == "Connection: close"));
    assert_eq!(body, b"{\"r\":1}");
}

#[test]
fn method_not_registered_on_path_is_405_with_canonical_body() {
    let mut routes = RouteTrie::new();
    routes.register(HttpMethod::Get, "/v1/api/test", returns_r1);
    let server = TestServer::start(routes);

    let raw = server.roundtrip(b"PUT /v1/api/test HTTP/1.0\r\nContent-Length: 0\r\n\r\n");
    let (status_line, _headers, body) = split_response(&raw);

    assert_eq!(status_line, "HTTP/1.0 405 Method Not Allowed");
    assert_eq!(
        body,
        br#"{"message":"The request method is inappropriate for the requested resource","code":405}"#
    );
}

#[test]
fn unregistered_path_is_404_with_canonical_body() {
    let routes = RouteTrie::new();
    let server = TestServer::start(routes);

    let raw = server.roundtrip(b"GET /nope HTTP/1.0\r\n\r\n");
    let (status_line, _headers, body) = split_response(&raw);

    assert_eq!(status_line, "HTTP/1.0 404 Not Found");
    assert_eq!(body, br#"{"message":"The requested resource was not found","code":404}"#);
}

#[test]
fn oversized_uri_is_414() {
    let routes = RouteTrie::new();
    let server = TestServer::start(routes);

    let target = "a".repeat(2048);
    let request = format!("GET /{} HTTP/1.0\r\n\r\n", target);
    let raw = server.roundtrip(request.as_bytes());
    let (status_line, _headers, body) = split_response(&raw);

    assert_eq!(status_line, "HTTP/1.0 414 URI Too Long");
    assert!(std::str::from_utf8(&body).unwrap().contains("\"code\":414"));
}

#[test]
fn post_without_content_length_is_411() {
    let mut routes = RouteTrie::new();
    routes.register(HttpMethod::Post, "/v1/api/test", echo_body);
    let server = TestServer::start(routes);

    let raw = server.roundtrip(b"POST /v1/api/test HTTP/1.0\r\n\r\nabc");
    let (status_line, _headers, body) = split_response(&raw);

    assert_eq!(status_line, "HTTP/1.0 411 Length Required");
    assert!(std::str::from_utf8(&body).unwrap().contains("\"code\":411"));
}

#[test]
fn large_body_spills_to_temp_file_and_echoes_exactly() {
    let mut routes = RouteTrie::new();
    routes.register(HttpMethod::Post, "/echo", echo_body);
    let server = TestServer::start(routes);

    const LEN: usize = 8 * 1024 * 1024;
    let mut request = format!("POST /echo HTTP/1.0\r\nContent-Length: {}\r\n\r\n", LEN).into_bytes();
    request.extend(std::iter::repeat(0x41u8).take(LEN));

    let raw = server.roundtrip(&request);
    let (status_line, headers, body) = split_response(&raw);

    assert_eq!(status_line, "HTTP/1.0 200 OK");
    assert!(headers.iter().any(|h| h == format!("Content-Length: {}", LEN)));
    assert_eq!(body.len(), LEN);
    assert!(body.iter().all(|&b| b == 0x41));
}
