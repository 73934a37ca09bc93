//! Shared end-to-end harness: binds a real listener, drives it through
//! `EventLoop` on a background thread, and lets each test talk to it over a
//! plain `TcpStream` (spec.md §8's end-to-end scenarios). Bypasses
//! `Server::launch` deliberately — `launch` installs a process-wide `SIGINT`
//! handler via `ctrlc`, which can only be installed once per process, so
//! more than one test driving it directly in the same binary would fail the
//! second call.
use httpcore::logging::StderrLogger;
use httpcore::route::RouteTrie;
use httpcore::syscalls;
use httpcore::worker::EventLoop;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

static NEXT_PORT: AtomicU16 = AtomicU16::new(20_100);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

pub struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Binds on `127.0.0.1` at the next test-reserved port and starts
    /// driving `routes` on a background thread.
    pub fn start(routes: RouteTrie) -> Self {
        let port = next_port();
        let listen_fd =
            syscalls::create_listen_socket("127.0.0.1", port).expect("test listener should bind");
        let logger = Arc::new(StderrLogger);
        let mut event_loop = EventLoop::new(listen_fd, routes, logger).expect("event loop init");
        let shutdown = Arc::new(AtomicBool::new(false));
        let loop_shutdown = shutdown.clone();
        let handle = thread::spawn(move || {
            let _ = event_loop.run(loop_shutdown);
        });
        // give the background thread a moment to reach epoll_wait before
        // the test's first connect attempt.
        thread::sleep(Duration::from_millis(50));
        Self { port, shutdown, handle: Some(handle) }
    }

    /// Opens a fresh connection to the running server.
    pub fn connect(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("should connect to test server");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.set_write_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    /// Writes `request` verbatim, then reads until the peer closes the
    /// connection (every response here is `Connection: close`).
    pub fn roundtrip(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.connect();
        stream.write_all(request).expect("write request");
        let mut response = Vec::new();
        stream.read_to_end(&mut response).expect("read response");
        response
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Splits a raw HTTP response into `(status_line, headers, body)`.
pub fn split_response(raw: &[u8]) -> (String, Vec<String>, Vec<u8>) {
    let sep = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response should have a header/body separator");
    let head = std::str::from_utf8(&raw[..sep]).expect("headers should be ASCII");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<String> = lines.map(|l| l.to_string()).collect();
    let body = raw[sep + 4..].to_vec();
    (status_line, headers, body)
}
