//! The event-loop driver (spec.md §4.6): one listener socket, one readiness
//! demultiplexer, one OS thread. Drives every `Connection`'s state machine
//! to completion, dispatching through the route trie and streaming the
//! response back out.
//!
//! Grounded on the teacher's `Worker::run` accept/epoll loop, stripped of
//! its multi-core `SO_REUSEPORT` sharding, per-worker metrics, and
//! keep-alive request cap (spec.md is explicitly single-threaded,
//! `Connection: close`-only) and rebuilt around `Connection`'s state
//! machine instead of the teacher's single-shot `parser::parse_request`.
use crate::conn::{Advance, Connection, ConnState, ReadOutcome};
use crate::error::CoreResult;
use crate::logging::{AccessLogRecord, ConnectRecord, Logger};
use crate::protocol::{HttpStatus, MAX_FILE_DESCRIPTORS};
use crate::response::Response;
use crate::route::{RouteOutcome, RouteTrie};
use crate::slab::ConnectionSlab;
use crate::syscalls::{self, Epoll, EPOLLIN, EPOLLOUT, ReadOutcome as SysReadOutcome, WriteOutcome, epoll_event};
use std::os::raw::c_int;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Token identifying the listener in the epoll/kqueue event batch; every
/// other token is a `ConnectionSlab` index (spec.md §4.6's `data` context).
const LISTENER_TOKEN: u64 = u64::MAX;

/// Connections idle (no read/write progress) longer than this are reclaimed
/// by the sweep. Not part of the core contract (spec.md §5) — a defensive
/// measure against peers that open a socket and never send anything.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct EventLoop {
    listen_fd: c_int,
    epoll: Epoll,
    slab: ConnectionSlab,
    routes: RouteTrie,
    logger: Arc<dyn Logger>,
}

impl EventLoop {
    pub fn new(listen_fd: c_int, routes: RouteTrie, logger: Arc<dyn Logger>) -> CoreResult<Self> {
        let epoll = Epoll::new()?;
        epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN)?;
        Ok(Self {
            listen_fd,
            epoll,
            slab: ConnectionSlab::new(MAX_FILE_DESCRIPTORS),
            routes,
            logger,
        })
    }

    /// Runs until `shutdown` is observed true, then drains the current
    /// batch and returns (spec.md §4.6: "SIGINT sets a shutdown flag that
    /// terminates the loop after the current batch").
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> CoreResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_FILE_DESCRIPTORS];
        let mut last_sweep = Instant::now();

        while !shutdown.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, 1000) {
                Ok(n) => n,
                Err(_) => continue,
            };

            for event in events.iter().take(n) {
                let token = event.u64;
                if token == LISTENER_TOKEN {
                    self.accept_loop();
                    continue;
                }
                let is_read = (event.events & EPOLLIN as u32) != 0;
                let is_write = (event.events & EPOLLOUT as u32) != 0;
                self.drive(token as usize, is_read, is_write);
            }

            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.sweep_idle();
                last_sweep = Instant::now();
            }
        }
        Ok(())
    }

    /// Drains the accept queue (spec.md §4.6 step 2: "accept as many
    /// connections as the kernel offers"), enforcing the `MAX_FILE_DESCRIPTORS`
    /// backpressure ceiling as a fatal condition on the connection, not the
    /// process: once the slab is full, new connections are refused and
    /// closed immediately rather than tracked.
    fn accept_loop(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    self.logger.connect(&ConnectRecord { peer });
                    let conn = Connection::new(fd, peer);
                    match self.slab.allocate(conn) {
                        Some(idx) => {
                            if self.epoll.add(fd, idx as u64, EPOLLIN).is_err() {
                                self.slab.free(idx);
                                unsafe {
                                    libc::close(fd);
                                }
                            }
                        }
                        None => {
                            // Kernel resource exhaustion guard (spec.md §4.6/§7):
                            // `client_fd >= MAX_FILE_DESCRIPTORS` on the original
                            // is fatal to the whole process; we instead refuse
                            // this one connection and keep serving the rest,
                            // which is the more defensible behavior for a
                            // library embedding this core (trimming note in
                            // DESIGN.md).
                            unsafe {
                                libc::close(fd);
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    fn sweep_idle(&mut self) {
        let stale: Vec<usize> = self
            .slab
            .iter()
            .filter(|(_, c)| c.last_active.elapsed() >= IDLE_TIMEOUT)
            .map(|(idx, _)| idx)
            .collect();
        for idx in stale {
            self.destroy(idx);
        }
    }

    /// Drives one connection's state machine as far as this tick's
    /// readiness allows: reads while a request is still being parsed,
    /// dispatches on `RequestReceived`, and writes while a response is
    /// queued.
    fn drive(&mut self, idx: usize, is_read: bool, is_write: bool) {
        if is_read && self.slab.get(idx).map(|c| c.wants_read()).unwrap_or(false) {
            if !self.read_phase(idx) {
                return;
            }
        }
        if is_write || self.slab.get(idx).map(|c| c.needs_write_readiness()).unwrap_or(false) {
            self.write_phase(idx);
        }
    }

    /// Reads available bytes and drives the parser as far as they allow.
    /// Returns `false` if the connection was destroyed (peer hangup/error,
    /// or a canonical rejection that immediately completed).
    fn read_phase(&mut self, idx: usize) -> bool {
        loop {
            let Some(conn) = self.slab.get_mut(idx) else { return false };
            let chunk_size = conn.recv_chunk_size();
            let fd = conn.fd;
            let mut scratch = vec![0u8; chunk_size];

            match syscalls::read_nonblocking(fd, &mut scratch) {
                Ok(SysReadOutcome::Data(n)) => {
                    conn.feed(&scratch[..n]);
                }
                Ok(SysReadOutcome::WouldBlock) => break,
                Ok(SysReadOutcome::Eof) => {
                    // Peer closed before a full request (or body) arrived:
                    // terminal I/O, no response (spec.md §4.5 failure policy).
                    if !matches!(conn.state, ConnState::RequestReceived) {
                        self.destroy(idx);
                        return false;
                    }
                    break;
                }
                Err(_) => {
                    self.destroy(idx);
                    return false;
                }
            }

            let Some(conn) = self.slab.get_mut(idx) else { return false };
            if conn.state == ConnState::HeadersParsed && conn.body_uses_temp_file() {
                let _ = syscalls::grow_recv_buffer(fd, conn.recv_chunk_size());
            }
            match conn.advance_read() {
                ReadOutcome::NeedMoreData => continue,
                ReadOutcome::Ready => break,
            }
        }

        let Some(conn) = self.slab.get(idx) else { return false };
        if !matches!(
            conn.state,
            ConnState::RequestReceived | ConnState::WritingResponseHeader
        ) {
            return true; // still parsing, wait for more readiness
        }

        self.dispatch(idx);
        true
    }

    /// Resolves and invokes the handler once a request is fully received,
    /// or picks up the canonical error response the parser already queued
    /// (spec.md §4.4/§4.5 dispatch step). A handler response backed by a
    /// file is run through the conditional-GET short-circuit against the
    /// request's `If-Modified-Since` header, if present (spec.md §4.3).
    fn dispatch(&mut self, idx: usize) {
        let Some(conn) = self.slab.get_mut(idx) else { return };
        if conn.state == ConnState::WritingResponseHeader {
            return; // a rejection already called set_response
        }

        let Some(req) = conn.take_request() else { return };
        let if_modified_since =
            req.headers.get("If-Modified-Since").and_then(crate::time::parse_http_date);
        let outcome = self.routes.resolve(req.method, &req.path);
        let response = match outcome {
            RouteOutcome::Handler(handler) => {
                let response = handler(req).unwrap_or_else(|| Response::empty(HttpStatus::NoContent));
                match if_modified_since {
                    Some(since) => response.try_optimize_if_not_modified_since(since),
                    None => response,
                }
            }
            RouteOutcome::NotFound => Response::not_found(),
            RouteOutcome::MethodNotAllowed => Response::method_not_allowed(),
            RouteOutcome::Malformed => Response::malformed_request(),
        };

        if let Some(conn) = self.slab.get_mut(idx) {
            conn.set_response(response);
        }
    }

    /// Writes as much of the queued response as the socket will currently
    /// accept; switches the fd to write-only readiness if a multi-cycle
    /// delivery is needed, and destroys the connection (emitting the access
    /// log) once fully drained (spec.md §4.5 write-side steps 6-7).
    fn write_phase(&mut self, idx: usize) {
        loop {
            let Some(conn) = self.slab.get_mut(idx) else { return };
            let fd = conn.fd;
            if conn.state == ConnState::WritingResponseBody {
                let _ = syscalls::grow_send_buffer(fd, conn.send_chunk_size());
            }
            let pending = conn.pending_write();
            if pending.is_empty() {
                break;
            }

            // Pace the write against what the kernel send buffer can
            // actually take right now (spec.md §4.5 step 7:
            // min(remaining, local_buf_size, kernel_send_free)); `pending`
            // is already bounded by the local chunk size.
            let kernel_free = syscalls::kernel_send_free(fd).unwrap_or(pending.len());
            if kernel_free == 0 {
                let _ = self.epoll.modify(fd, idx as u64, EPOLLOUT);
                return;
            }
            let take = pending.len().min(kernel_free);

            match syscalls::write_nonblocking(fd, &pending[..take]) {
                Ok(WriteOutcome::Written(n)) => match conn.mark_written(n) {
                    Ok(Advance::Continue) => continue,
                    Ok(Advance::Done) => break,
                    Err(_) => {
                        self.destroy(idx);
                        return;
                    }
                },
                Ok(WriteOutcome::WouldBlock) => {
                    let _ = self.epoll.modify(fd, idx as u64, EPOLLOUT);
                    return;
                }
                Err(_) => {
                    // EPIPE/ECONNRESET or other write error: terminal I/O,
                    // connection destroyed without completing the response
                    // (spec.md §4.5 failure policy, §7).
                    self.destroy(idx);
                    return;
                }
            }
        }

        self.emit_access_log(idx);
        self.destroy(idx);
    }

    fn emit_access_log(&self, idx: usize) {
        let Some(conn) = self.slab.get(idx) else { return };
        let Some(status) = conn.response_status() else { return };
        let (method, path, protocol) = conn.log_identity();
        let t_received = conn.t_request_received.unwrap_or(conn.t_connected);
        let t_set = conn.t_response_set.unwrap_or(t_received);
        let t_sent = conn.t_response_sent.unwrap_or(t_set);
        self.logger.access(&AccessLogRecord {
            peer: conn.peer,
            method,
            path: path.to_string(),
            protocol: protocol.to_string(),
            status,
            bytes_in: conn.bytes_in,
            bytes_out: conn.bytes_out,
            receive_duration: t_received.saturating_duration_since(conn.t_connected),
            handle_duration: t_set.saturating_duration_since(t_received),
            send_duration: t_sent.saturating_duration_since(t_set),
        });
    }

    fn destroy(&mut self, idx: usize) {
        if let Some(conn) = self.slab.free(idx) {
            let _ = self.epoll.delete(conn.fd);
            unsafe {
                libc::close(conn.fd);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let indices: Vec<usize> = self.slab.iter().map(|(idx, _)| idx).collect();
        for idx in indices {
            if let Some(conn) = self.slab.free(idx) {
                unsafe {
                    libc::close(conn.fd);
                }
            }
        }
        unsafe {
            libc::close(self.listen_fd);
        }
    }
}
