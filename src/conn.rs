//! The per-connection state machine: incremental request parsing over a
//! sliding buffer, and response streaming back out, one readiness tick at a
//! time (spec.md §3, §4.5). States progress monotonically:
//!
//! `ClientConnected -> MethodParsed -> UrlParsed -> RequestParsed ->
//! HeadersParsed -> RequestReceived -> WritingResponseHeader ->
//! WritingResponseBody`
//!
//! Grounded on the inline read/parse/write transitions in the teacher's
//! `worker.rs`, generalized from its single-shot `parser::parse_request`
//! into steps that can each return "need more data" without losing already
//!-parsed state, and from a fixed 2036-byte buffer into the growable
//! sliding buffer spec.md requires for large request lines and bodies.
use crate::headers::HeaderMap;
use crate::protocol::{
    DESIRED_READ_CLICKS, DESIRED_SEND_CLICKS, HttpMethod, INITIAL_BUFFER_SIZE, MAX_BUFFER_SIZE,
    MAX_SND_BUFFER_SIZE, MAX_URL_LENGTH, TEMP_FILE_THRESHOLD,
};
use crate::request::{Request, RequestBody, percent_decode};
use crate::response::{Response, ResponseBody};
use std::io::{Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ClientConnected,
    MethodParsed,
    UrlParsed,
    RequestParsed,
    HeadersParsed,
    RequestReceived,
    WritingResponseHeader,
    WritingResponseBody,
}

/// Result of driving the read-side state machine as far as it will go with
/// the bytes currently buffered.
pub enum ReadOutcome {
    /// The socket should stay subscribed to read-readiness; no full request
    /// (or rejection) is available yet.
    NeedMoreData,
    /// Either `RequestReceived` was reached, or parsing failed and a
    /// canonical error `Response` is already queued — call `take_request`
    /// to tell which.
    Ready,
}

/// Result of acknowledging `n` written bytes.
pub enum Advance {
    Continue,
    Done,
}

enum Step {
    Progress,
    Pending,
}

enum WriteSource {
    /// No response has been queued yet (`set_response` not yet called).
    Idle,
    Header,
    Body,
    Done,
}

fn find_crlf(slice: &[u8]) -> Option<usize> {
    slice.windows(2).position(|w| w == b"\r\n")
}

/// `(2 * len / DESIRED_SEND_CLICKS)` clamped to `[INITIAL_BUFFER_SIZE,
/// MAX_SND_BUFFER_SIZE]` (spec.md §4.5 step 7's exact formula) — the
/// write-side analogue of spec.md §4.6's buffer-grows-toward-body-size
/// policy.
fn adaptive_chunk_size(len: u64) -> usize {
    let desired = (2 * len / DESIRED_SEND_CLICKS as u64).max(INITIAL_BUFFER_SIZE as u64);
    desired.min(MAX_SND_BUFFER_SIZE as u64) as usize
}

/// Read-side analogue of `adaptive_chunk_size`, clamped against
/// `MAX_BUFFER_SIZE` instead of `MAX_SND_BUFFER_SIZE` (spec.md §4.5 step 5:
/// "grow the read buffer toward body_bytes_to_receive / DESIRED_READ_CLICKS").
fn adaptive_recv_chunk_size(len: u64) -> usize {
    let desired = (len / DESIRED_READ_CLICKS as u64).max(INITIAL_BUFFER_SIZE as u64);
    desired.min(MAX_BUFFER_SIZE as u64) as usize
}

pub struct Connection {
    pub fd: i32,
    pub peer: SocketAddr,
    pub state: ConnState,

    buf: Vec<u8>,
    buf_start: usize,
    buf_end: usize,

    method: Option<HttpMethod>,
    raw_target: String,
    protocol: String,
    headers: HeaderMap,
    body: RequestBody,
    body_bytes_to_receive: usize,
    body_bytes_received: usize,
    recv_chunk_size: usize,

    response: Option<Response>,
    write_buf: Vec<u8>,
    write_buf_start: usize,
    write_body_cursor: u64,
    write_source: WriteSource,
    send_chunk_size: usize,

    pub bytes_in: u64,
    pub bytes_out: u64,
    pub t_connected: Instant,
    pub t_request_received: Option<Instant>,
    pub t_response_set: Option<Instant>,
    pub t_response_sent: Option<Instant>,
    /// Last time this connection made read or write progress. Not part of
    /// the core state machine contract (spec.md §5 has no per-operation
    /// timeouts) — an optional idle sweep the driver may use to reclaim fds
    /// whose peer stalled indefinitely (spec.md §5: "implementers MAY add an
    /// idle-timeout by attaching a deadline timestamp ... and sweeping on
    /// each tick").
    pub last_active: Instant,
}

impl Connection {
    pub fn new(fd: i32, peer: SocketAddr) -> Self {
        Self {
            fd,
            peer,
            state: ConnState::ClientConnected,
            buf: vec![0u8; INITIAL_BUFFER_SIZE],
            buf_start: 0,
            buf_end: 0,
            method: None,
            raw_target: String::new(),
            protocol: String::new(),
            headers: HeaderMap::new(),
            body: RequestBody::None,
            body_bytes_to_receive: 0,
            body_bytes_received: 0,
            recv_chunk_size: INITIAL_BUFFER_SIZE,
            response: None,
            write_buf: Vec::new(),
            write_buf_start: 0,
            write_body_cursor: 0,
            write_source: WriteSource::Idle,
            send_chunk_size: INITIAL_BUFFER_SIZE,
            bytes_in: 0,
            bytes_out: 0,
            t_connected: Instant::now(),
            t_request_received: None,
            t_response_set: None,
            t_response_sent: None,
            last_active: Instant::now(),
        }
    }

    /// Whether the socket should stay (or become) subscribed to
    /// write-readiness: only once the first write didn't drain everything
    /// queued (spec.md §4.6 "multi-cycle response delivery").
    pub fn needs_write_readiness(&self) -> bool {
        matches!(self.write_source, WriteSource::Header | WriteSource::Body)
    }

    /// The chunk size the driver should use for its next `recv()` into this
    /// connection: the read-side half of spec.md §4.5 step 5's adaptive
    /// buffer sizing (the kernel-side half is `syscalls::grow_recv_buffer`).
    pub fn recv_chunk_size(&self) -> usize {
        self.recv_chunk_size
    }

    /// The chunk size the driver should use when growing `SO_SNDBUF` for
    /// this connection's response body (spec.md §4.5 step 7).
    pub fn send_chunk_size(&self) -> usize {
        self.send_chunk_size
    }

    /// Whether reads should still be attempted on this connection (spec.md
    /// §3 invariant: "A Connection reaches REQUEST_RECEIVED at most once per
    /// lifetime; after it does, no more reads are performed").
    /// Whether the body sink is currently a temp file — the driver uses
    /// this to decide when to grow the kernel `SO_RCVBUF` (spec.md §4.5
    /// step 5, §4.6).
    pub fn body_uses_temp_file(&self) -> bool {
        matches!(self.body, RequestBody::File { .. })
    }

    pub fn wants_read(&self) -> bool {
        !matches!(
            self.state,
            ConnState::RequestReceived | ConnState::WritingResponseHeader | ConnState::WritingResponseBody
        )
    }

    // ---- read side -----------------------------------------------------

    fn compact(&mut self) {
        if self.buf_start > 0 {
            self.buf.copy_within(self.buf_start..self.buf_end, 0);
            self.buf_end -= self.buf_start;
            self.buf_start = 0;
        }
    }

    /// Compacts, then grows (doubling, capped at `MAX_BUFFER_SIZE`) until
    /// `extra` more bytes fit or the ceiling is hit.
    fn ensure_capacity(&mut self, extra: usize) {
        self.compact();
        if self.buf_end + extra <= self.buf.len() {
            return;
        }
        let mut new_len = self.buf.len().max(INITIAL_BUFFER_SIZE);
        while new_len < self.buf_end + extra && new_len < MAX_BUFFER_SIZE {
            new_len = (new_len * 2).min(MAX_BUFFER_SIZE);
        }
        if new_len > self.buf.len() {
            self.buf.resize(new_len, 0);
        }
    }

    /// Appends freshly-read socket bytes onto the sliding buffer. Bytes
    /// that don't fit once the buffer is already at `MAX_BUFFER_SIZE` are
    /// dropped; the parse step that's starved for a delimiter notices via
    /// `buffer_exhausted` and rejects the request instead of hanging.
    pub fn feed(&mut self, data: &[u8]) {
        self.last_active = Instant::now();
        self.bytes_in += data.len() as u64;
        self.ensure_capacity(data.len());
        let room = self.buf.len() - self.buf_end;
        let n = room.min(data.len());
        self.buf[self.buf_end..self.buf_end + n].copy_from_slice(&data[..n]);
        self.buf_end += n;
    }

    fn buffer_exhausted(&self) -> bool {
        self.buf.len() >= MAX_BUFFER_SIZE && self.buf_end - self.buf_start == self.buf.len()
    }

    fn reject(&mut self, response: Response) {
        self.set_response(response);
    }

    fn try_parse_method(&mut self) -> Result<Step, ()> {
        let slice = &self.buf[self.buf_start..self.buf_end];
        match slice.iter().position(|&b| b == b' ') {
            Some(pos) => {
                let method = HttpMethod::from_bytes(&slice[..pos]);
                self.buf_start += pos + 1;
                if method == HttpMethod::Unknown {
                    self.reject(Response::malformed_request());
                    return Err(());
                }
                self.method = Some(method);
                self.state = ConnState::MethodParsed;
                Ok(Step::Progress)
            }
            None => {
                if self.buffer_exhausted() {
                    self.reject(Response::malformed_request());
                    return Err(());
                }
                Ok(Step::Pending)
            }
        }
    }

    fn try_parse_url(&mut self) -> Result<Step, ()> {
        let slice = &self.buf[self.buf_start..self.buf_end];
        match slice.iter().position(|&b| b == b' ') {
            Some(pos) => {
                if pos >= MAX_URL_LENGTH {
                    self.reject(Response::uri_too_long());
                    return Err(());
                }
                let raw_target = match std::str::from_utf8(&slice[..pos]) {
                    Ok(s) => s.to_string(),
                    Err(_) => {
                        self.reject(Response::malformed_request());
                        return Err(());
                    }
                };
                self.buf_start += pos + 1;
                self.raw_target = raw_target;
                self.state = ConnState::UrlParsed;
                Ok(Step::Progress)
            }
            None => {
                if slice.len() >= MAX_URL_LENGTH || self.buffer_exhausted() {
                    self.reject(Response::uri_too_long());
                    return Err(());
                }
                Ok(Step::Pending)
            }
        }
    }

    fn try_parse_protocol(&mut self) -> Result<Step, ()> {
        let slice = &self.buf[self.buf_start..self.buf_end];
        match find_crlf(slice) {
            Some(pos) => {
                let line = &slice[..pos];
                if !line.starts_with(b"HTTP/") {
                    self.reject(Response::malformed_request());
                    return Err(());
                }
                self.protocol = String::from_utf8_lossy(line).into_owned();
                self.buf_start += pos + 2;
                self.state = ConnState::RequestParsed;
                Ok(Step::Progress)
            }
            None => {
                if self.buffer_exhausted() {
                    self.reject(Response::malformed_request());
                    return Err(());
                }
                Ok(Step::Pending)
            }
        }
    }

    /// One call parses (at most) one header line, or — on the blank
    /// line — closes out the header block and enters the body phase.
    /// Rejects a line containing a bare `\r` not immediately followed by
    /// `\n` (spec.md §9: hardening against embedded CR/LF in header
    /// values) and a line with no `:` separator.
    fn try_parse_headers(&mut self) -> Result<Step, ()> {
        let slice = &self.buf[self.buf_start..self.buf_end];
        match find_crlf(slice) {
            Some(pos) => {
                if pos == 0 {
                    self.buf_start += 2;
                    self.state = ConnState::HeadersParsed;
                    self.start_body_phase()?;
                    return Ok(Step::Progress);
                }
                let line = &slice[..pos];
                if line.contains(&b'\r') {
                    self.reject(Response::malformed_request());
                    return Err(());
                }
                let Some(colon) = line.iter().position(|&b| b == b':') else {
                    self.reject(Response::malformed_request());
                    return Err(());
                };
                let name = String::from_utf8_lossy(&line[..colon]).into_owned();
                let mut value_start = colon + 1;
                while value_start < line.len() && line[value_start] == b' ' {
                    value_start += 1;
                }
                let value = String::from_utf8_lossy(&line[value_start..]).into_owned();
                self.headers.set(name, value);
                self.buf_start += pos + 2;
                Ok(Step::Progress)
            }
            None => {
                if self.buffer_exhausted() {
                    self.reject(Response::malformed_request());
                    return Err(());
                }
                Ok(Step::Pending)
            }
        }
    }

    /// Decides the body sink once headers are complete: `PUT`/`POST`
    /// without `Content-Length` is `411 Length Required` (spec.md §4.2);
    /// anything past `TEMP_FILE_THRESHOLD` spills to a temp file.
    fn start_body_phase(&mut self) -> Result<(), ()> {
        let method = self.method.expect("method parsed before headers");
        let declared_len = self
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok());

        self.body_bytes_to_receive = if method.has_request_body() {
            match declared_len {
                Some(len) => len,
                None => {
                    self.reject(Response::length_required());
                    return Err(());
                }
            }
        } else {
            0
        };

        self.body = if self.body_bytes_to_receive > TEMP_FILE_THRESHOLD {
            self.recv_chunk_size = adaptive_recv_chunk_size(self.body_bytes_to_receive as u64);
            match RequestBody::init_temp_file() {
                Ok(b) => b,
                Err(_) => {
                    self.reject(Response::bad_request());
                    return Err(());
                }
            }
        } else {
            RequestBody::init_string(self.body_bytes_to_receive)
        };

        if self.body_bytes_to_receive == 0 {
            self.mark_request_received();
        }
        Ok(())
    }

    fn try_receive_body(&mut self) -> Result<Step, ()> {
        let remaining = self.body_bytes_to_receive - self.body_bytes_received;
        if remaining == 0 {
            self.mark_request_received();
            return Ok(Step::Progress);
        }
        let available = self.buf_end - self.buf_start;
        if available == 0 {
            return Ok(Step::Pending);
        }
        let take = available.min(remaining);
        let chunk_start = self.buf_start;
        let chunk_end = chunk_start + take;
        if self.body.append(&self.buf[chunk_start..chunk_end]).is_err() {
            self.reject(Response::bad_request());
            return Err(());
        }
        self.buf_start += take;
        self.body_bytes_received += take;
        if self.body_bytes_received == self.body_bytes_to_receive {
            self.mark_request_received();
        }
        Ok(Step::Progress)
    }

    fn mark_request_received(&mut self) {
        self.state = ConnState::RequestReceived;
        self.t_request_received = Some(Instant::now());
    }

    /// Drives the read-side state machine as far as currently-buffered
    /// bytes allow.
    pub fn advance_read(&mut self) -> ReadOutcome {
        loop {
            let step = match self.state {
                ConnState::ClientConnected => self.try_parse_method(),
                ConnState::MethodParsed => self.try_parse_url(),
                ConnState::UrlParsed => self.try_parse_protocol(),
                ConnState::RequestParsed => self.try_parse_headers(),
                ConnState::HeadersParsed => self.try_receive_body(),
                ConnState::RequestReceived
                | ConnState::WritingResponseHeader
                | ConnState::WritingResponseBody => return ReadOutcome::Ready,
            };
            match step {
                Ok(Step::Progress) => continue,
                Ok(Step::Pending) => return ReadOutcome::NeedMoreData,
                Err(()) => return ReadOutcome::Ready,
            }
        }
    }

    /// Takes the parsed request for dispatch. Returns `None` when
    /// `advance_read` already queued a canonical error response instead of
    /// reaching `RequestReceived` with a usable request.
    pub fn take_request(&mut self) -> Option<Request> {
        if self.response.is_some() {
            return None;
        }
        let method = self.method?;
        let mut req = Request::new(method);
        req.parse_query_params(&self.raw_target);
        req.path = percent_decode(&req.path).unwrap_or_else(|_| req.path.clone());
        req.protocol = std::mem::take(&mut self.protocol);
        req.headers = std::mem::take(&mut self.headers);
        req.body = std::mem::replace(&mut self.body, RequestBody::None);
        Some(req)
    }

    /// Best-effort request identity for access logging: whatever the parser
    /// captured before failing, or the full parsed values on success. Reads
    /// without consuming, unlike `take_request`.
    pub fn log_identity(&self) -> (HttpMethod, &str, &str) {
        (self.method.unwrap_or(HttpMethod::Unknown), self.raw_target.as_str(), self.protocol.as_str())
    }

    pub fn response_status(&self) -> Option<crate::protocol::HttpStatus> {
        self.response.as_ref().map(|r| r.status)
    }

    // ---- write side ------------------------------------------------------

    /// Queues `response` for writing: serializes its header block
    /// immediately and sizes the body-streaming chunk against its declared
    /// length (spec.md §4.3, §4.6).
    pub fn set_response(&mut self, response: Response) {
        let content_length = response.content_length().unwrap_or(0);
        self.send_chunk_size = adaptive_chunk_size(content_length);
        self.write_buf = response.serialize_headers();
        self.write_buf_start = 0;
        self.write_source = WriteSource::Header;
        self.response = Some(response);
        self.state = ConnState::WritingResponseHeader;
        self.t_response_set = Some(Instant::now());
    }

    /// The next slice the event loop should attempt to write.
    pub fn pending_write(&self) -> &[u8] {
        &self.write_buf[self.write_buf_start..]
    }

    /// Acknowledges `n` bytes actually written by the socket. Refills from
    /// the response body once the current chunk (header or body) is fully
    /// drained, advancing `WritingResponseHeader -> WritingResponseBody` on
    /// the first refill.
    pub fn mark_written(&mut self, n: usize) -> std::io::Result<Advance> {
        self.last_active = Instant::now();
        self.bytes_out += n as u64;
        self.write_buf_start += n;
        if self.write_buf_start < self.write_buf.len() {
            return Ok(Advance::Continue);
        }
        self.refill_write_buf()
    }

    fn refill_write_buf(&mut self) -> std::io::Result<Advance> {
        if matches!(self.write_source, WriteSource::Header) {
            self.state = ConnState::WritingResponseBody;
            self.write_source = WriteSource::Body;
        }

        let Some(response) = self.response.as_mut() else {
            self.write_source = WriteSource::Done;
            return Ok(Advance::Done);
        };

        let chunk = match &mut response.body {
            ResponseBody::String(buf) => {
                let start = self.write_body_cursor as usize;
                if start >= buf.len() {
                    Vec::new()
                } else {
                    let end = (start + self.send_chunk_size).min(buf.len());
                    self.write_body_cursor = end as u64;
                    buf[start..end].to_vec()
                }
            }
            ResponseBody::File(file) => {
                file.seek(SeekFrom::Start(self.write_body_cursor))?;
                let mut scratch = vec![0u8; self.send_chunk_size];
                let n = file.read(&mut scratch)?;
                scratch.truncate(n);
                self.write_body_cursor += n as u64;
                scratch
            }
            ResponseBody::Empty => Vec::new(),
        };

        if chunk.is_empty() {
            self.write_source = WriteSource::Done;
            self.t_response_sent = Some(Instant::now());
            return Ok(Advance::Done);
        }
        self.write_buf = chunk;
        self.write_buf_start = 0;
        Ok(Advance::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HttpStatus;

    #[test]
    fn simple_get_parses_in_one_feed() {
        let mut conn = Connection::new(3, "127.0.0.1:0".parse().unwrap());
        conn.feed(b"GET /v1/api/test HTTP/1.0\r\nHost: x\r\n\r\n");
        assert!(matches!(conn.advance_read(), ReadOutcome::Ready));
        let req = conn.take_request().expect("valid request");
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "/v1/api/test");
        assert_eq!(req.headers.get("Host"), Some("x"));
    }

    #[test]
    fn request_split_across_multiple_feeds_needs_more_data_between() {
        let mut conn = Connection::new(3, "127.0.0.1:0".parse().unwrap());
        conn.feed(b"GET /v1");
        assert!(matches!(conn.advance_read(), ReadOutcome::NeedMoreData));
        conn.feed(b"/api/test HTTP/1.0\r\nHost: x\r\n\r\n");
        assert!(matches!(conn.advance_read(), ReadOutcome::Ready));
        let req = conn.take_request().expect("valid request");
        assert_eq!(req.path, "/v1/api/test");
    }

    #[test]
    fn unknown_method_is_rejected_with_malformed_request() {
        let mut conn = Connection::new(3, "127.0.0.1:0".parse().unwrap());
        conn.feed(b"FROB /x HTTP/1.0\r\n\r\n");
        assert!(matches!(conn.advance_read(), ReadOutcome::Ready));
        assert!(conn.take_request().is_none());
        assert_eq!(conn.state, ConnState::WritingResponseHeader);
    }

    #[test]
    fn post_without_content_length_is_length_required() {
        let mut conn = Connection::new(3, "127.0.0.1:0".parse().unwrap());
        conn.feed(b"POST /x HTTP/1.0\r\n\r\n");
        assert!(matches!(conn.advance_read(), ReadOutcome::Ready));
        assert!(conn.take_request().is_none());
        let resp = conn.response.as_ref().unwrap();
        assert_eq!(resp.status, HttpStatus::LengthRequired);
    }

    #[test]
    fn embedded_bare_cr_in_header_value_is_malformed() {
        let mut conn = Connection::new(3, "127.0.0.1:0".parse().unwrap());
        conn.feed(b"GET /x HTTP/1.0\r\nX-Evil: a\rb\r\n\r\n");
        assert!(matches!(conn.advance_read(), ReadOutcome::Ready));
        assert!(conn.take_request().is_none());
        let resp = conn.response.as_ref().unwrap();
        assert_eq!(resp.status, HttpStatus::BadRequest);
    }

    #[test]
    fn post_with_body_waits_for_full_content_length() {
        let mut conn = Connection::new(3, "127.0.0.1:0".parse().unwrap());
        conn.feed(b"POST /x HTTP/1.0\r\nContent-Length: 5\r\n\r\nhel");
        assert!(matches!(conn.advance_read(), ReadOutcome::NeedMoreData));
        conn.feed(b"lo");
        assert!(matches!(conn.advance_read(), ReadOutcome::Ready));
        let mut req = conn.take_request().expect("valid request");
        assert_eq!(req.body.read_to_vec().unwrap(), b"hello");
    }

    #[test]
    fn response_streams_to_completion_across_mark_written_calls() {
        let mut conn = Connection::new(3, "127.0.0.1:0".parse().unwrap());
        conn.set_response(Response::from_string(HttpStatus::Ok, "hi"));
        assert_eq!(conn.state, ConnState::WritingResponseHeader);
        let header_len = conn.pending_write().len();
        assert!(matches!(conn.mark_written(header_len).unwrap(), Advance::Continue));
        assert_eq!(conn.state, ConnState::WritingResponseBody);
        assert_eq!(conn.pending_write(), b"hi");
        assert!(matches!(conn.mark_written(2).unwrap(), Advance::Done));
        assert!(!conn.needs_write_readiness());
    }
}
