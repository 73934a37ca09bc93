//! Parsed request state: method, path, query params, headers, and the body
//! sink (spec.md §3, §4.2).
use crate::headers::HeaderMap;
use crate::protocol::HttpMethod;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique path under the process temp directory. No two connections ever
/// race on the same name even though the loop is single-threaded and the
/// counter never needs to be atomic for correctness — it's `Atomic` only so
/// the type stays `Sync` if the core is ever embedded in a threaded host.
fn unique_temp_path() -> PathBuf {
    let n = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("httpcore-{}-{}.tmp", std::process::id(), n))
}

/// Tagged body sink: small bodies live in memory, large ones spill to a
/// unique temp file so peak memory does not scale with body size
/// (spec.md §3, §9).
pub enum RequestBody {
    String { buf: Vec<u8>, cursor: usize },
    File { file: File, path: PathBuf },
    None,
}

impl RequestBody {
    /// Allocates a zero-initialized buffer of the declared body length.
    pub fn init_string(len: usize) -> Self {
        RequestBody::String { buf: vec![0u8; len], cursor: 0 }
    }

    /// Opens a new, unique temporary file in read+write mode.
    pub fn init_temp_file() -> io::Result<Self> {
        let path = unique_temp_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(RequestBody::File { file, path })
    }

    /// Writes `bytes` into the sink, advancing the internal cursor. For the
    /// `String` sink, writes past the declared length are silently clamped —
    /// callers clamp reads to `body_bytes_to_receive - body_bytes_received`
    /// themselves (spec.md §9), so this is a second line of defense.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            RequestBody::String { buf, cursor } => {
                let end = (*cursor + bytes.len()).min(buf.len());
                let n = end.saturating_sub(*cursor);
                buf[*cursor..end].copy_from_slice(&bytes[..n]);
                *cursor = end;
                Ok(())
            }
            RequestBody::File { file, .. } => file.write_all(bytes),
            RequestBody::None => Ok(()),
        }
    }

    /// Copies any buffered bytes into a new temp file and releases the
    /// string buffer. Reserved for bodies that overgrow their declared
    /// `Content-Length` expectation (spec.md §4.2).
    pub fn promote_to_temp_file(&mut self) -> io::Result<()> {
        if let RequestBody::String { buf, cursor } = self {
            let mut promoted = RequestBody::init_temp_file()?;
            promoted.append(&buf[..*cursor])?;
            *self = promoted;
        }
        Ok(())
    }

    /// Reads the full body into memory regardless of sink, for handlers
    /// that want the bytes directly (e.g. an echo handler).
    pub fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        match self {
            RequestBody::String { buf, .. } => Ok(buf.clone()),
            RequestBody::File { file, .. } => {
                file.seek(SeekFrom::Start(0))?;
                let mut out = Vec::new();
                file.read_to_end(&mut out)?;
                Ok(out)
            }
            RequestBody::None => Ok(Vec::new()),
        }
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        if let RequestBody::File { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

pub struct Request {
    pub method: HttpMethod,
    pub path: String,
    pub params: Option<HashMap<String, String>>,
    pub headers: HeaderMap,
    pub protocol: String,
    pub body: RequestBody,
}

impl Request {
    pub fn new(method: HttpMethod) -> Self {
        Self {
            method,
            path: String::new(),
            params: None,
            headers: HeaderMap::new(),
            protocol: String::new(),
            body: RequestBody::None,
        }
    }

    /// Splits the raw request target at the first `?`; the tail is split on
    /// `&`, each element on the first `=`. Entries with no `=` are discarded.
    /// `params` is left absent when no `?` is present. No decoding is
    /// performed here (spec.md §4.2).
    pub fn parse_query_params(&mut self, raw_target: &str) {
        match raw_target.find('?') {
            Some(idx) => {
                self.path = raw_target[..idx].to_string();
                let mut params = HashMap::new();
                for pair in raw_target[idx + 1..].split('&') {
                    if let Some(eq) = pair.find('=') {
                        let (k, v) = pair.split_at(eq);
                        params.insert(k.to_string(), v[1..].to_string());
                    }
                }
                self.params = Some(params);
            }
            None => {
                self.path = raw_target.to_string();
                self.params = None;
            }
        }
    }
}

/// Stray `%` not followed by two hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError;

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decodes `%HH` escapes over `input`; unreserved characters pass through
/// unchanged (spec.md §4.1).
pub fn percent_decode(input: &str) -> Result<String, DecodeError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return Err(DecodeError);
            }
            let hi = hex_val(bytes[i + 1]).ok_or(DecodeError)?;
            let lo = hex_val(bytes[i + 2]).ok_or(DecodeError)?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| DecodeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_split_on_first_question_mark_and_ampersand() {
        let mut req = Request::new(HttpMethod::Get);
        req.parse_query_params("/v1/api/test?a=1&b=2&noeq&c=3");
        assert_eq!(req.path, "/v1/api/test");
        let params = req.params.unwrap();
        assert_eq!(params.get("a"), Some(&"1".to_string()));
        assert_eq!(params.get("b"), Some(&"2".to_string()));
        assert_eq!(params.get("c"), Some(&"3".to_string()));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn no_question_mark_leaves_params_absent() {
        let mut req = Request::new(HttpMethod::Get);
        req.parse_query_params("/v1/api/test");
        assert_eq!(req.path, "/v1/api/test");
        assert!(req.params.is_none());
    }

    #[test]
    fn percent_decode_round_trips_unreserved_and_escapes() {
        assert_eq!(percent_decode("hello%20world").unwrap(), "hello world");
        assert_eq!(percent_decode("a-b_c.d~e").unwrap(), "a-b_c.d~e");
    }

    #[test]
    fn percent_decode_rejects_truncated_escape() {
        assert!(percent_decode("abc%2").is_err());
        assert!(percent_decode("abc%").is_err());
        assert!(percent_decode("abc%zz").is_err());
    }

    #[test]
    fn string_body_append_clamps_to_declared_length() {
        let mut body = RequestBody::init_string(4);
        body.append(b"abcdef").unwrap();
        if let RequestBody::String { buf, cursor } = &body {
            assert_eq!(buf.as_slice(), b"abcd");
            assert_eq!(*cursor, 4);
        } else {
            panic!("expected string body");
        }
    }

    #[test]
    fn promote_to_temp_file_preserves_bytes() {
        let mut body = RequestBody::init_string(5);
        body.append(b"hello").unwrap();
        body.promote_to_temp_file().unwrap();
        assert!(matches!(body, RequestBody::File { .. }));
        assert_eq!(body.read_to_vec().unwrap(), b"hello");
    }
}
