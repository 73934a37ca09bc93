//! Response construction, canonical error bodies, and header serialization
//! (spec.md §3, §4.3).
use crate::headers::HeaderMap;
use crate::protocol::{CONTENT_TYPE_JSON, FILE_CACHE_TTL_SECS, HttpStatus};
use crate::time::format_http_date;
use std::fs::File;
use std::io;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

/// Tagged response body source.
pub enum ResponseBody {
    String(Vec<u8>),
    File(File),
    Empty,
}

pub struct Response {
    pub status: HttpStatus,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

fn server_identifier() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| format!("httpcore/0.1 ({} {})", os_name(), os_release()))
}

#[cfg(unix)]
fn uname_field(get: impl Fn(&libc::utsname) -> *const libc::c_char) -> String {
    unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return String::new();
        }
        std::ffi::CStr::from_ptr(get(&uts))
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(unix)]
fn os_name() -> String {
    uname_field(|u| u.sysname.as_ptr())
}

#[cfg(unix)]
fn os_release() -> String {
    uname_field(|u| u.release.as_ptr())
}

#[cfg(not(unix))]
fn os_name() -> String {
    std::env::consts::OS.to_string()
}

#[cfg(not(unix))]
fn os_release() -> String {
    String::new()
}

impl Response {
    /// Builds the headers every response carries regardless of body source:
    /// `Date`, `Server`, `Connection: close` (spec.md §4.3).
    fn base(status: HttpStatus) -> Self {
        let mut headers = HeaderMap::new();
        headers.set("Date", format_http_date(SystemTime::now()));
        headers.set("Server", server_identifier());
        headers.set("Connection", "close");
        Self { status, headers, body: ResponseBody::Empty }
    }

    /// Clones `body` into owned memory; sets `Content-Length` to its byte length.
    pub fn from_string(status: HttpStatus, body: impl Into<Vec<u8>>) -> Self {
        let mut resp = Self::base(status);
        let body = body.into();
        resp.headers.set("Content-Length", body.len().to_string());
        resp.body = ResponseBody::String(body);
        resp
    }

    /// Takes ownership of `file`; fstats it to derive `Content-Length` and
    /// `Last-Modified`, and sets `Cache-Control`/`Expires` (spec.md §4.3).
    pub fn from_file(status: HttpStatus, file: File) -> io::Result<Self> {
        let mut resp = Self::base(status);
        let meta = file.metadata()?;
        resp.headers.set("Content-Length", meta.len().to_string());
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        resp.headers.set("Last-Modified", format_http_date(modified));
        #[cfg(not(feature = "disable-file-auto-cache"))]
        {
            let expires = SystemTime::now() + Duration::from_secs(FILE_CACHE_TTL_SECS);
            resp.headers.set("Expires", format_http_date(expires));
            resp.headers
                .set("Cache-Control", format!("max-age={}", FILE_CACHE_TTL_SECS));
        }
        resp.body = ResponseBody::File(file);
        Ok(resp)
    }

    /// `Content-Length: 0`, no body.
    pub fn empty(status: HttpStatus) -> Self {
        let mut resp = Self::base(status);
        resp.headers.set("Content-Length", "0");
        resp.body = ResponseBody::Empty;
        resp
    }

    fn json_error(status: HttpStatus, message: &str) -> Self {
        let body = format!("{{\"message\":\"{}\",\"code\":{}}}", message, status.code());
        let mut resp = Self::from_string(status, body);
        resp.headers.set("Content-Type", CONTENT_TYPE_JSON);
        resp
    }

    pub fn malformed_request() -> Self {
        Self::json_error(
            HttpStatus::BadRequest,
            "The client has issued a malformed or illegal request, and the server was unable to process it",
        )
    }

    pub fn bad_request() -> Self {
        Self::json_error(HttpStatus::BadRequest, "The server was unable to process the request")
    }

    pub fn not_found() -> Self {
        Self::json_error(HttpStatus::NotFound, "The requested resource was not found")
    }

    pub fn method_not_allowed() -> Self {
        Self::json_error(
            HttpStatus::MethodNotAllowed,
            "The request method is inappropriate for the requested resource",
        )
    }

    pub fn length_required() -> Self {
        Self::json_error(HttpStatus::LengthRequired, "The Content-Length header is required")
    }

    pub fn uri_too_long() -> Self {
        Self::json_error(HttpStatus::UriTooLong, "The requested URI is too long")
    }

    pub fn not_modified() -> Self {
        Self::empty(HttpStatus::NotModified)
    }

    /// When the response is file-backed and its `Last-Modified` is at or
    /// before `since`, replaces it with `not_modified()` — the conditional-GET
    /// short-circuit (spec.md §4.3).
    #[cfg(not(feature = "disable-handle-if-modified-since"))]
    pub fn try_optimize_if_not_modified_since(self, since: SystemTime) -> Self {
        let Some(last_modified) = self.headers.get("Last-Modified").and_then(crate::time::parse_http_date) else {
            return self;
        };
        if matches!(self.body, ResponseBody::File(_)) && last_modified <= since {
            Self::not_modified()
        } else {
            self
        }
    }

    #[cfg(feature = "disable-handle-if-modified-since")]
    pub fn try_optimize_if_not_modified_since(self, _since: SystemTime) -> Self {
        self
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length").and_then(|v| v.parse().ok())
    }

    /// Serializes the status line and header block:
    /// `HTTP/1.0 <code> <reason>\r\n<hdr1>\r\n...\r\n\r\n`.
    pub fn serialize_headers(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(
            format!("HTTP/1.0 {} {}\r\n", self.status.code(), self.status.reason_phrase()).as_bytes(),
        );
        for (k, v) in self.headers.iter() {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string_sets_content_length_to_byte_length() {
        let resp = Response::from_string(HttpStatus::Ok, "{\"r\":1}");
        assert_eq!(resp.content_length(), Some(7));
    }

    #[test]
    fn every_response_carries_connection_close() {
        let resp = Response::empty(HttpStatus::NoContent);
        assert_eq!(resp.headers.get("Connection"), Some("close"));
        assert!(resp.headers.get("Date").is_some());
        assert!(resp.headers.get("Server").is_some());
    }

    #[test]
    fn canonical_errors_have_exact_json_body() {
        let resp = Response::not_found();
        if let ResponseBody::String(b) = &resp.body {
            assert_eq!(
                std::str::from_utf8(b).unwrap(),
                r#"{"message":"The requested resource was not found","code":404}"#
            );
        } else {
            panic!("expected string body");
        }
    }

    #[test]
    fn method_not_allowed_body_matches_spec() {
        let resp = Response::method_not_allowed();
        if let ResponseBody::String(b) = &resp.body {
            assert_eq!(
                std::str::from_utf8(b).unwrap(),
                r#"{"message":"The request method is inappropriate for the requested resource","code":405}"#
            );
        } else {
            panic!("expected string body");
        }
    }

    #[test]
    fn serialize_headers_produces_status_line_and_blank_terminator() {
        let resp = Response::empty(HttpStatus::NoContent);
        let bytes = resp.serialize_headers();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.0 204 No Content\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn not_modified_has_empty_body() {
        let resp = Response::not_modified();
        assert_eq!(resp.status.code(), 304);
        assert!(matches!(resp.body, ResponseBody::Empty));
    }
}
