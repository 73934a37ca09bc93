//! Structured access-log and connect records, emitted through a `Logger`
//! trait rather than bare `println!` (spec.md §4.7). The teacher's worker
//! loop prints ad hoc `"Worker {id} ..."` lines directly; we generalize that
//! one step to a pluggable sink so a host embedding this core can redirect
//! or structure the output without touching the event loop.
use crate::protocol::{HttpMethod, HttpStatus};
use std::net::SocketAddr;
use std::time::Duration;

/// One served request, timed across the three phases the connection state
/// machine distinguishes: receiving the request, producing a response, and
/// writing it back out.
pub struct AccessLogRecord {
    pub peer: SocketAddr,
    pub method: HttpMethod,
    pub path: String,
    pub protocol: String,
    pub status: HttpStatus,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub receive_duration: Duration,
    pub handle_duration: Duration,
    pub send_duration: Duration,
}

impl AccessLogRecord {
    fn mbps(bytes: u64, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }
        (bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0
    }

    pub fn receive_mbps(&self) -> f64 {
        Self::mbps(self.bytes_in, self.receive_duration)
    }

    pub fn send_mbps(&self) -> f64 {
        Self::mbps(self.bytes_out, self.send_duration)
    }
}

/// A new accepted connection, logged separately from the request(s) it
/// eventually carries — gated behind the `log-connects` feature since most
/// deployments only want the access log (spec.md §6 compile-time knobs).
pub struct ConnectRecord {
    pub peer: SocketAddr,
}

pub trait Logger: Send + Sync {
    fn access(&self, record: &AccessLogRecord);
    fn connect(&self, _record: &ConnectRecord) {}
}

/// Writes one line per record to stderr, in the `original_source` server's
/// spirit of logging straight to the console rather than a file or socket.
pub struct StderrLogger;

impl Logger for StderrLogger {
    #[cfg(not(feature = "skip-log-requests"))]
    fn access(&self, record: &AccessLogRecord) {
        eprintln!(
            "{} {} {} {} -> {} | in={}B out={}B | recv={:.1}Mb/s send={:.1}Mb/s",
            record.peer,
            record.method.as_str(),
            record.path,
            record.protocol,
            record.status.code(),
            record.bytes_in,
            record.bytes_out,
            record.receive_mbps(),
            record.send_mbps(),
        );
    }

    #[cfg(feature = "skip-log-requests")]
    fn access(&self, _record: &AccessLogRecord) {}

    #[cfg(feature = "log-connects")]
    fn connect(&self, record: &ConnectRecord) {
        eprintln!("connect {}", record.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mbps_is_zero_for_zero_duration() {
        let record = AccessLogRecord {
            peer: "127.0.0.1:0".parse().unwrap(),
            method: HttpMethod::Get,
            path: "/x".into(),
            protocol: "HTTP/1.0".into(),
            status: HttpStatus::Ok,
            bytes_in: 0,
            bytes_out: 100,
            receive_duration: Duration::ZERO,
            handle_duration: Duration::ZERO,
            send_duration: Duration::ZERO,
        };
        assert_eq!(record.send_mbps(), 0.0);
    }

    #[test]
    fn mbps_computes_from_bytes_over_seconds() {
        let record = AccessLogRecord {
            peer: "127.0.0.1:0".parse().unwrap(),
            method: HttpMethod::Get,
            path: "/x".into(),
            protocol: "HTTP/1.0".into(),
            status: HttpStatus::Ok,
            bytes_in: 0,
            bytes_out: 1_000_000,
            receive_duration: Duration::ZERO,
            handle_duration: Duration::ZERO,
            send_duration: Duration::from_secs(1),
        };
        assert!((record.send_mbps() - 8.0).abs() < 0.001);
    }
}
