//! Top-level server builder and launch entry point (spec.md §4.6, §6).
//! Grounded on the teacher's `Server::bind().workers().serve()` chained
//! builder, collapsed to the single worker this core actually runs (spec.md
//! is explicitly single-threaded — the teacher's `core_affinity`/
//! `SO_REUSEPORT`/per-worker-thread machinery has no counterpart here, see
//! DESIGN.md) and generalized from the teacher's `Router` to `RouteTrie`.
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::logging::{Logger, StderrLogger};
use crate::protocol::HttpMethod;
use crate::route::{Handler, RouteTrie};
use crate::syscalls;
use crate::worker::EventLoop;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Server {
    config: Config,
    routes: RouteTrie,
    logger: Arc<dyn Logger>,
}

impl Server {
    /// Starts building a server bound to `port` on all interfaces — the
    /// `server <port>` CLI contract (spec.md §6).
    pub fn bind(port: u16) -> Self {
        Self {
            config: Config::bind(port),
            routes: RouteTrie::new(),
            logger: Arc::new(StderrLogger),
        }
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.config = self.config.host(host);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Registers `handler` at `(method, path)` (spec.md §4.4). Chains like
    /// the teacher's `router.get(...)`/`router.post(...)` calls.
    pub fn route(mut self, method: HttpMethod, path: &str, handler: Handler) -> Self {
        self.routes.register(method, path, handler);
        self
    }

    /// Binds the listener, installs signal handlers, and runs the event
    /// loop until `SIGINT` (spec.md §4.6). The route trie is populated
    /// before this point and is never mutated again — registration has no
    /// effect once `launch` has consumed `self` (spec.md §5's read-only
    /// trie contract enforced by ownership rather than a runtime guard).
    pub fn launch(self) -> CoreResult<()> {
        let listen_fd = syscalls::create_listen_socket(&self.config.host_str(), self.config.port())?;
        install_signal_handlers()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let signal_flag = shutdown.clone();
        ctrlc::set_handler(move || {
            signal_flag.store(true, Ordering::Release);
        })
        .map_err(|e| CoreError::Other(format!("failed to install SIGINT handler: {}", e)))?;

        let mut event_loop = EventLoop::new(listen_fd, self.routes, self.logger)?;
        event_loop.run(shutdown)
    }
}

/// Ignores `SIGPIPE` so a write to a half-closed socket surfaces as an
/// `EPIPE` return from `write()` rather than killing the process (spec.md
/// §4.6: "the server relies on write error returns, not signals").
fn install_signal_handlers() -> CoreResult<()> {
    unsafe {
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_defaults_to_unspecified_host() {
        let server = Server::bind(0);
        assert_eq!(server.config.host_str(), "0.0.0.0");
        assert_eq!(server.config.port(), 0);
    }

    #[test]
    fn host_overrides_default() {
        let server = Server::bind(0).host(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        assert_eq!(server.config.host_str(), "127.0.0.1");
    }
}
