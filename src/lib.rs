//! An HTTP/1.0 server core built around a single-threaded, readiness-driven
//! event loop (spec.md §1).
pub mod config;
pub mod conn;
pub mod error;
pub mod headers;
pub mod logging;
pub mod protocol;
pub mod request;
pub mod response;
pub mod route;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod time;
pub mod worker;

pub use error::{CoreError, CoreResult};
pub use protocol::{HttpMethod, HttpStatus};
pub use request::Request;
pub use response::Response;
pub use route::{Handler, RouteTrie};
pub use server::Server;
