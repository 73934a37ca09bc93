//! Server configuration, built with the teacher's `Server::bind().workers()`
//! chained-builder idiom (`server.rs`) collapsed to the single knob this
//! single-threaded core actually takes: the bind address.
use std::net::{IpAddr, Ipv4Addr};

pub struct Config {
    host: IpAddr,
    port: u16,
}

impl Config {
    pub fn bind(port: u16) -> Self {
        Self { host: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port }
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn host_str(&self) -> String {
        self.host.to_string()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
