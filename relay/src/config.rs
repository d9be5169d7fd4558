//! Relay configuration, assembled once from CLI arguments and validated up front so the
//! event loop never has to re-check a bound.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::peer_table::MAX_PEERS;

const MIN_TIMEOUT: u64 = 1;
const MAX_TIMEOUT: u64 = 3600;
const MIN_CLIENTS: usize = 2;

#[derive(Debug, Clone)]
pub struct Configuration {
    pub bind_addr: SocketAddrV4,
    pub hostname: String,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub max_clients: usize,
    pub link: Option<SocketAddrV4>,
}

impl Configuration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ip: Ipv4Addr,
        port: u16,
        hostname: String,
        password: Option<String>,
        timeout_secs: u64,
        max_clients: usize,
        link: Option<SocketAddrV4>,
    ) -> Configuration {
        Configuration {
            bind_addr: SocketAddrV4::new(ip, port),
            hostname,
            password,
            timeout_secs: timeout_secs.clamp(MIN_TIMEOUT, MAX_TIMEOUT),
            max_clients: max_clients.clamp(MIN_CLIENTS, MAX_PEERS),
            link,
        }
    }

    pub fn requires_password(&self) -> bool {
        matches!(&self.password, Some(p) if !p.is_empty())
    }
}
