//! Tunnel device configuration
//!
//! What the host is asked for when opening the virtual interface: local
//! address, captured routes, DNS server and the application allow-list. The
//! host-side mechanism that actually creates the device is opaque to this
//! crate (see `tunnel::TunnelProvider`).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A route captured into the tunnel, in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Route {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// The default route, capturing all traffic
    pub fn default_route() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, 0)
    }
}

/// Configuration handed to the host when establishing the tunnel device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Session name shown by the host
    pub session: String,
    /// Local address assigned to the tunnel interface
    pub local_addr: Ipv4Addr,
    /// Prefix length for the local address
    pub prefix_len: u8,
    /// Routes captured into the tunnel
    pub routes: Vec<Route>,
    /// DNS server advertised to the captured applications
    pub dns: Ipv4Addr,
    /// Applications whose traffic is routed into the tunnel; empty means all
    pub allowed_apps: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            session: "tunrelay".to_string(),
            local_addr: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 32,
            routes: vec![Route::default_route()],
            dns: Ipv4Addr::new(8, 8, 8, 8),
            allowed_apps: Vec::new(),
        }
    }
}

impl TunnelConfig {
    /// Same configuration pointed at a different DNS server
    pub fn with_dns(&self, dns: Ipv4Addr) -> Self {
        Self {
            dns,
            ..self.clone()
        }
    }
}
