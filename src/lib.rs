//! tunrelay — user-space transparent TCP relay over a virtual tunnel interface
//!
//! Owns one end of a tunnel-style network interface, decodes the raw IP
//! packets the OS routes into it, relays the TCP byte streams to their real
//! destinations over ordinary sockets, and injects synthesized reply packets
//! back so the original client sees a normal TCP conversation.
//!
//! Architecture:
//! - packet.rs: IPv4/TCP header parsing and reply synthesis
//! - queue.rs: bounded FIFO of pending forward tasks
//! - pool.rs: reusable outbound socket cache with idle eviction
//! - engine.rs: capture loop, worker pool, per-flow response relay
//! - config.rs: tunnel device configuration
//! - tunnel.rs: device traits and lifecycle management (establish, DNS
//!   rotation, shutdown)
//!
//! TCP only by design: UDP and ICMP are skipped, TLS payloads pass through
//! opaque, and reliability on the outbound leg is the upstream socket's job.

pub mod config;
pub mod engine;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod tunnel;

pub use config::TunnelConfig;
pub use engine::ForwardingEngine;
pub use packet::{decode_outbound, encode_reply, DecodeError, ParsedTcp};
pub use pool::{ConnectionPool, FlowKey, PooledStream};
pub use queue::{ForwardTask, TaskQueue};
pub use tunnel::{
    channel_device, ChannelDevice, ChannelHost, TunnelDevice, TunnelManager, TunnelProvider,
    TunnelStatus,
};

/// Relay-level errors
///
/// Per-packet and per-connection failures stay contained to their flow; only
/// `TunnelEstablishFailure` is escalated to the externally visible status.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Destination unreachable; the task is dropped, never retried
    #[error("connect to {dest} failed: {source}")]
    ConnectFailure {
        dest: pool::FlowKey,
        source: std::io::Error,
    },

    /// Socket write failed mid-flow; the connection is destroyed
    #[error("write failed: {0}")]
    WriteFailure(std::io::Error),

    /// Host denied or failed to create the tunnel interface
    #[error("tunnel establish failed: {0}")]
    TunnelEstablishFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
