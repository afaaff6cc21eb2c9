//! Tunnel device abstraction and lifecycle management
//!
//! `TunnelDevice` is the raw packet interface the engine reads from and
//! writes to; `TunnelProvider` is whatever host mechanism creates one from a
//! `TunnelConfig`. `TunnelManager` sits on top and owns the full lifecycle:
//! establish a device, run a `ForwardingEngine` over it, rotate to another
//! DNS server by rebuilding the whole stack, and tear everything down on
//! shutdown.
//!
//! `ChannelDevice` is an in-process device backed by channels, used by the
//! test bench and integration tests in place of a real interface.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::config::TunnelConfig;
use crate::engine::ForwardingEngine;
use crate::pool::ConnectionPool;
use crate::{RelayError, RelayResult};

/// A raw packet device: one end of the virtual tunnel interface.
///
/// `read_packet` blocks until a packet the OS routed into the tunnel is
/// available (implementations should return an error rather than block
/// forever once `close` has been called). All methods take `&self`; the
/// capture loop and response handlers use the device concurrently.
pub trait TunnelDevice: Send + Sync {
    /// Read one outbound packet into `buf`, returning its length
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Inject one packet toward the OS side of the tunnel
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// Tear the device down; pending and future reads fail after this
    fn close(&self);
}

/// Creates tunnel devices on behalf of the host platform
pub trait TunnelProvider: Send {
    fn open(&self, config: &TunnelConfig) -> RelayResult<Arc<dyn TunnelDevice>>;
}

/// Externally visible tunnel state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    /// No tunnel; initial state and the state after `shutdown`
    Down,
    /// Provider open in progress
    Establishing,
    /// Device open and engine running
    Up { dns: Ipv4Addr },
    /// Last establish attempt failed; no engine is running
    Failed(String),
}

impl TunnelStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelStatus::Up { .. })
    }
}

/// Owns the tunnel lifecycle: device, connection pool and forwarding engine.
///
/// At most one device/engine pair exists at a time. `establish` and
/// `rotate_dns` always tear down the previous pair before opening a new one,
/// so sockets bound to the old interface never linger.
pub struct TunnelManager {
    provider: Box<dyn TunnelProvider>,
    config: TunnelConfig,
    pool: Arc<ConnectionPool>,
    engine: Option<ForwardingEngine>,
    dns_index: usize,
    status: TunnelStatus,
}

impl TunnelManager {
    pub fn new(provider: Box<dyn TunnelProvider>, config: TunnelConfig) -> Self {
        Self {
            provider,
            config,
            pool: Arc::new(ConnectionPool::new()),
            engine: None,
            dns_index: 0,
            status: TunnelStatus::Down,
        }
    }

    /// Open a tunnel device pointed at `dns` and start forwarding over it.
    ///
    /// Any previously running engine is stopped first, which force-closes its
    /// pooled and in-flight sockets and its device. On provider failure the
    /// engine is not started and the failure is reflected in `status`.
    pub fn establish(&mut self, dns: Ipv4Addr) -> RelayResult<()> {
        self.teardown();
        self.status = TunnelStatus::Establishing;
        log::info!("establishing tunnel (dns {})", dns);

        let config = self.config.with_dns(dns);
        let device = match self.provider.open(&config) {
            Ok(device) => device,
            Err(e) => {
                log::warn!("tunnel establish failed: {}", e);
                self.status = TunnelStatus::Failed(e.to_string());
                return Err(e);
            }
        };

        let mut engine =
            ForwardingEngine::new(device, Arc::clone(&self.pool), config.local_addr);
        engine.start();
        self.engine = Some(engine);
        self.config = config;
        self.status = TunnelStatus::Up { dns };
        log::info!("tunnel up (dns {})", dns);
        Ok(())
    }

    /// Switch to the next DNS server in `candidates`, wrapping around, and
    /// rebuild the tunnel on it. One call, one rebuild.
    pub fn rotate_dns(&mut self, candidates: &[Ipv4Addr]) -> RelayResult<()> {
        if candidates.is_empty() {
            return Err(RelayError::TunnelEstablishFailure(
                "no DNS candidates to rotate to".to_string(),
            ));
        }
        self.dns_index = (self.dns_index + 1) % candidates.len();
        let dns = candidates[self.dns_index];
        log::info!("rotating DNS to {} (candidate {})", dns, self.dns_index);
        self.establish(dns)
    }

    /// Stop the engine, close every socket and the device.
    pub fn shutdown(&mut self) {
        self.teardown();
        self.status = TunnelStatus::Down;
        log::info!("tunnel down");
    }

    fn teardown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
    }

    pub fn status(&self) -> &TunnelStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.engine.as_ref().map_or(false, ForwardingEngine::is_running)
    }

    /// Whether traffic flowed through the tunnel recently. Always false when
    /// no engine is running.
    pub fn liveness(&self) -> bool {
        self.engine.as_ref().map_or(false, ForwardingEngine::liveness)
    }

    /// Number of in-flight client flows
    pub fn active_flows(&self) -> usize {
        self.engine.as_ref().map_or(0, ForwardingEngine::active_flows)
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// How long a blocked `ChannelDevice` read waits before re-checking the
/// closed flag
const CHANNEL_READ_POLL: Duration = Duration::from_millis(50);

/// In-process tunnel device backed by channels.
///
/// The "OS side" is a [`ChannelHost`]: packets it sends show up in
/// `read_packet`, and packets the engine injects via `write_packet` show up
/// in `recv_reply`.
pub struct ChannelDevice {
    outbound: Receiver<Vec<u8>>,
    replies: Sender<Vec<u8>>,
    closed: AtomicBool,
}

/// The OS-facing end of a [`ChannelDevice`]
pub struct ChannelHost {
    outbound: Sender<Vec<u8>>,
    replies: Receiver<Vec<u8>>,
}

/// Build a connected device/host pair
pub fn channel_device(capacity: usize) -> (Arc<ChannelDevice>, ChannelHost) {
    let (out_tx, out_rx) = bounded(capacity);
    let (reply_tx, reply_rx) = bounded(capacity);
    let device = Arc::new(ChannelDevice {
        outbound: out_rx,
        replies: reply_tx,
        closed: AtomicBool::new(false),
    });
    let host = ChannelHost {
        outbound: out_tx,
        replies: reply_rx,
    };
    (device, host)
}

impl TunnelDevice for ChannelDevice {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
            }
            match self.outbound.recv_timeout(CHANNEL_READ_POLL) {
                Ok(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    return Ok(n);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "host gone"));
                }
            }
        }
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        self.replies
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host gone"))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl ChannelHost {
    /// Route one packet into the tunnel, as the OS would
    pub fn send_packet(&self, packet: Vec<u8>) -> bool {
        self.outbound.send(packet).is_ok()
    }

    /// Wait up to `timeout` for an injected reply packet
    pub fn recv_reply(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.replies.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Provider that records every DNS it was asked for and can be told to
    /// fail the next open.
    struct RecordingProvider {
        opened: Arc<Mutex<Vec<Ipv4Addr>>>,
        fail: bool,
    }

    impl TunnelProvider for RecordingProvider {
        fn open(&self, config: &TunnelConfig) -> RelayResult<Arc<dyn TunnelDevice>> {
            if self.fail {
                return Err(RelayError::TunnelEstablishFailure(
                    "permission denied".to_string(),
                ));
            }
            self.opened
                .lock()
                .unwrap()
                .push(config.dns);
            let (device, _host) = channel_device(16);
            Ok(device)
        }
    }

    fn recording_manager(fail: bool) -> (TunnelManager, Arc<Mutex<Vec<Ipv4Addr>>>) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let provider = RecordingProvider {
            opened: Arc::clone(&opened),
            fail,
        };
        (
            TunnelManager::new(Box::new(provider), TunnelConfig::default()),
            opened,
        )
    }

    #[test]
    fn establish_brings_tunnel_up() {
        let (mut mgr, opened) = recording_manager(false);
        assert_eq!(*mgr.status(), TunnelStatus::Down);

        mgr.establish(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert!(mgr.status().is_up());
        assert!(mgr.is_running());
        assert_eq!(mgr.config().dns, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(*opened.lock().unwrap(), vec![Ipv4Addr::new(8, 8, 8, 8)]);

        mgr.shutdown();
        assert_eq!(*mgr.status(), TunnelStatus::Down);
        assert!(!mgr.is_running());
    }

    #[test]
    fn failed_establish_does_not_start_engine() {
        let (mut mgr, _) = recording_manager(true);
        let err = mgr.establish(Ipv4Addr::new(8, 8, 8, 8)).unwrap_err();
        assert!(matches!(err, RelayError::TunnelEstablishFailure(_)));
        assert!(matches!(mgr.status(), TunnelStatus::Failed(_)));
        assert!(!mgr.is_running());
        assert!(!mgr.liveness());
    }

    #[test]
    fn rotate_advances_index_and_rebuilds_once() {
        let (mut mgr, opened) = recording_manager(false);
        let candidates = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)];

        mgr.establish(candidates[0]).unwrap();
        mgr.rotate_dns(&candidates).unwrap();

        // One establish plus exactly one rebuild, on the second candidate
        assert_eq!(
            *opened.lock().unwrap(),
            vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]
        );
        assert_eq!(
            *mgr.status(),
            TunnelStatus::Up {
                dns: Ipv4Addr::new(1, 1, 1, 1)
            }
        );

        // Wraps back to the first candidate
        mgr.rotate_dns(&candidates).unwrap();
        assert_eq!(mgr.config().dns, Ipv4Addr::new(8, 8, 8, 8));
    }

    #[test]
    fn rotate_with_no_candidates_fails() {
        let (mut mgr, _) = recording_manager(false);
        assert!(mgr.rotate_dns(&[]).is_err());
    }

    #[test]
    fn channel_device_round_trip_and_close() {
        let (device, host) = channel_device(4);

        assert!(host.send_packet(vec![1, 2, 3]));
        let mut buf = [0u8; 16];
        assert_eq!(device.read_packet(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        device.write_packet(&[9, 8]).unwrap();
        assert_eq!(
            host.recv_reply(Duration::from_millis(100)).unwrap(),
            vec![9, 8]
        );

        device.close();
        assert!(device.read_packet(&mut buf).is_err());
        assert!(device.write_packet(&[0]).is_err());
    }
}
