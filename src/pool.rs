//! Outbound connection pool
//!
//! Keyed cache of reusable TCP sockets to (destination ip, destination port).
//! A flow that ends cleanly returns its socket here so the next flow to the
//! same destination skips the connect handshake. Sockets idle past the sweep
//! threshold are evicted to keep file-descriptor usage bounded.
//!
//! The pool is shared by every worker; all access goes through one mutex-held
//! map. A socket is never handed to two callers at once: `acquire` removes it
//! from the idle set and ownership transfers to the caller until `release`.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{RelayError, RelayResult};

/// Bounded read timeout on outbound sockets; guarantees response handlers
/// eventually exit on stalled peers.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Recommended interval between idle sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Default age at which an idle pooled socket is evicted
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

/// One logical outbound path: destination address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl FlowKey {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// An idle socket retained for reuse, with its age metadata
struct PooledConnection {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

/// A socket on lease from the pool. Carries the socket's open time so the
/// age metadata stays accurate across release cycles.
pub struct PooledStream {
    pub stream: TcpStream,
    pub created_at: Instant,
}

/// Keyed cache of idle outbound sockets
pub struct ConnectionPool {
    idle: Mutex<HashMap<FlowKey, VecDeque<PooledConnection>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Return a pooled idle socket for `key`, or open a fresh connection.
    ///
    /// Pooled sockets are probed first; any whose peer has gone away are
    /// discarded. A fresh connection gets no-delay and the bounded read
    /// timeout applied before it is handed out. Failure to connect maps to
    /// `ConnectFailure`; the caller drops the task, there is no retry here.
    pub fn acquire(&self, key: FlowKey) -> RelayResult<PooledStream> {
        loop {
            let candidate = {
                let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
                idle.get_mut(&key).and_then(VecDeque::pop_front)
            };

            let Some(conn) = candidate else { break };

            if socket_alive(&conn.stream) {
                log::debug!(
                    "reusing pooled connection to {} (idle {}ms, age {}s)",
                    key,
                    conn.last_used.elapsed().as_millis(),
                    conn.created_at.elapsed().as_secs()
                );
                return Ok(PooledStream {
                    stream: conn.stream,
                    created_at: conn.created_at,
                });
            }
            log::debug!("discarding stale pooled connection to {}", key);
            let _ = conn.stream.shutdown(Shutdown::Both);
        }

        let stream =
            TcpStream::connect_timeout(&key.socket_addr(), CONNECT_TIMEOUT).map_err(|e| {
                RelayError::ConnectFailure {
                    dest: key,
                    source: e,
                }
            })?;
        stream.set_nodelay(true).map_err(RelayError::Io)?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(RelayError::Io)?;

        log::debug!("opened new connection to {}", key);
        Ok(PooledStream {
            stream,
            created_at: Instant::now(),
        })
    }

    /// Return a still-healthy socket to the idle set. A socket whose peer has
    /// already closed is destroyed instead.
    pub fn release(&self, key: FlowKey, lease: PooledStream) {
        if !socket_alive(&lease.stream) {
            log::debug!("not pooling closed connection to {}", key);
            let _ = lease.stream.shutdown(Shutdown::Both);
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.entry(key).or_default().push_back(PooledConnection {
            stream: lease.stream,
            created_at: lease.created_at,
            last_used: Instant::now(),
        });
    }

    /// Force-close every pooled socket. Used on shutdown and DNS rotation.
    pub fn close_all(&self) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let mut closed = 0usize;
        for (_, conns) in idle.drain() {
            for conn in conns {
                let _ = conn.stream.shutdown(Shutdown::Both);
                closed += 1;
            }
        }
        if closed > 0 {
            log::info!("closed {} pooled connections", closed);
        }
    }

    /// Close and evict sockets idle longer than `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let mut evicted = 0usize;
        for conns in idle.values_mut() {
            let mut keep = VecDeque::with_capacity(conns.len());
            while let Some(conn) = conns.pop_front() {
                if conn.last_used.elapsed() > max_idle {
                    let _ = conn.stream.shutdown(Shutdown::Both);
                    evicted += 1;
                } else {
                    keep.push_back(conn);
                }
            }
            *conns = keep;
        }
        idle.retain(|_, conns| !conns.is_empty());
        if evicted > 0 {
            log::debug!("idle sweep evicted {} connections", evicted);
        }
    }

    /// Number of idle sockets currently cached
    pub fn idle_count(&self) -> usize {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.values().map(VecDeque::len).sum()
    }
}

/// Probe whether the peer is still there without consuming stream data.
/// A zero-byte peek means the peer sent FIN; `WouldBlock` means the
/// connection is open with nothing to read.
fn socket_alive(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let alive = match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    if stream.set_nonblocking(false).is_err() {
        return false;
    }
    alive
}
