//! Forwarding engine
//!
//! Orchestrates the relay pipeline: the capture loop reads raw packets from
//! the tunnel device and turns valid TCP packets into forward tasks; a fixed
//! pool of workers consumes the tasks, writes payloads to real destinations
//! through the connection pool, and spawns one response handler per client
//! flow to stream replies back into the tunnel.
//!
//! ```text
//!   tunnel device ──read──> capture loop ──decode──> task queues (one per
//!   worker, picked by src_port hash so writes for a flow stay ordered)
//!        ▲                                               │
//!        │                                               ▼
//!   write_packet <── response handler <──read── destination socket <── worker
//! ```
//!
//! Every long-lived thread polls one shared stop flag; `stop()` sets it,
//! force-closes all sockets and the device, then joins everything, so no
//! worker outlives the interface it depends on.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::packet::{self, DecodeError};
use crate::pool::{ConnectionPool, FlowKey, PooledStream, DEFAULT_MAX_IDLE, SWEEP_INTERVAL};
use crate::queue::{ForwardTask, TaskQueue, DEFAULT_CAPACITY};
use crate::tunnel::TunnelDevice;
use crate::RelayError;

/// Capture read buffer size
const CAPTURE_BUFFER_SIZE: usize = 32767;

/// Pause after a failed capture read, to avoid hot-spinning on a torn-down
/// interface
const CAPTURE_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Response handler read buffer size
const RESPONSE_BUFFER_SIZE: usize = 8192;

/// No packet for this long means "no traffic flowing"
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(3);

/// Per-flow relay lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Task dequeued, no connection yet
    New,
    /// Connection acquired, payload being written
    Sending,
    /// Payload written, response handler spawned
    AwaitingResponse,
    /// Response handler streaming replies into the tunnel
    Relaying,
    /// Terminal; socket pooled or destroyed, table entry removed
    Closed,
}

/// One in-flight client flow: the writer half of its outbound socket plus the
/// response handler reading the other half. The generation distinguishes this
/// flow from any earlier flow that used the same source port.
struct ActiveEntry {
    stream: TcpStream,
    key: FlowKey,
    state: FlowState,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Source port -> in-flight flow. At most one live socket (and one response
/// handler) per source port at any time.
#[derive(Default)]
struct ActiveTable {
    flows: Mutex<HashMap<u16, ActiveEntry>>,
    next_generation: AtomicU64,
}

impl ActiveTable {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn contains(&self, src_port: u16) -> bool {
        self.flows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&src_port)
    }

    fn len(&self) -> usize {
        self.flows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn set_state(&self, src_port: u16, generation: u64, state: FlowState) {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = flows.get_mut(&src_port) {
            if entry.generation == generation {
                entry.state = state;
            }
        }
    }

    /// Remove a flow's entry, returning its handler handle if any. Only the
    /// matching generation is removed: a handler whose flow was already
    /// replaced must not take the replacement's entry down with it.
    fn remove(&self, src_port: u16, generation: u64) -> Option<JoinHandle<()>> {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        match flows.get(&src_port) {
            Some(entry) if entry.generation == generation => {
                flows.remove(&src_port).and_then(|mut e| e.handle.take())
            }
            _ => None,
        }
    }

    /// Force-close every in-flight socket and drain the table. Returns the
    /// handler join handles so the caller can wait for them off-lock.
    fn shutdown_all(&self) -> Vec<JoinHandle<()>> {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        let mut handles = Vec::with_capacity(flows.len());
        for (_, mut entry) in flows.drain() {
            let _ = entry.stream.shutdown(Shutdown::Both);
            if let Some(h) = entry.handle.take() {
                handles.push(h);
            }
        }
        handles
    }
}

/// State shared by the capture loop, workers, sweeper and response handlers
struct EngineShared {
    device: Arc<dyn TunnelDevice>,
    pool: Arc<ConnectionPool>,
    active: ActiveTable,
    queues: Vec<TaskQueue>,
    stop: AtomicBool,
    last_packet: ArcSwapOption<Instant>,
    local_ip: Ipv4Addr,
}

/// The forwarding engine. `start` spawns the capture loop, the worker pool
/// and the idle sweeper; `stop` tears all of it down along with every socket.
pub struct ForwardingEngine {
    shared: Arc<EngineShared>,
    threads: Vec<JoinHandle<()>>,
    running: bool,
}

impl ForwardingEngine {
    pub fn new(
        device: Arc<dyn TunnelDevice>,
        pool: Arc<ConnectionPool>,
        local_ip: Ipv4Addr,
    ) -> Self {
        let workers = num_cpus::get().min(8).max(1);
        let queues = (0..workers).map(|_| TaskQueue::new(DEFAULT_CAPACITY)).collect();
        Self {
            shared: Arc::new(EngineShared {
                device,
                pool,
                active: ActiveTable::default(),
                queues,
                stop: AtomicBool::new(false),
                last_packet: ArcSwapOption::empty(),
                local_ip,
            }),
            threads: Vec::new(),
            running: false,
        }
    }

    /// Spawn the capture loop, queue-consumer workers and the idle sweeper.
    pub fn start(&mut self) {
        if self.running {
            log::warn!("forwarding engine already running");
            return;
        }
        self.shared.stop.store(false, Ordering::SeqCst);

        let capture = Arc::clone(&self.shared);
        self.threads.push(thread::spawn(move || run_capture_loop(capture)));

        for worker_id in 0..self.shared.queues.len() {
            let shared = Arc::clone(&self.shared);
            self.threads
                .push(thread::spawn(move || run_worker(worker_id, shared)));
        }

        let sweeper = Arc::clone(&self.shared);
        self.threads.push(thread::spawn(move || run_sweeper(sweeper)));

        self.running = true;
        log::info!(
            "forwarding engine started ({} workers)",
            self.shared.queues.len()
        );
    }

    /// Stop everything: capture loop and workers wake on the stop flag, every
    /// pooled and in-flight socket is force-closed, the device is closed, and
    /// all threads are joined before this returns.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        log::info!("stopping forwarding engine...");
        self.shared.stop.store(true, Ordering::SeqCst);

        self.shared.pool.close_all();
        let handler_threads = self.shared.active.shutdown_all();
        self.shared.device.close();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        for handle in handler_threads {
            let _ = handle.join();
        }

        self.shared.last_packet.store(None);
        self.running = false;
        log::info!("forwarding engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether traffic is currently flowing: a packet was captured within the
    /// liveness window.
    pub fn liveness(&self) -> bool {
        self.shared
            .last_packet
            .load_full()
            .map_or(false, |seen| seen.elapsed() < LIVENESS_WINDOW)
    }

    /// Number of flows with a live response handler
    pub fn active_flows(&self) -> usize {
        self.shared.active.len()
    }

    /// Whether a response handler is live for this source port
    pub fn has_flow(&self, src_port: u16) -> bool {
        self.shared.active.contains(src_port)
    }
}

impl Drop for ForwardingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture loop: read raw packets from the device, decode, dispatch to the
/// worker that owns the flow's source port.
fn run_capture_loop(shared: Arc<EngineShared>) {
    log::info!("capture loop started");
    let mut buf = vec![0u8; CAPTURE_BUFFER_SIZE];
    let workers = shared.queues.len();

    while !shared.stop.load(Ordering::SeqCst) {
        match shared.device.read_packet(&mut buf) {
            Ok(0) => {
                thread::sleep(CAPTURE_ERROR_PAUSE);
            }
            Ok(n) => {
                shared.last_packet.store(Some(Arc::new(Instant::now())));
                match packet::decode_outbound(&buf[..n]) {
                    Ok(parsed) => {
                        let task = ForwardTask::new(
                            parsed.payload,
                            parsed.dst_ip,
                            parsed.dst_port,
                            parsed.src_port,
                        );
                        shared.queues[parsed.src_port as usize % workers].enqueue(task);
                    }
                    Err(DecodeError::Unsupported(proto)) => {
                        log::trace!("skipping non-TCP packet (protocol {})", proto);
                    }
                    Err(DecodeError::Malformed(reason)) => {
                        log::debug!("dropping malformed packet: {}", reason);
                    }
                }
            }
            Err(e) => {
                if shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                log::debug!("capture read error: {}, pausing", e);
                thread::sleep(CAPTURE_ERROR_PAUSE);
            }
        }
    }
    log::info!("capture loop stopped");
}

/// Queue-consumer worker: owns every flow whose source port hashes to it,
/// which keeps payload writes for one flow in enqueue order.
fn run_worker(worker_id: usize, shared: Arc<EngineShared>) {
    log::debug!("worker {} started", worker_id);
    while let Some(task) = shared.queues[worker_id].dequeue(&shared.stop) {
        process_task(&shared, task);
    }
    log::debug!("worker {} stopped", worker_id);
}

/// Drive one forward task through the flow state machine.
fn process_task(shared: &Arc<EngineShared>, task: ForwardTask) {
    let key = task.flow_key();
    let src_port = task.src_port;

    // Existing flow: write on its socket, never open a second one. The
    // writer is cloned out of the table and written off-lock; a stalled
    // peer must never wedge the table against shutdown.
    let existing = {
        let mut flows = shared.active.flows.lock().unwrap_or_else(|e| e.into_inner());
        match flows.get_mut(&src_port) {
            Some(entry) if entry.key == key => {
                if task.payload.is_empty() {
                    return;
                }
                match entry.stream.try_clone() {
                    Ok(stream) => Some((stream, entry.generation)),
                    Err(e) => {
                        log::warn!("flow {}: failed to clone socket: {}", src_port, e);
                        let _ = entry.stream.shutdown(Shutdown::Both);
                        entry.state = FlowState::Closed;
                        return;
                    }
                }
            }
            Some(entry) => {
                // Same source port reused toward a different destination.
                // Close the stale flow and start fresh rather than
                // cross-wiring the payload onto the old socket.
                log::warn!(
                    "source port {} reused for {} (was {}), replacing stale flow",
                    src_port,
                    key,
                    entry.key
                );
                let _ = entry.stream.shutdown(Shutdown::Both);
                let _ = entry.handle.take(); // handler exits on its own
                flows.remove(&src_port);
                None
            }
            None => None,
        }
    };

    if let Some((mut stream, generation)) = existing {
        if let Err(e) = stream.write_all(&task.payload) {
            log::warn!("flow {}: {}", src_port, RelayError::WriteFailure(e));
            let _ = stream.shutdown(Shutdown::Both);
            shared.active.set_state(src_port, generation, FlowState::Closed);
            // Handler sees the shutdown and removes the entry.
        }
        return;
    }

    // New flow.
    log::trace!("flow {}: {:?} -> {}", src_port, FlowState::New, key);
    let lease = match shared.pool.acquire(key) {
        Ok(l) => l,
        Err(e) => {
            log::warn!("flow {}: {}", src_port, e);
            return;
        }
    };
    let mut stream = lease.stream;
    let created_at = lease.created_at;

    log::trace!("flow {}: {:?}", src_port, FlowState::Sending);
    if !task.payload.is_empty() {
        if let Err(e) = stream.write_all(&task.payload) {
            log::warn!("flow {}: {}", src_port, RelayError::WriteFailure(e));
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }

    let reader = match stream.try_clone() {
        Ok(r) => r,
        Err(e) => {
            log::warn!("flow {}: failed to clone socket: {}", src_port, e);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };

    // Insert before spawning so the handler always finds its own entry,
    // even if the peer closes immediately.
    let generation = shared.active.next_generation();
    {
        let mut flows = shared.active.flows.lock().unwrap_or_else(|e| e.into_inner());
        flows.insert(
            src_port,
            ActiveEntry {
                stream,
                key,
                state: FlowState::AwaitingResponse,
                generation,
                handle: None,
            },
        );
    }

    let handler_shared = Arc::clone(shared);
    let handle = thread::spawn(move || {
        run_response_handler(handler_shared, reader, key, src_port, generation, created_at)
    });

    let mut flows = shared.active.flows.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = flows.get_mut(&src_port) {
        if entry.generation == generation {
            entry.handle = Some(handle);
        }
    }
}

/// What to do with the socket once a response handler finishes
enum StreamDisposal {
    /// Clean idle end: return to the pool for reuse
    Pool,
    /// Error or peer closed: destroy
    Destroy,
}

/// Response handler: one per active flow. Reads from the destination socket
/// and injects synthesized reply packets into the tunnel until end-of-stream,
/// an error, a read timeout, or engine stop.
fn run_response_handler(
    shared: Arc<EngineShared>,
    mut reader: TcpStream,
    key: FlowKey,
    src_port: u16,
    generation: u64,
    created_at: Instant,
) {
    shared.active.set_state(src_port, generation, FlowState::Relaying);
    log::trace!("flow {}: {:?}", src_port, FlowState::Relaying);

    let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
    let disposal = loop {
        if shared.stop.load(Ordering::SeqCst) {
            break StreamDisposal::Destroy;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                log::debug!("flow {}: peer closed", src_port);
                break StreamDisposal::Destroy;
            }
            Ok(n) => {
                let reply = packet::encode_reply(key.ip, key.port, shared.local_ip, src_port, &buf[..n]);
                if let Err(e) = shared.device.write_packet(&reply) {
                    log::warn!("flow {}: tunnel write failed: {}", src_port, e);
                    break StreamDisposal::Destroy;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if shared.stop.load(Ordering::SeqCst) {
                    break StreamDisposal::Destroy;
                }
                // Stalled but healthy peer: hand the socket back for reuse.
                log::debug!("flow {}: read timeout, pooling connection", src_port);
                break StreamDisposal::Pool;
            }
            Err(e) => {
                log::debug!("flow {}: read error: {}", src_port, e);
                break StreamDisposal::Destroy;
            }
        }
    };

    match disposal {
        StreamDisposal::Pool => shared.pool.release(
            key,
            PooledStream {
                stream: reader,
                created_at,
            },
        ),
        StreamDisposal::Destroy => {
            let _ = reader.shutdown(Shutdown::Both);
        }
    }

    // Terminal: drop our own entry (and detach our join handle).
    let _ = shared.active.remove(src_port, generation);
    log::trace!("flow {}: {:?}", src_port, FlowState::Closed);
}

/// Periodic idle sweep of the connection pool.
fn run_sweeper(shared: Arc<EngineShared>) {
    let tick = Duration::from_millis(500);
    let mut elapsed = Duration::ZERO;
    while !shared.stop.load(Ordering::SeqCst) {
        thread::sleep(tick);
        elapsed += tick;
        if elapsed >= SWEEP_INTERVAL {
            elapsed = Duration::ZERO;
            shared.pool.sweep_idle(DEFAULT_MAX_IDLE);
        }
    }
}
