//! Concurrent forward-task queue
//!
//! Bounded FIFO between the capture loop and a queue-consumer worker. The
//! capture path must never stall: when the queue is full the oldest pending
//! task is dropped to make room. Consumers block on `dequeue` but poll a stop
//! flag so shutdown wakes them instead of leaving them parked forever.
//!
//! Tasks carry their enqueue time. There are no priority classes; ordering is
//! first-in first-out.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::pool::FlowKey;

/// Default queue capacity per consumer
pub const DEFAULT_CAPACITY: usize = 1024;

/// How often a blocked consumer re-checks the stop flag
const DEQUEUE_POLL: Duration = Duration::from_millis(50);

/// One captured packet's worth of work: payload plus addressing, produced by
/// the decode step and consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct ForwardTask {
    pub payload: Vec<u8>,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub src_port: u16,
    pub enqueued_at: Instant,
}

impl ForwardTask {
    pub fn new(payload: Vec<u8>, dst_ip: Ipv4Addr, dst_port: u16, src_port: u16) -> Self {
        Self {
            payload,
            dst_ip,
            dst_port,
            src_port,
            enqueued_at: Instant::now(),
        }
    }

    /// Outbound path this task travels
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.dst_ip, self.dst_port)
    }
}

/// Bounded concurrent FIFO of pending forward tasks
pub struct TaskQueue {
    tx: Sender<ForwardTask>,
    rx: Receiver<ForwardTask>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Insert without blocking. When full, the oldest queued task is dropped
    /// so the capture loop never stalls behind slow consumers.
    pub fn enqueue(&self, task: ForwardTask) {
        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                if let Ok(dropped) = self.rx.try_recv() {
                    log::warn!(
                        "task queue full, dropping oldest task for port {} (queued {}ms ago)",
                        dropped.src_port,
                        dropped.enqueued_at.elapsed().as_millis()
                    );
                }
                if self.tx.try_send(task).is_err() {
                    log::warn!("task queue still full after drop, discarding new task");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("task queue disconnected, discarding task");
            }
        }
    }

    /// Blocking pop. Returns `None` once `stop` is set or the queue has been
    /// torn down, so consumers never block past shutdown.
    pub fn dequeue(&self, stop: &AtomicBool) -> Option<ForwardTask> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            match self.rx.recv_timeout(DEQUEUE_POLL) {
                Ok(task) => return Some(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Number of tasks currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
