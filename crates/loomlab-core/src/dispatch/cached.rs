//! Cached pool: grows a thread whenever no worker is idle, reuses idle
//! workers, retires workers that stay idle past the keep-alive.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

use super::{Dispatcher, Job};
use crate::error::DispatchError;

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

// Invariant: `idle` == workers blocked in recv - jobs queued but not yet taken.
// It never goes negative, so every queued job has a worker waiting for it.
struct Shared {
    receiver: Receiver<Job>,
    idle: AtomicUsize,
    live: AtomicUsize,
    spawned: AtomicUsize,
    keep_alive: Duration,
}

pub struct CachedPool {
    shared: Arc<Shared>,
    sender: Sender<Job>,
}

impl CachedPool {
    pub fn new() -> Self {
        Self::with_keep_alive(DEFAULT_KEEP_ALIVE)
    }

    pub fn with_keep_alive(keep_alive: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared: Arc::new(Shared {
                receiver,
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
                keep_alive,
            }),
            sender,
        }
    }

    /// Worker threads currently alive.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Worker threads ever started.
    pub fn spawned_workers(&self) -> usize {
        self.shared.spawned.load(Ordering::Acquire)
    }

    /// Either claim an idle worker or start a new one.
    fn reserve_worker(&self) -> Result<(), DispatchError> {
        let mut idle = self.shared.idle.load(Ordering::Acquire);
        loop {
            if idle == 0 {
                return self.spawn_worker();
            }
            match self.shared.idle.compare_exchange_weak(
                idle,
                idle - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => idle = actual,
            }
        }
    }

    fn spawn_worker(&self) -> Result<(), DispatchError> {
        let n = self.shared.spawned.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("loomlab-cached-{}", n))
            .spawn(move || worker_loop(shared));
        if let Err(e) = spawned {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
            return Err(DispatchError::Spawn(e));
        }
        trace!(worker = n, "cached pool grew");
        Ok(())
    }
}

impl Default for CachedPool {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        match shared.receiver.recv_timeout(shared.keep_alive) {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!("job panicked on cached pool worker");
                }
                shared.idle.fetch_add(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => {
                if retire(&shared.idle) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
}

/// Give up this worker's idle slot. Fails when every idle slot is already
/// claimed, which means a job is queued for us.
fn retire(idle: &AtomicUsize) -> bool {
    let mut n = idle.load(Ordering::Acquire);
    while n > 0 {
        match idle.compare_exchange_weak(n, n - 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => n = actual,
        }
    }
    false
}

impl Dispatcher for CachedPool {
    fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.reserve_worker()?;
        self.sender
            .send(job)
            .map_err(|_| DispatchError::Shutdown(self.name()))
    }

    fn name(&self) -> String {
        "cached".to_string()
    }
}
