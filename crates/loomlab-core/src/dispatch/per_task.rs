//! One OS thread per submitted job.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use super::{Dispatcher, Job};
use crate::error::DispatchError;

/// Spawns a detached, named thread for every job. No upper bound.
#[derive(Debug, Default)]
pub struct ThreadPerTask {
    spawned: AtomicUsize,
}

impl ThreadPerTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl Dispatcher for ThreadPerTask {
    fn submit(&self, job: Job) -> Result<(), DispatchError> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("loomlab-task-{}", n))
            .spawn(job)?;
        Ok(())
    }

    fn name(&self) -> String {
        "per-task".to_string()
    }
}
