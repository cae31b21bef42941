//! Fixed-size pool on rayon's thread pool.

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{Dispatcher, Job};
use crate::error::DispatchError;

/// `workers` long-lived threads pulling jobs in submission order.
pub struct FixedPool {
    pool: ThreadPool,
    workers: usize,
    label: String,
}

impl FixedPool {
    pub fn new(workers: usize) -> Result<Self, DispatchError> {
        Self::build(workers.max(1), "fixed")
    }

    /// A pool with exactly one worker.
    pub fn single() -> Result<Self, DispatchError> {
        Self::build(1, "single")
    }

    /// Sized to the number of logical CPUs.
    pub fn per_cpu() -> Result<Self, DispatchError> {
        Self::new(num_cpus::get())
    }

    fn build(workers: usize, prefix: &str) -> Result<Self, DispatchError> {
        let thread_prefix = format!("loomlab-{}", prefix);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("{}-{}", thread_prefix, i))
            .build()
            .map_err(|e| DispatchError::Pool(e.to_string()))?;
        let label = if prefix == "single" {
            prefix.to_string()
        } else {
            format!("{}-{}", prefix, workers)
        };
        Ok(Self {
            pool,
            workers,
            label,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Dispatcher for FixedPool {
    fn submit(&self, job: Job) -> Result<(), DispatchError> {
        // Jobs spawned from outside the pool go through its FIFO injector.
        self.pool.spawn(job);
        Ok(())
    }

    fn name(&self) -> String {
        self.label.clone()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.workers)
    }
}
