//! Dispatchers: the worker facilities a batch is run on.
//!
//! The harness only needs fire-and-forget submission; it builds result
//! retrieval and cancellation on top. The adapters here cover the pool shapes
//! worth comparing: a fixed pool, a single thread, a cached (grow on demand)
//! pool, and a thread per task.

mod fixed;
mod per_task;
#[cfg(feature = "cached-pool")]
mod cached;

pub use fixed::FixedPool;
pub use per_task::ThreadPerTask;
#[cfg(feature = "cached-pool")]
pub use cached::CachedPool;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// A unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs submitted jobs, eventually, on some thread.
pub trait Dispatcher: Send + Sync {
    /// Queue `job` for execution. Must not run it on the caller's thread.
    fn submit(&self, job: Job) -> Result<(), DispatchError>;

    /// Short label used in logs and reports, e.g. `fixed-8`.
    fn name(&self) -> String;

    /// Upper bound on jobs running at once, if the dispatcher has one.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

impl<D: Dispatcher + ?Sized> Dispatcher for Box<D> {
    fn submit(&self, job: Job) -> Result<(), DispatchError> {
        (**self).submit(job)
    }

    fn name(&self) -> String {
        (**self).name()
    }

    fn capacity(&self) -> Option<usize> {
        (**self).capacity()
    }
}

/// The dispatcher shapes this crate can build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatcherKind {
    /// `workers` long-lived threads.
    Fixed,
    /// One long-lived thread.
    Single,
    /// Threads created on demand and reused while warm.
    #[cfg(feature = "cached-pool")]
    Cached,
    /// A new thread for every job.
    PerTask,
}

impl DispatcherKind {
    pub fn all() -> Vec<DispatcherKind> {
        vec![
            DispatcherKind::Fixed,
            DispatcherKind::Single,
            #[cfg(feature = "cached-pool")]
            DispatcherKind::Cached,
            DispatcherKind::PerTask,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherKind::Fixed => "fixed",
            DispatcherKind::Single => "single",
            #[cfg(feature = "cached-pool")]
            DispatcherKind::Cached => "cached",
            DispatcherKind::PerTask => "per-task",
        }
    }

    /// Build a dispatcher of this kind. `workers` only matters for `Fixed`.
    pub fn build(self, workers: usize) -> Result<Box<dyn Dispatcher>, DispatchError> {
        Ok(match self {
            DispatcherKind::Fixed => Box::new(FixedPool::new(workers)?),
            DispatcherKind::Single => Box::new(FixedPool::single()?),
            #[cfg(feature = "cached-pool")]
            DispatcherKind::Cached => Box::new(CachedPool::new()),
            DispatcherKind::PerTask => Box::new(ThreadPerTask::new()),
        })
    }
}

impl fmt::Display for DispatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatcherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DispatcherKind::all()
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = DispatcherKind::all().iter().map(|k| k.as_str()).collect();
                format!("unknown dispatcher '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}
