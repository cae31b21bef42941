//! Core library for loomlab: lag injection, peak concurrency tracking, task
//! harness, dispatchers and experiments. Used by the CLI binary; the harness
//! can be reused on its own with any `Dispatcher`.

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod experiment;
pub mod harness;
pub mod lag;
pub mod primes;
pub mod tracker;


// Re-export main API for CLI
pub use cancel::CancelToken;
pub use config::{load_config, load_config_from, ExperimentConfig, CONFIG_FILE};
#[cfg(feature = "cached-pool")]
pub use dispatch::CachedPool;
pub use dispatch::{Dispatcher, DispatcherKind, FixedPool, Job, ThreadPerTask};
pub use error::{ConfigError, DispatchError, ExperimentError, HarnessError, LagError, TaskError};
pub use experiment::{Experiment, ExperimentReport};
pub use harness::{
    Batch, BatchReport, JoinOutcome, JoinTimeout, TaskHandle, TaskHarness, TaskRecord, TaskStatus,
};
pub use lag::{Interrupted, LagSpec};
pub use primes::{is_prime, Workload, PRIME_OFFSET};
pub use tracker::{ConcurrencyTracker, InFlight, PeakSampling};
