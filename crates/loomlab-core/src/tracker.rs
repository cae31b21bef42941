//! Lock-free high-water mark of concurrently active units of work.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Where the tracker samples the in-flight count for its high-water mark.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeakSampling {
    /// Sample the post-increment value in `enter()`. Reports the true peak.
    #[default]
    OnEnter,
    /// Sample the post-decrement value in `exit()`. Under-reports the true
    /// peak by one; kept for comparison with older measurements.
    OnExit,
}

impl std::str::FromStr for PeakSampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enter" | "on-enter" => Ok(PeakSampling::OnEnter),
            "exit" | "on-exit" => Ok(PeakSampling::OnExit),
            other => Err(format!("unknown peak sampling '{}' (expected enter or exit)", other)),
        }
    }
}

/// Counts units of work currently in flight and remembers the maximum seen.
///
/// Only atomic read-modify-write operations are used; `enter`/`exit` never
/// block.
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    current: AtomicI64,
    observed_max: AtomicI64,
    sampling: PeakSampling,
}

impl ConcurrencyTracker {
    pub fn new(sampling: PeakSampling) -> Self {
        Self {
            current: AtomicI64::new(0),
            observed_max: AtomicI64::new(0),
            sampling,
        }
    }

    pub fn sampling(&self) -> PeakSampling {
        self.sampling
    }

    /// Mark one unit of work as started. Returns the count before it started.
    pub fn enter(&self) -> i64 {
        let before = self.current.fetch_add(1, Ordering::AcqRel);
        if self.sampling == PeakSampling::OnEnter {
            self.raise_max(before + 1);
        }
        before
    }

    /// Mark one unit of work as finished. Returns the count after it finished.
    pub fn exit(&self) -> i64 {
        let after = self.current.fetch_sub(1, Ordering::AcqRel) - 1;
        if self.sampling == PeakSampling::OnExit {
            self.raise_max(after);
        }
        after
    }

    /// `enter()` now, `exit()` when the guard drops (including during unwinding).
    pub fn track(&self) -> InFlight<'_> {
        self.enter();
        InFlight { tracker: self }
    }

    /// High-water mark so far. Only final once every unit has exited.
    pub fn peak(&self) -> i64 {
        self.observed_max.load(Ordering::Acquire)
    }

    /// Units currently in flight.
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    fn raise_max(&self, candidate: i64) {
        let mut max = self.observed_max.load(Ordering::Acquire);
        while candidate > max {
            match self.observed_max.compare_exchange_weak(
                max,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }
    }
}

/// Guard returned by [`ConcurrencyTracker::track`].
#[must_use = "dropping the guard immediately exits the tracker"]
pub struct InFlight<'a> {
    tracker: &'a ConcurrencyTracker,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.tracker.exit();
    }
}
