//! Throughput experiments: run the same batch on different dispatchers and
//! compare elapsed time against the peak concurrency each one reached.

use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::dispatch::{Dispatcher, DispatcherKind};
use crate::error::{ExperimentError, HarnessError};
use crate::harness::{BatchReport, JoinOutcome, TaskHarness};
use crate::lag::LagSpec;
use crate::primes::Workload;
use crate::tracker::{ConcurrencyTracker, PeakSampling};

/// How long cancelled tasks get to wind down after a join timeout.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// One experiment's parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Experiment {
    pub tasks: usize,
    pub workers: usize,
    pub workload: Workload,
    pub lag: Option<LagSpec>,
    pub sampling: PeakSampling,
    pub timeout: Option<Duration>,
}

/// What one run measured.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Dispatcher name, or `sequential` / `parallel-iter` for baselines.
    pub label: String,
    pub workload: Workload,
    pub tasks: usize,
    pub lag: Option<LagSpec>,
    pub sampling: PeakSampling,
    /// Dispatcher capacity, when it has one.
    pub capacity: Option<usize>,
    pub peak: i64,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub partial: bool,
    pub elapsed_ms: f64,
    /// Tasks per second.
    pub throughput: f64,
    /// Wrapping sum of every result; equal across runs of the same workload.
    pub checksum: u64,
    pub started_at: DateTime<Local>,
}

impl ExperimentReport {
    fn new(label: String, experiment: &Experiment, elapsed: Duration, started_at: DateTime<Local>) -> Self {
        let secs = elapsed.as_secs_f64();
        Self {
            label,
            workload: experiment.workload,
            tasks: experiment.tasks,
            lag: experiment.lag,
            sampling: experiment.sampling,
            capacity: None,
            peak: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            pending: 0,
            partial: false,
            elapsed_ms: secs * 1000.0,
            throughput: if secs > 0.0 { experiment.tasks as f64 / secs } else { 0.0 },
            checksum: 0,
            started_at,
        }
    }

    fn from_batch(
        batch: &BatchReport<u64, u64>,
        experiment: &Experiment,
        capacity: Option<usize>,
        started_at: DateTime<Local>,
    ) -> Self {
        Self {
            capacity,
            peak: batch.peak,
            succeeded: batch.succeeded(),
            failed: batch.failed(),
            cancelled: batch.cancelled(),
            pending: batch.pending(),
            partial: batch.partial,
            checksum: batch.results().fold(0u64, |acc, v| acc.wrapping_add(*v)),
            ..Self::new(batch.dispatcher.clone(), experiment, batch.elapsed, started_at)
        }
    }

    fn baseline(
        label: &str,
        experiment: &Experiment,
        peak: i64,
        checksum: u64,
        elapsed: Duration,
        started_at: DateTime<Local>,
    ) -> Self {
        Self {
            peak,
            succeeded: experiment.tasks,
            checksum,
            ..Self::new(label.to_string(), experiment, elapsed, started_at)
        }
    }
}

impl Experiment {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            tasks: config.tasks,
            workers: config.workers,
            workload: config.workload,
            lag: config.lag,
            sampling: config.sampling,
            timeout: config.timeout(),
        }
    }

    fn harness(&self) -> TaskHarness {
        TaskHarness::new()
            .with_lag_opt(self.lag)
            .with_sampling(self.sampling)
    }

    /// Run the batch on `dispatcher`. A join timeout cancels what is left and
    /// reports the batch as partial if it still does not finish.
    pub fn run_on<D: Dispatcher + ?Sized>(&self, dispatcher: &D) -> Result<ExperimentReport, HarnessError> {
        let started_at = Local::now();
        let workload = self.workload;
        let batch = self.harness().run_infallible(
            0..self.tasks as u64,
            move |value| workload.apply(value),
            dispatcher,
        )?;

        let batch_report = match batch.join(self.timeout) {
            JoinOutcome::Complete(report) => report,
            JoinOutcome::TimedOut(timeout) => {
                warn!(dispatcher = %dispatcher.name(), %timeout, "cancelling remaining tasks");
                match timeout.cancel_remaining(Some(CANCEL_GRACE)) {
                    JoinOutcome::Complete(report) => report,
                    JoinOutcome::TimedOut(timeout) => timeout.accept_partial(),
                }
            }
        };

        let report = ExperimentReport::from_batch(&batch_report, self, dispatcher.capacity(), started_at);
        info!(
            dispatcher = %report.label,
            peak = report.peak,
            elapsed_ms = report.elapsed_ms,
            "experiment finished"
        );
        Ok(report)
    }

    /// Build a dispatcher of `kind` and run on it.
    pub fn run_kind(&self, kind: DispatcherKind) -> Result<ExperimentReport, ExperimentError> {
        let dispatcher = kind.build(self.workers)?;
        Ok(self.run_on(dispatcher.as_ref())?)
    }

    /// Baseline: every item on the calling thread, one after another.
    pub fn run_sequential(&self) -> ExperimentReport {
        let tracker = ConcurrencyTracker::new(self.sampling);
        let started_at = Local::now();
        let start = Instant::now();
        let checksum = (0..self.tasks as u64)
            .map(|value| self.tracked_apply(&tracker, value))
            .fold(0u64, u64::wrapping_add);
        ExperimentReport::baseline("sequential", self, tracker.peak(), checksum, start.elapsed(), started_at)
    }

    /// Baseline: rayon parallel iterator on the global pool.
    pub fn run_parallel_iter(&self) -> ExperimentReport {
        let tracker = ConcurrencyTracker::new(self.sampling);
        let started_at = Local::now();
        let start = Instant::now();
        let checksum = (0..self.tasks as u64)
            .into_par_iter()
            .map(|value| self.tracked_apply(&tracker, value))
            .reduce(|| 0, u64::wrapping_add);
        ExperimentReport::baseline("parallel-iter", self, tracker.peak(), checksum, start.elapsed(), started_at)
    }

    fn tracked_apply(&self, tracker: &ConcurrencyTracker, value: u64) -> u64 {
        let _in_flight = tracker.track();
        if let Some(lag) = self.lag {
            lag.wait_or_else(|_| {});
        }
        let result = self.workload.apply(value);
        if let Some(lag) = self.lag {
            lag.wait_or_else(|_| {});
        }
        result
    }

    /// Run on each of `kinds`, optionally preceded by both baselines.
    /// `on_report` sees every report as soon as it is ready.
    pub fn compare<F>(
        &self,
        kinds: &[DispatcherKind],
        include_baselines: bool,
        mut on_report: F,
    ) -> Result<Vec<ExperimentReport>, ExperimentError>
    where
        F: FnMut(&ExperimentReport),
    {
        let mut reports = Vec::with_capacity(kinds.len() + 2);
        if include_baselines {
            for report in [self.run_sequential(), self.run_parallel_iter()] {
                on_report(&report);
                reports.push(report);
            }
        }
        for kind in kinds {
            let report = self.run_kind(*kind)?;
            on_report(&report);
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(workload: Workload) -> Experiment {
        Experiment {
            tasks: 64,
            workers: 4,
            workload,
            lag: None,
            sampling: PeakSampling::OnEnter,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    #[test]
    fn test_sequential_peak_is_one() {
        let report = small(Workload::Double).run_sequential();
        assert_eq!(report.peak, 1);
        assert_eq!(report.succeeded, 64);
        assert_eq!(report.checksum, (0..64u64).map(|v| v * 2).sum::<u64>());
    }

    #[test]
    fn test_checksums_agree_across_dispatchers() {
        let experiment = small(Workload::Prime);
        let mut seen = 0;
        let reports = experiment
            .compare(&DispatcherKind::all(), true, |_| seen += 1)
            .unwrap();
        assert_eq!(seen, reports.len());
        assert_eq!(reports.len(), DispatcherKind::all().len() + 2);
        let expected = reports[0].checksum;
        for report in &reports {
            assert_eq!(report.checksum, expected, "{}", report.label);
            assert_eq!(report.succeeded, 64, "{}", report.label);
            assert!(!report.partial);
            assert!(report.peak >= 1);
            if let Some(capacity) = report.capacity {
                assert!(report.peak <= capacity as i64, "{}", report.label);
            }
        }
    }

    #[test]
    fn test_single_thread_peak_is_one_with_lag() {
        let experiment = Experiment {
            lag: Some(LagSpec::fixed(Duration::from_millis(1))),
            tasks: 8,
            ..small(Workload::Double)
        };
        let report = experiment.run_kind(DispatcherKind::Single).unwrap();
        assert_eq!(report.peak, 1);
        assert_eq!(report.capacity, Some(1));
    }

    #[test]
    fn test_timeout_reports_partial_or_cancelled() {
        let experiment = Experiment {
            tasks: 4,
            lag: Some(LagSpec::fixed(Duration::from_millis(300))),
            timeout: Some(Duration::from_millis(50)),
            ..small(Workload::Double)
        };
        let report = experiment.run_kind(DispatcherKind::Single).unwrap();
        assert!(report.cancelled >= 1, "{:?}", report);
        assert_eq!(report.succeeded + report.cancelled + report.pending, 4);
    }

    #[test]
    fn test_report_serializes() {
        let report = small(Workload::Double).run_sequential();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["label"], "sequential");
        assert_eq!(json["workload"], "double");
        assert!(json["started_at"].is_string());
    }
}
