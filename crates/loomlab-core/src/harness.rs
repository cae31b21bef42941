//! Task harness: submit a batch to a dispatcher with tracker accounting and
//! optional lag around each task, then join and collect.
//!
//! Every task runs as: cancelled-before-start check, `enter()`, lag, work,
//! lag, `exit()`, publish. `exit()` is a guard drop so it runs on every path,
//! and publishing happens after it, so a joined batch always leaves the
//! tracker at zero.

use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::dispatch::Dispatcher;
use crate::error::{HarnessError, TaskError};
use crate::lag::LagSpec;
use crate::tracker::{ConcurrencyTracker, PeakSampling};

/// Where a task is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Outcome of one item of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord<I, O> {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub input: I,
    /// Present for succeeded tasks, and for cancelled tasks whose work had
    /// already produced a value.
    pub result: Option<O>,
    pub status: TaskStatus,
    /// Error text or panic message for failed tasks.
    pub failure: Option<String>,
}

struct Completion<O> {
    result: Option<O>,
    status: TaskStatus,
    failure: Option<String>,
}

struct Slot<O> {
    state: Mutex<Option<Completion<O>>>,
    done: Condvar,
}

impl<O> Slot<O> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Completion<O>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Status is decided under the slot lock, the same lock `cancel` holds,
    /// so a successful `cancel()` always ends in `Cancelled`.
    fn publish(&self, token: &CancelToken, outcome: Option<Result<O, String>>) {
        let mut state = self.lock();
        let cancelled = token.is_cancelled();
        let completion = match outcome {
            None => Completion {
                result: None,
                status: TaskStatus::Cancelled,
                failure: None,
            },
            Some(Ok(value)) => Completion {
                result: Some(value),
                status: if cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Succeeded
                },
                failure: None,
            },
            Some(Err(message)) => Completion {
                result: None,
                status: if cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                },
                failure: Some(message),
            },
        };
        *state = Some(completion);
        self.done.notify_all();
    }

    /// Block until published or `deadline` passes. True if published.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.lock();
        loop {
            if state.is_some() {
                return true;
            }
            state = match deadline {
                None => self.done.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Caller's side of one submitted task.
pub struct TaskHandle<I, O> {
    index: usize,
    input: I,
    slot: Arc<Slot<O>>,
    token: CancelToken,
}

impl<I, O> TaskHandle<I, O> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn is_finished(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Terminal status, or `Pending` while still queued or running.
    pub fn status(&self) -> TaskStatus {
        self.slot
            .lock()
            .as_ref()
            .map(|c| c.status)
            .unwrap_or(TaskStatus::Pending)
    }

    /// Request cancellation. Returns `true` if the task had not finished, in
    /// which case it will finish as `Cancelled`; a queued task is skipped and
    /// a running one has its lag waits interrupted. Best effort: work that
    /// never looks at its cancellation context runs to completion.
    pub fn cancel(&self) -> bool {
        let state = self.slot.lock();
        if state.is_some() {
            return false;
        }
        self.token.cancel();
        true
    }

    fn into_record(self) -> TaskRecord<I, O> {
        let completion = self.slot.lock().take();
        match completion {
            Some(c) => TaskRecord {
                index: self.index,
                input: self.input,
                result: c.result,
                status: c.status,
                failure: c.failure,
            },
            None => TaskRecord {
                index: self.index,
                input: self.input,
                result: None,
                status: TaskStatus::Pending,
                failure: None,
            },
        }
    }
}

impl<I, O: Clone> TaskHandle<I, O> {
    /// Wait for the task, at most `timeout` if given.
    pub fn result(&self, timeout: Option<Duration>) -> Result<O, TaskError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        if !self.slot.wait_until(deadline) {
            return Err(TaskError::Timeout(timeout.unwrap_or_default()));
        }
        let state = self.slot.lock();
        match state.as_ref() {
            Some(Completion {
                status: TaskStatus::Succeeded,
                result: Some(value),
                ..
            }) => Ok(value.clone()),
            Some(Completion {
                status: TaskStatus::Failed,
                failure,
                ..
            }) => Err(TaskError::Failed(failure.clone().unwrap_or_default())),
            _ => Err(TaskError::Cancelled),
        }
    }
}

impl<I, O> fmt::Debug for TaskHandle<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("index", &self.index)
            .field("status", &self.status())
            .finish()
    }
}

/// Runs batches. Configuration is per harness, never global.
#[derive(Clone, Debug, Default)]
pub struct TaskHarness {
    lag: Option<LagSpec>,
    sampling: PeakSampling,
}

impl TaskHarness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait a lag drawn from `lag` before and after each task's work.
    pub fn with_lag(mut self, lag: LagSpec) -> Self {
        self.lag = Some(lag);
        self
    }

    pub fn with_lag_opt(mut self, lag: Option<LagSpec>) -> Self {
        self.lag = lag;
        self
    }

    pub fn with_sampling(mut self, sampling: PeakSampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn lag(&self) -> Option<LagSpec> {
        self.lag
    }

    pub fn sampling(&self) -> PeakSampling {
        self.sampling
    }

    /// Submit one task per item to `dispatcher`.
    ///
    /// `work` returning `Err` or panicking fails only that item's record. If
    /// the dispatcher refuses a submission, tasks already submitted are
    /// cancelled and the error is returned.
    pub fn run<I, O, E, F, D>(
        &self,
        items: impl IntoIterator<Item = I>,
        work: F,
        dispatcher: &D,
    ) -> Result<Batch<I, O>, HarnessError>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        E: fmt::Display,
        F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
        D: Dispatcher + ?Sized,
    {
        let tracker = Arc::new(ConcurrencyTracker::new(self.sampling));
        let work = Arc::new(work);
        let started = Instant::now();
        let mut handles: Vec<TaskHandle<I, O>> = Vec::new();

        for (index, input) in items.into_iter().enumerate() {
            let slot = Arc::new(Slot::new());
            let token = CancelToken::new();
            let job = {
                let (slot, token, tracker, work) =
                    (slot.clone(), token.clone(), tracker.clone(), work.clone());
                let (input, lag) = (input.clone(), self.lag);
                move || run_task(index, input, &*work, lag, &tracker, &token, &slot)
            };
            if let Err(source) = dispatcher.submit(Box::new(job)) {
                warn!(index, dispatcher = %dispatcher.name(), error = %source, "submit failed, cancelling batch");
                for handle in &handles {
                    handle.cancel();
                }
                return Err(HarnessError::Dispatch { index, source });
            }
            handles.push(TaskHandle {
                index,
                input,
                slot,
                token,
            });
        }

        debug!(tasks = handles.len(), dispatcher = %dispatcher.name(), lag = ?self.lag, "batch submitted");
        Ok(Batch {
            handles,
            context: BatchContext {
                tracker,
                dispatcher: dispatcher.name(),
                sampling: self.sampling,
                started,
            },
        })
    }

    /// [`run`](Self::run) for work that cannot fail (it may still panic).
    pub fn run_infallible<I, O, F, D>(
        &self,
        items: impl IntoIterator<Item = I>,
        work: F,
        dispatcher: &D,
    ) -> Result<Batch<I, O>, HarnessError>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> O + Send + Sync + 'static,
        D: Dispatcher + ?Sized,
    {
        self.run(items, move |i| Ok::<O, Infallible>(work(i)), dispatcher)
    }
}

fn run_task<I, O, E, F>(
    index: usize,
    input: I,
    work: &F,
    lag: Option<LagSpec>,
    tracker: &ConcurrencyTracker,
    token: &CancelToken,
    slot: &Slot<O>,
) where
    E: fmt::Display,
    F: Fn(I) -> Result<O, E>,
{
    if token.is_cancelled() {
        trace!(index, "task cancelled before start");
        slot.publish(token, None);
        return;
    }
    let _context = token.enter();
    let outcome = {
        let _in_flight = tracker.track();
        let on_interrupt = |i: crate::lag::Interrupted| trace!(index, elapsed = ?i.elapsed, "task lag interrupted");
        if let Some(lag) = lag {
            lag.wait_or_else(on_interrupt);
        }
        // The error is rendered inside the guard: a panicking Display must
        // still fail only this record.
        let guarded = panic::catch_unwind(AssertUnwindSafe(|| {
            work(input).map_err(|e| e.to_string())
        }));
        let outcome = guarded.unwrap_or_else(|payload| Err(panic_message(payload.as_ref())));
        if let Some(lag) = lag {
            lag.wait_or_else(on_interrupt);
        }
        outcome
    };
    if let Err(message) = &outcome {
        trace!(index, %message, "task failed");
    }
    slot.publish(token, Some(outcome));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

struct BatchContext {
    tracker: Arc<ConcurrencyTracker>,
    dispatcher: String,
    sampling: PeakSampling,
    started: Instant,
}

impl BatchContext {
    fn report<I, O>(&self, mut records: Vec<TaskRecord<I, O>>, partial: bool) -> BatchReport<I, O> {
        records.sort_by_key(|r| r.index);
        BatchReport {
            records,
            peak: self.tracker.peak(),
            in_flight: self.tracker.current(),
            sampling: self.sampling,
            dispatcher: self.dispatcher.clone(),
            elapsed: self.started.elapsed(),
            partial,
        }
    }
}

/// A submitted batch that has not been joined yet.
pub struct Batch<I, O> {
    handles: Vec<TaskHandle<I, O>>,
    context: BatchContext,
}

impl<I, O> Batch<I, O> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[TaskHandle<I, O>] {
        &self.handles
    }

    /// Tasks currently between `enter()` and `exit()`.
    pub fn in_flight(&self) -> i64 {
        self.context.tracker.current()
    }

    /// High-water mark so far; final only after the batch is joined.
    pub fn peak_so_far(&self) -> i64 {
        self.context.tracker.peak()
    }

    /// Cancel every unfinished task. Returns how many requests landed.
    pub fn cancel_all(&self) -> usize {
        self.handles.iter().filter(|h| h.cancel()).count()
    }

    /// Wait for every task, at most `timeout` if given.
    pub fn join(self, timeout: Option<Duration>) -> JoinOutcome<I, O> {
        join_handles(Vec::new(), self.handles, self.context, timeout)
    }

    /// Wait for every task with no deadline.
    pub fn join_all(self) -> BatchReport<I, O> {
        match self.join(None) {
            JoinOutcome::Complete(report) => report,
            // Unreachable without a deadline, but resolve it rather than panic.
            JoinOutcome::TimedOut(timeout) => timeout.wait(None).accept_partial_if_timed_out(),
        }
    }
}

fn join_handles<I, O>(
    mut completed: Vec<TaskRecord<I, O>>,
    pending: Vec<TaskHandle<I, O>>,
    context: BatchContext,
    timeout: Option<Duration>,
) -> JoinOutcome<I, O> {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    for handle in &pending {
        if !handle.slot.wait_until(deadline) {
            break;
        }
    }

    let mut still_pending = Vec::new();
    for handle in pending {
        if handle.is_finished() {
            completed.push(handle.into_record());
        } else {
            still_pending.push(handle);
        }
    }

    if still_pending.is_empty() {
        let report = context.report(completed, false);
        debug!(tasks = report.records.len(), peak = report.peak, "batch joined");
        JoinOutcome::Complete(report)
    } else {
        completed.sort_by_key(|r| r.index);
        warn!(
            completed = completed.len(),
            pending = still_pending.len(),
            timeout = ?timeout,
            "batch join timed out"
        );
        JoinOutcome::TimedOut(JoinTimeout {
            completed,
            pending: still_pending,
            context,
        })
    }
}

/// Result of [`Batch::join`].
#[must_use = "a timed-out join must be resolved explicitly"]
pub enum JoinOutcome<I, O> {
    /// Every task reached a terminal status.
    Complete(BatchReport<I, O>),
    /// The deadline passed with tasks still pending.
    TimedOut(JoinTimeout<I, O>),
}

impl<I, O> JoinOutcome<I, O> {
    pub fn is_complete(&self) -> bool {
        matches!(self, JoinOutcome::Complete(_))
    }

    pub fn into_result(self) -> Result<BatchReport<I, O>, JoinTimeout<I, O>> {
        match self {
            JoinOutcome::Complete(report) => Ok(report),
            JoinOutcome::TimedOut(timeout) => Err(timeout),
        }
    }

    fn accept_partial_if_timed_out(self) -> BatchReport<I, O> {
        match self {
            JoinOutcome::Complete(report) => report,
            JoinOutcome::TimedOut(timeout) => timeout.accept_partial(),
        }
    }
}

/// A join whose deadline passed. Resolve it with
/// [`cancel_remaining`](Self::cancel_remaining), [`wait`](Self::wait) or
/// [`accept_partial`](Self::accept_partial).
#[must_use = "a timed-out join must be resolved explicitly"]
pub struct JoinTimeout<I, O> {
    completed: Vec<TaskRecord<I, O>>,
    pending: Vec<TaskHandle<I, O>>,
    context: BatchContext,
}

impl<I, O> JoinTimeout<I, O> {
    /// Records of tasks that finished before the deadline, in batch order.
    pub fn completed(&self) -> &[TaskRecord<I, O>] {
        &self.completed
    }

    /// Handles of tasks still queued or running.
    pub fn pending(&self) -> &[TaskHandle<I, O>] {
        &self.pending
    }

    /// Cancel everything pending, then join again for at most `grace`.
    pub fn cancel_remaining(self, grace: Option<Duration>) -> JoinOutcome<I, O> {
        let cancelled = self.pending.iter().filter(|h| h.cancel()).count();
        debug!(cancelled, "cancelled pending tasks after join timeout");
        join_handles(self.completed, self.pending, self.context, grace)
    }

    /// Keep waiting without cancelling.
    pub fn wait(self, timeout: Option<Duration>) -> JoinOutcome<I, O> {
        join_handles(self.completed, self.pending, self.context, timeout)
    }

    /// Stop waiting. Unfinished tasks appear as `Pending` records and the
    /// report is marked partial; those tasks keep running in the background.
    pub fn accept_partial(self) -> BatchReport<I, O> {
        let mut records = self.completed;
        records.extend(self.pending.into_iter().map(TaskHandle::into_record));
        self.context.report(records, true)
    }
}

impl<I, O> fmt::Debug for JoinTimeout<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinTimeout")
            .field("completed", &self.completed.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<I, O> fmt::Display for JoinTimeout<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "join timed out with {} of {} tasks still pending",
            self.pending.len(),
            self.pending.len() + self.completed.len()
        )
    }
}

/// Everything a joined batch produced.
#[derive(Clone, Debug)]
pub struct BatchReport<I, O> {
    /// One record per item, in batch order.
    pub records: Vec<TaskRecord<I, O>>,
    /// Tracker high-water mark.
    pub peak: i64,
    /// Tracker reading when the report was built. Zero unless partial.
    pub in_flight: i64,
    pub sampling: PeakSampling,
    pub dispatcher: String,
    /// From first submission to join.
    pub elapsed: Duration,
    /// Set when built by [`JoinTimeout::accept_partial`].
    pub partial: bool,
}

impl<I, O> BatchReport<I, O> {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskStatus::Cancelled)
    }

    pub fn pending(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    /// Values of succeeded tasks, in batch order.
    pub fn results(&self) -> impl Iterator<Item = &O> {
        self.records
            .iter()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .filter_map(|r| r.result.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FixedPool;

    #[test]
    fn test_empty_batch_joins_immediately() {
        let pool = FixedPool::new(2).unwrap();
        let batch = TaskHarness::new()
            .run_infallible(Vec::<u32>::new(), |x| x, &pool)
            .unwrap();
        assert!(batch.is_empty());
        let report = batch.join_all();
        assert!(report.records.is_empty());
        assert_eq!(report.peak, 0);
        assert!(!report.partial);
    }

    #[test]
    fn test_handle_result_and_status() {
        let pool = FixedPool::new(2).unwrap();
        let batch = TaskHarness::new()
            .run(
                vec![1u32, 2],
                |x| if x == 2 { Err(format!("bad input {}", x)) } else { Ok(x * 10) },
                &pool,
            )
            .unwrap();
        let handles = batch.handles();
        assert_eq!(handles[0].result(Some(Duration::from_secs(5))), Ok(10));
        assert_eq!(
            handles[1].result(Some(Duration::from_secs(5))),
            Err(TaskError::Failed("bad input 2".to_string()))
        );
        assert_eq!(handles[0].status(), TaskStatus::Succeeded);
        assert!(!handles[0].cancel(), "finished task cannot be cancelled");
        let report = batch.join_all();
        assert_eq!(report.results().copied().collect::<Vec<_>>(), vec![10]);
    }

    #[test]
    fn test_result_timeout() {
        let pool = FixedPool::new(1).unwrap();
        let batch = TaskHarness::new()
            .with_lag(LagSpec::fixed(Duration::from_millis(200)))
            .run_infallible(vec![1u8], |x| x, &pool)
            .unwrap();
        assert_eq!(
            batch.handles()[0].result(Some(Duration::from_millis(10))),
            Err(TaskError::Timeout(Duration::from_millis(10)))
        );
        let report = batch.join_all();
        assert_eq!(report.succeeded(), 1);
    }

    #[test]
    fn test_panic_message_captured() {
        let pool = FixedPool::new(1).unwrap();
        let report = TaskHarness::new()
            .run_infallible(vec![0u8], |_| -> u8 { panic!("kaboom") }, &pool)
            .unwrap()
            .join_all();
        assert_eq!(report.failed(), 1);
        assert_eq!(report.records[0].failure.as_deref(), Some("panicked: kaboom"));
    }
}
