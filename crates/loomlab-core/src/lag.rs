//! Induced lag: bounded, optionally randomized, interruptible waits that
//! stand in for blocking I/O.
//!
//! ```
//! use std::time::Duration;
//! use loomlab_core::LagSpec;
//!
//! let simple = LagSpec::fixed(Duration::from_millis(1));
//! let random = LagSpec::new(Duration::from_millis(1), Duration::from_millis(10)).unwrap();
//! simple.wait_or_else(|_| {});          // sleeps 1ms
//! let slept = random.wait_or_else(|_| {});
//! assert!(slept >= Duration::from_millis(1) && slept <= Duration::from_millis(10));
//! ```

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cancel::{self, CancelToken, Sleep};
use crate::error::LagError;

/// Range a lag is drawn from. `minimum <= maximum` always holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "LagMillis", into = "LagMillis")]
pub struct LagSpec {
    minimum: Duration,
    maximum: Duration,
}

/// Details handed to an interrupt handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupted {
    /// The duration that was computed for this wait.
    pub planned: Duration,
    /// How long the wait actually lasted before cancellation.
    pub elapsed: Duration,
}

enum Waited {
    Slept(Duration),
    Interrupted(Interrupted),
}

impl LagSpec {
    pub fn new(minimum: Duration, maximum: Duration) -> Result<Self, LagError> {
        if minimum > maximum {
            return Err(LagError::InvalidLagRange { minimum, maximum });
        }
        Ok(Self { minimum, maximum })
    }

    /// Always waits exactly `duration`.
    pub fn fixed(duration: Duration) -> Self {
        Self {
            minimum: duration,
            maximum: duration,
        }
    }

    /// Zero lag: waiting only yields the thread.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Milliseconds convenience used by config and the CLI.
    pub fn from_millis(minimum: u64, maximum: u64) -> Result<Self, LagError> {
        Self::new(Duration::from_millis(minimum), Duration::from_millis(maximum))
    }

    pub fn minimum(&self) -> Duration {
        self.minimum
    }

    pub fn maximum(&self) -> Duration {
        self.maximum
    }

    pub fn is_minimal(&self) -> bool {
        self.minimum.is_zero() && self.maximum.is_zero()
    }

    /// Pick a duration in `[minimum, maximum]` using the thread-local RNG.
    pub fn compute_duration(&self) -> Duration {
        self.compute_duration_with(&mut rand::thread_rng())
    }

    /// Pick a duration in `[minimum, maximum]`.
    ///
    /// `0/0` yields zero, a fixed range yields its bound without touching
    /// `rng`, anything else is `minimum` plus a uniform offset in nanoseconds.
    pub fn compute_duration_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.is_minimal() {
            return Duration::ZERO;
        }
        let spread = self.maximum - self.minimum;
        if spread.is_zero() {
            return self.minimum;
        }
        let spread_nanos = u64::try_from(spread.as_nanos()).unwrap_or(u64::MAX);
        self.minimum + Duration::from_nanos(rng.gen_range(0..=spread_nanos))
    }

    /// Wait a computed duration on the calling thread's cancellation context.
    ///
    /// If the context is cancelled before or during the wait this returns
    /// [`LagError::InterruptedWait`]; the context stays cancelled so callers
    /// further out can still see it. Outside any context the wait cannot be
    /// interrupted.
    pub fn wait(&self) -> Result<Duration, LagError> {
        self.wait_in(cancel::current().as_ref())
    }

    /// Like [`wait`](Self::wait) but on an explicit token.
    pub fn wait_on(&self, token: &CancelToken) -> Result<Duration, LagError> {
        self.wait_in(Some(token))
    }

    /// Wait a computed duration, handing any interruption to `on_interrupt`
    /// instead of returning an error.
    ///
    /// An interruption mid-wait still reports the full computed duration.
    /// A context that was already cancelled reports zero without sleeping.
    pub fn wait_or_else<F>(&self, on_interrupt: F) -> Duration
    where
        F: FnOnce(Interrupted),
    {
        self.wait_or_else_in(cancel::current().as_ref(), on_interrupt)
    }

    /// Like [`wait_or_else`](Self::wait_or_else) but on an explicit token.
    pub fn wait_on_or_else<F>(&self, token: &CancelToken, on_interrupt: F) -> Duration
    where
        F: FnOnce(Interrupted),
    {
        self.wait_or_else_in(Some(token), on_interrupt)
    }

    fn wait_in(&self, token: Option<&CancelToken>) -> Result<Duration, LagError> {
        match self.sleep(token) {
            Waited::Slept(d) => Ok(d),
            Waited::Interrupted(Interrupted { planned, elapsed }) => {
                Err(LagError::InterruptedWait { planned, elapsed })
            }
        }
    }

    fn wait_or_else_in<F>(&self, token: Option<&CancelToken>, on_interrupt: F) -> Duration
    where
        F: FnOnce(Interrupted),
    {
        match self.sleep(token) {
            Waited::Slept(d) => d,
            Waited::Interrupted(interrupted) => {
                on_interrupt(interrupted);
                if interrupted.elapsed.is_zero() {
                    Duration::ZERO
                } else {
                    interrupted.planned
                }
            }
        }
    }

    fn sleep(&self, token: Option<&CancelToken>) -> Waited {
        let planned = self.compute_duration();
        trace!(?planned, "lag computed");

        if let Some(token) = token {
            if token.is_cancelled() {
                debug!(?planned, "lag skipped, context already cancelled");
                return Waited::Interrupted(Interrupted {
                    planned,
                    elapsed: Duration::ZERO,
                });
            }
        }
        if planned.is_zero() {
            thread::yield_now();
            return Waited::Slept(Duration::ZERO);
        }

        match token {
            None => {
                thread::sleep(planned);
                Waited::Slept(planned)
            }
            Some(token) => match token.sleep(planned) {
                Sleep::Completed => Waited::Slept(planned),
                Sleep::Cancelled { elapsed } => {
                    debug!(?planned, ?elapsed, "lag interrupted");
                    Waited::Interrupted(Interrupted { planned, elapsed })
                }
            },
        }
    }
}

/// Wire form of [`LagSpec`]: milliseconds, fractional below one so
/// sub-millisecond lags survive a round trip.
#[derive(Clone, Copy, Serialize, Deserialize)]
struct LagMillis {
    minimum_ms: f64,
    maximum_ms: f64,
}

impl TryFrom<LagMillis> for LagSpec {
    type Error = String;

    fn try_from(m: LagMillis) -> Result<Self, Self::Error> {
        let minimum = millis_to_duration(m.minimum_ms)?;
        let maximum = millis_to_duration(m.maximum_ms)?;
        LagSpec::new(minimum, maximum).map_err(|e| e.to_string())
    }
}

impl From<LagSpec> for LagMillis {
    fn from(spec: LagSpec) -> Self {
        LagMillis {
            minimum_ms: duration_to_millis(spec.minimum),
            maximum_ms: duration_to_millis(spec.maximum),
        }
    }
}

const NANOS_PER_MILLI: f64 = 1_000_000.0;

fn duration_to_millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / NANOS_PER_MILLI
}

fn millis_to_duration(ms: f64) -> Result<Duration, String> {
    let nanos = (ms * NANOS_PER_MILLI).round();
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return Err(format!("lag of {} ms is out of range", ms));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    const MINIMUM: Duration = Duration::from_millis(10);
    const MAXIMUM: Duration = Duration::from_millis(20);

    #[test]
    fn test_inverted_range_rejected() {
        let err = LagSpec::new(MAXIMUM, MINIMUM).unwrap_err();
        assert_eq!(
            err,
            LagError::InvalidLagRange {
                minimum: MAXIMUM,
                maximum: MINIMUM
            }
        );
    }

    #[test]
    fn test_minimal_duration_is_zero() {
        assert_eq!(LagSpec::minimal().compute_duration(), Duration::ZERO);
        assert_eq!(LagSpec::minimal().wait().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_definite_duration() {
        let lag = LagSpec::fixed(MINIMUM);
        assert_eq!(lag.compute_duration(), MINIMUM);
    }

    #[test]
    fn test_random_duration_varies_inside_range() {
        let lag = LagSpec::new(MINIMUM, MAXIMUM).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<Duration> = (0..64).map(|_| lag.compute_duration_with(&mut rng)).collect();
        assert!(samples.iter().all(|d| *d >= MINIMUM && *d <= MAXIMUM));
        assert!(samples.iter().any(|d| *d != samples[0]));
    }

    proptest! {
        #[test]
        fn compute_duration_stays_in_bounds(min_ns in 0u64..5_000_000_000, spread_ns in 0u64..5_000_000_000, seed in any::<u64>()) {
            let minimum = Duration::from_nanos(min_ns);
            let maximum = minimum + Duration::from_nanos(spread_ns);
            let lag = LagSpec::new(minimum, maximum).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let d = lag.compute_duration_with(&mut rng);
            prop_assert!(d >= minimum);
            prop_assert!(d <= maximum);
        }

        #[test]
        fn inverted_ranges_always_fail(min_ns in 1u64..1_000_000_000, gap_ns in 1u64..1_000_000) {
            let minimum = Duration::from_nanos(min_ns + gap_ns);
            let maximum = Duration::from_nanos(min_ns);
            let rejected = matches!(
                LagSpec::new(minimum, maximum),
                Err(LagError::InvalidLagRange { .. })
            );
            prop_assert!(rejected);
        }
    }

    #[test]
    fn test_wait_without_context_sleeps_full_duration() {
        let lag = LagSpec::fixed(MINIMUM);
        let start = Instant::now();
        assert_eq!(lag.wait().unwrap(), MINIMUM);
        assert!(start.elapsed() >= MINIMUM);
    }

    #[test]
    fn test_wait_already_cancelled_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let lag = LagSpec::fixed(Duration::from_secs(5));
        let start = Instant::now();
        match lag.wait_on(&token) {
            Err(LagError::InterruptedWait { planned, elapsed }) => {
                assert_eq!(planned, Duration::from_secs(5));
                assert_eq!(elapsed, Duration::ZERO);
            }
            other => panic!("expected InterruptedWait, got {:?}", other),
        }
        let mut called = false;
        assert_eq!(lag.wait_on_or_else(&token, |_| called = true), Duration::ZERO);
        assert!(called);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    // value: 1 = started, 2 = interrupted, 3 = completed normally
    fn with_interrupt_handler(value: Arc<AtomicUsize>, lag: LagSpec, token: CancelToken) -> Duration {
        let _ctx = token.enter();
        value.store(1, Ordering::SeqCst);
        let reported = lag.wait_or_else(|_| value.store(2, Ordering::SeqCst));
        let _ = value.compare_exchange(1, 3, Ordering::SeqCst, Ordering::SeqCst);
        reported
    }

    #[test]
    fn test_wait_with_interrupt_handler_completes_normally() {
        let value = Arc::new(AtomicUsize::new(0));
        let lag = LagSpec::new(MINIMUM, MAXIMUM).unwrap();
        let v = value.clone();
        let h = std::thread::spawn(move || with_interrupt_handler(v, lag, CancelToken::new()));
        std::thread::sleep(MINIMUM / 2);
        assert_eq!(value.load(Ordering::SeqCst), 1);
        let reported = h.join().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 3);
        assert!(reported >= MINIMUM && reported <= MAXIMUM);
    }

    #[test]
    fn test_wait_with_interrupt_handler_returns_promptly_with_planned_duration() {
        let value = Arc::new(AtomicUsize::new(0));
        let lag = LagSpec::fixed(Duration::from_secs(2));
        let token = CancelToken::new();
        let (v, t) = (value.clone(), token.clone());
        let h = std::thread::spawn(move || {
            let start = Instant::now();
            let reported = with_interrupt_handler(v, lag, t);
            (reported, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (reported, elapsed) = h.join().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 2);
        assert_eq!(reported, Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    }

    #[test]
    fn test_wait_without_handler_leaves_context_cancelled() {
        let value = Arc::new(AtomicUsize::new(0));
        let lag = LagSpec::new(MINIMUM, MAXIMUM).unwrap();
        let token = CancelToken::new();
        let (v, t) = (value.clone(), token.clone());
        let h = std::thread::spawn(move || {
            let _ctx = t.enter();
            v.store(1, Ordering::SeqCst);
            for _ in 0..10 {
                if cancel::is_cancelled() {
                    v.store(2, Ordering::SeqCst);
                    break;
                }
                let _ = lag.wait();
            }
            let _ = v.compare_exchange(1, 3, Ordering::SeqCst, Ordering::SeqCst);
        });
        std::thread::sleep(MINIMUM * 2);
        token.cancel();
        h.join().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_serde_in_millis() {
        let lag = LagSpec::from_millis(5, 15).unwrap();
        let json = serde_json::to_string(&lag).unwrap();
        assert_eq!(json, r#"{"minimum_ms":5.0,"maximum_ms":15.0}"#);
        let back: LagSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lag);
        let whole: LagSpec = serde_json::from_str(r#"{"minimum_ms":5,"maximum_ms":15}"#).unwrap();
        assert_eq!(whole, lag);
        assert!(serde_json::from_str::<LagSpec>(r#"{"minimum_ms":9,"maximum_ms":1}"#).is_err());
        assert!(serde_json::from_str::<LagSpec>(r#"{"minimum_ms":-1,"maximum_ms":1}"#).is_err());
    }

    #[test]
    fn test_serde_keeps_sub_millisecond_lag() {
        let lag = LagSpec::fixed(Duration::from_micros(500));
        let json = serde_json::to_string(&lag).unwrap();
        assert_eq!(json, r#"{"minimum_ms":0.5,"maximum_ms":0.5}"#);
        let back: LagSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lag);
        assert!(!back.is_minimal());
    }
}
