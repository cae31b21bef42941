//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a sticky flag with a condvar, so a thread sleeping on
//! it wakes as soon as it is cancelled. Each thread also has a *cancellation
//! context*: the token installed for whatever task is currently running on it.
//! Lag waits consult that context when no token is passed explicitly.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Signal {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cancellation token shared between a task and whoever may cancel it.
///
/// Once cancelled it stays cancelled; nothing in this crate resets it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    signal: Arc<Signal>,
}

/// How a [`CancelToken::sleep`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sleep {
    /// Slept the full duration.
    Completed,
    /// Woke early because the token was cancelled.
    Cancelled { elapsed: Duration },
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every sleeper. Returns `true` if this call was
    /// the one that cancelled the token.
    pub fn cancel(&self) -> bool {
        let _guard = self
            .signal
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let already = self.signal.flag.swap(true, Ordering::AcqRel);
        self.signal.wake.notify_all();
        !already
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.flag.load(Ordering::Acquire)
    }

    /// Block for up to `duration`, returning early if the token is cancelled.
    /// A token that is already cancelled returns immediately with zero elapsed.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        let start = Instant::now();
        let deadline = start.checked_add(duration);
        let mut guard = self
            .signal
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            // Checked under the lock: `cancel` flips the flag while holding it.
            if self.signal.flag.load(Ordering::Acquire) {
                return Sleep::Cancelled {
                    elapsed: start.elapsed(),
                };
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Sleep::Completed;
                    }
                    deadline - now
                }
                None => Duration::from_secs(u32::MAX as u64),
            };
            guard = self
                .signal
                .wake
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Install this token as the calling thread's cancellation context until
    /// the returned guard is dropped. Guards nest; dropping restores the
    /// previous context.
    pub fn enter(&self) -> ContextGuard {
        let previous = CONTEXT.with(|cell| cell.borrow_mut().replace(self.clone()));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

/// Restores the previous cancellation context on drop.
#[must_use = "the context is uninstalled as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<CancelToken>,
    // The guard manipulates a thread-local; it must be dropped on the thread that made it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|cell| *cell.borrow_mut() = previous);
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<CancelToken>> = RefCell::new(None);
}

/// The token installed on the calling thread, if any.
pub fn current() -> Option<CancelToken> {
    CONTEXT.with(|cell| cell.borrow().clone())
}

/// Whether the calling thread's cancellation context has been signaled.
/// A thread with no context is never cancelled.
pub fn is_cancelled() -> bool {
    CONTEXT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false)
    })
}
