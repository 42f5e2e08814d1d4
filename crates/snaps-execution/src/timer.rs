//! Pausable countdown used for every timeout in the runtime.
//!
//! A [`Timer`] counts down on the Tokio clock, so tests running with a paused
//! clock observe deterministic expiry. Pausing freezes the remaining budget;
//! resuming continues from it. [`with_timer`] races any future against a
//! timer and reports expiry as [`TimedOut`] rather than as an error of the
//! raced operation, so callers can tell "timed out" apart from any value the
//! operation could legitimately produce.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Observable state of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// Created but not started.
    Idle,
    /// Counting down.
    Running,
    /// Countdown suspended.
    Paused,
    /// Expired, finished, or cancelled.
    Finished,
}

/// Misuse of the timer API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    /// `start` was called on a timer that is running or paused.
    #[error("timer has already been started")]
    AlreadyStarted,
    /// `pause` was called on a timer that is not running.
    #[error("timer is not running")]
    NotRunning,
    /// `resume` was called on a timer that is not paused.
    #[error("timer is not paused")]
    NotPaused,
    /// The timer already reached its end.
    #[error("timer has already finished")]
    AlreadyFinished,
}

/// Sentinel returned when a raced operation loses against its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out")]
pub struct TimedOut;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct TimerState {
    status: TimerStatus,
    remaining: Duration,
    resumed_at: Option<Instant>,
    callback: Option<Callback>,
    task: Option<JoinHandle<()>>,
    // Bumped whenever a scheduled expiry becomes stale.
    generation: u64,
}

impl TimerState {
    fn remaining_now(&self) -> Duration {
        match self.resumed_at {
            Some(resumed_at) => self.remaining.saturating_sub(resumed_at.elapsed()),
            None => self.remaining,
        }
    }

    fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.resumed_at = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct TimerShared {
    state: Mutex<TimerState>,
    expired: watch::Sender<bool>,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, generation: u64) {
        let callback = {
            let mut state = self.lock();
            if state.generation != generation || state.status != TimerStatus::Running {
                return;
            }
            state.status = TimerStatus::Finished;
            state.remaining = Duration::ZERO;
            state.resumed_at = None;
            state.task = None;
            state.callback.take()
        };
        self.fire(callback);
    }

    fn fire(&self, callback: Option<Callback>) {
        if let Some(callback) = callback {
            callback();
        }
        self.expired.send_replace(true);
    }
}

impl Drop for TimerShared {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

/// A pausable, resumable, cancellable countdown.
///
/// Clones share the same countdown.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Creates an idle timer with the given budget.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        let (expired, _) = watch::channel(false);
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    status: TimerStatus::Idle,
                    remaining: duration,
                    resumed_at: None,
                    callback: None,
                    task: None,
                    generation: 0,
                }),
                expired,
            }),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TimerStatus {
        self.shared.lock().status
    }

    /// Budget left before expiry.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.shared.lock().remaining_now()
    }

    /// Starts the countdown; `callback` runs once on expiry or [`Timer::finish`].
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::AlreadyStarted`] or [`TimerError::AlreadyFinished`]
    /// unless the timer is idle.
    pub fn start(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), TimerError> {
        let mut state = self.shared.lock();
        match state.status {
            TimerStatus::Idle => {}
            TimerStatus::Finished => return Err(TimerError::AlreadyFinished),
            TimerStatus::Running | TimerStatus::Paused => return Err(TimerError::AlreadyStarted),
        }
        state.callback = Some(Box::new(callback));
        self.schedule(&mut state);
        Ok(())
    }

    /// Suspends the countdown, keeping the remaining budget.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NotRunning`] unless the timer is running.
    pub fn pause(&self) -> Result<(), TimerError> {
        let mut state = self.shared.lock();
        if state.status != TimerStatus::Running {
            return Err(TimerError::NotRunning);
        }
        state.remaining = state.remaining_now();
        state.invalidate();
        state.status = TimerStatus::Paused;
        Ok(())
    }

    /// Continues a paused countdown.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NotPaused`] unless the timer is paused.
    pub fn resume(&self) -> Result<(), TimerError> {
        let mut state = self.shared.lock();
        if state.status != TimerStatus::Paused {
            return Err(TimerError::NotPaused);
        }
        self.schedule(&mut state);
        Ok(())
    }

    /// Stops the countdown without running the callback.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::AlreadyFinished`] when the timer already ended.
    pub fn cancel(&self) -> Result<(), TimerError> {
        let mut state = self.shared.lock();
        if state.status == TimerStatus::Finished {
            return Err(TimerError::AlreadyFinished);
        }
        state.invalidate();
        state.status = TimerStatus::Finished;
        state.callback = None;
        Ok(())
    }

    /// Expires the timer immediately, running the callback.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::AlreadyFinished`] when the timer already ended.
    pub fn finish(&self) -> Result<(), TimerError> {
        let callback = {
            let mut state = self.shared.lock();
            if state.status == TimerStatus::Finished {
                return Err(TimerError::AlreadyFinished);
            }
            state.invalidate();
            state.status = TimerStatus::Finished;
            state.remaining = Duration::ZERO;
            state.callback.take()
        };
        self.shared.fire(callback);
        Ok(())
    }

    /// Resolves once the timer expires or is finished. Never resolves for a
    /// cancelled timer.
    pub async fn expired(&self) {
        let mut receiver = self.shared.expired.subscribe();
        while !*receiver.borrow_and_update() {
            // The sender lives in `self`, so the channel cannot close here.
            if receiver.changed().await.is_err() {
                break;
            }
        }
    }

    /// Starts an idle timer without a callback. Returns `false` when the
    /// timer already finished.
    fn arm(&self) -> bool {
        let mut state = self.shared.lock();
        match state.status {
            TimerStatus::Finished => false,
            TimerStatus::Idle => {
                self.schedule(&mut state);
                true
            }
            TimerStatus::Running | TimerStatus::Paused => true,
        }
    }

    fn schedule(&self, state: &mut TimerState) {
        state.invalidate();
        state.status = TimerStatus::Running;
        state.resumed_at = Some(Instant::now());
        let generation = state.generation;
        let delay = state.remaining;
        let shared = Arc::downgrade(&self.shared);
        state.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire(generation);
            }
        }));
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Timer")
            .field("status", &state.status)
            .field("remaining", &state.remaining_now())
            .finish()
    }
}

/// Races `future` against `timer`.
///
/// An idle timer is started; a finished timer times out immediately; a paused
/// timer never expires while paused.
///
/// # Errors
///
/// Returns [`TimedOut`] when the timer expires first.
pub async fn with_timer<F>(timer: &Timer, future: F) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    if !timer.arm() {
        return Err(TimedOut);
    }
    tokio::select! {
        biased;
        output = future => Ok(output),
        () = timer.expired() => Err(TimedOut),
    }
}

/// Races `future` against a fresh timer of `duration`.
///
/// # Errors
///
/// Returns [`TimedOut`] when `duration` elapses first.
pub async fn with_timeout<F>(duration: Duration, future: F) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    with_timer(&Timer::new(duration), future).await
}
