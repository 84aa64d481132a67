use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use contextshot_contracts::runs::Interruption;

/// How a suspension ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Elapsed,
    Interrupted,
}

/// Time source for every sleep the engine takes.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Suspends for `duration`, returning early with `Wait::Interrupted` when
    /// `cancel` is cancelled or its deadline is reached.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Wait;
}

/// Cancellation flag plus an optional deadline.
///
/// Clones share the flag; `with_deadline` derives a token that also stops at
/// the given instant.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<(Mutex<bool>, Condvar)>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, signal) = &*self.flag;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.flag;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Keeps the earlier of the existing and the new deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(self.deadline.map_or(deadline, |current| current.min(deadline))),
        }
    }

    pub fn interruption(&self, now: Instant) -> Option<Interruption> {
        if self.is_cancelled() {
            return Some(Interruption::Cancelled);
        }
        match self.deadline {
            Some(deadline) if now >= deadline => Some(Interruption::DeadlineExceeded),
            _ => None,
        }
    }

    /// Blocks until `until` or cancellation; `None` waits for cancellation
    /// only. Returns true when cancelled.
    fn wait_until(&self, until: Option<Instant>) -> bool {
        let (lock, signal) = &*self.flag;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return true;
            }
            cancelled = match until {
                Some(until) => {
                    let now = Instant::now();
                    if now >= until {
                        return false;
                    }
                    signal
                        .wait_timeout(cancelled, until - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => signal.wait(cancelled).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// Wall-clock time; sleeps park the thread and wake on cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Wait {
        let until = match (Instant::now().checked_add(duration), cancel.deadline()) {
            (Some(until), Some(deadline)) => Some(until.min(deadline)),
            (until, deadline) => until.or(deadline),
        };
        if cancel.wait_until(until) || cancel.interruption(Instant::now()).is_some() {
            return Wait::Interrupted;
        }
        Wait::Elapsed
    }
}

/// Virtual time for tests: sleeping advances `now` instantly and every
/// requested duration is recorded. A sleep that would run past the range of
/// `Instant` is recorded without moving time.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sleeps.clone()
    }

    pub fn elapsed(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.elapsed
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Wait {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sleeps.push(duration);
        if cancel.is_cancelled() {
            return Wait::Interrupted;
        }
        let target = state
            .elapsed
            .checked_add(duration)
            .and_then(|elapsed| self.origin.checked_add(elapsed));
        match (target, cancel.deadline()) {
            (Some(target), Some(deadline)) if deadline <= target => {
                state.elapsed = state.elapsed.max(deadline.saturating_duration_since(self.origin));
                Wait::Interrupted
            }
            (None, Some(deadline)) => {
                state.elapsed = state.elapsed.max(deadline.saturating_duration_since(self.origin));
                Wait::Interrupted
            }
            (Some(target), _) => {
                state.elapsed = target.saturating_duration_since(self.origin);
                Wait::Elapsed
            }
            (None, None) => Wait::Elapsed,
        }
    }
}
