use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Wait before retrying after the `failed_attempts`-th failure (1-based).
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    /// Mutually independent ready steps share a bounded pool of scoped threads.
    Bounded {
        max_workers: usize,
        per_capability: usize,
    },
}

/// Explicit knobs the engine runs under; never read from process state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Total attempts per step, first call included.
    pub max_attempts: u32,
    pub step_timeout: Option<Duration>,
    pub run_deadline: Option<Duration>,
    pub backoff: BackoffPolicy,
    /// Steps treated as critical in addition to those the plan marks.
    pub critical_steps: BTreeSet<String>,
    pub mode: ExecutionMode,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step_timeout: Some(Duration::from_secs(30)),
            run_deadline: None,
            backoff: BackoffPolicy::default(),
            critical_steps: BTreeSet::new(),
            mode: ExecutionMode::Sequential,
        }
    }
}

impl ExecutionPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_critical_step(mut self, step_id: impl Into<String>) -> Self {
        self.critical_steps.insert(step_id.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Cloneable handle that lets a caller cancel a run from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Run-scoped cancellation: the optional deadline plus the caller's handle.
#[derive(Debug, Clone)]
pub struct RunCancellation {
    deadline: Option<Instant>,
    handle: CancelHandle,
}

impl RunCancellation {
    pub fn new(deadline: Option<Instant>, handle: CancelHandle) -> Self {
        Self { deadline, handle }
    }

    pub fn starting_now(run_deadline: Option<Duration>, handle: CancelHandle) -> Self {
        Self::new(run_deadline.map(|limit| Instant::now() + limit), handle)
    }

    pub fn never() -> Self {
        Self::new(None, CancelHandle::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sleeps for `total` unless the run is cancelled first; returns whether
    /// the full wait elapsed.
    pub fn sleep(&self, total: Duration) -> bool {
        let wake_at = Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= wake_at {
                return true;
            }
            let mut step = (wake_at - now).min(CANCEL_POLL_INTERVAL);
            if let Some(deadline) = self.deadline {
                step = step.min(deadline.saturating_duration_since(now));
            }
            thread::sleep(step);
        }
    }

    /// Blocks until `receiver` yields or its sender is dropped, unless the run
    /// is cancelled first; returns whether the wait finished.
    pub fn wait_for<T>(&self, receiver: &Receiver<T>) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let mut step = CANCEL_POLL_INTERVAL;
            if let Some(deadline) = self.deadline {
                step = step.min(deadline.saturating_duration_since(Instant::now()));
            }
            match receiver.recv_timeout(step) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_up_to_the_cap() {
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn cancelled_runs_cut_sleeps_short() {
        let handle = CancelHandle::new();
        let cancellation = RunCancellation::new(None, handle.clone());
        handle.cancel();
        let started = Instant::now();
        assert!(!cancellation.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn deadlines_interrupt_sleeps() {
        let cancellation =
            RunCancellation::starting_now(Some(Duration::from_millis(30)), CancelHandle::new());
        let started = Instant::now();
        assert!(!cancellation.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(cancellation.is_cancelled());
    }

    #[test]
    fn uncancelled_sleeps_run_to_completion() {
        assert!(RunCancellation::never().sleep(Duration::from_millis(5)));
    }

    #[test]
    fn waits_on_workers_end_when_they_finish_or_the_run_is_cancelled() {
        let (sender, receiver) = std::sync::mpsc::channel::<()>();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            drop(sender);
        });
        assert!(RunCancellation::never().wait_for(&receiver));
        worker.join().expect("worker thread");

        let (_sender, receiver) = std::sync::mpsc::channel::<()>();
        let cancellation =
            RunCancellation::starting_now(Some(Duration::from_millis(30)), CancelHandle::new());
        let started = Instant::now();
        assert!(!cancellation.wait_for(&receiver));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
