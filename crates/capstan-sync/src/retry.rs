//! Bounded retry with configurable backoff.
//!
//! [`retry`] drives an operation that distinguishes "done", "not ready yet",
//! and "broken" through the [`Attempt`] variants, sleeping between attempts
//! according to a [`RetryPolicy`]. The overall budget is a wall-clock
//! deadline: each pause is clamped so the loop never knowingly sleeps past
//! it, and exhausting the budget surfaces as [`RetryError::Timeout`] rather
//! than the internal try-again signal.

use std::cell::Cell;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

thread_local! {
    static IN_RETRY: Cell<bool> = const { Cell::new(false) };
}

/// Outcome of a single attempt inside [`retry`].
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The operation finished; the loop ends and yields the value.
    Done(T),
    /// The condition is not ready yet; the loop sleeps and tries again.
    TryAgain,
    /// The operation failed for good; the loop aborts immediately.
    Failed(E),
}

/// Delay schedule applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// The same pause before every attempt.
    Fixed(Duration),
    /// Geometric growth capped at a ceiling.
    Exponential {
        /// Pause before the second attempt.
        initial: Duration,
        /// Growth factor per attempt; values below `1.0` are treated as `1.0`.
        factor: f64,
        /// Upper bound on any single pause.
        ceiling: Duration,
    },
}

impl Backoff {
    /// Materialises the schedule so callers driving their own wait loops
    /// can walk the same pause curve [`retry`] uses.
    #[must_use]
    pub fn schedule(self) -> Schedule {
        match self {
            Self::Fixed(delay) => Schedule {
                next: delay,
                factor: 1.0,
                ceiling: delay,
            },
            Self::Exponential {
                initial,
                factor,
                ceiling,
            } => Schedule {
                next: initial.min(ceiling),
                factor: factor.max(1.0),
                ceiling,
            },
        }
    }
}

/// Stream of successive pauses produced by a [`Backoff`].
#[derive(Debug)]
pub struct Schedule {
    next: Duration,
    factor: f64,
    ceiling: Duration,
}

impl Schedule {
    /// Returns the next pause and advances the schedule.
    pub fn step(&mut self) -> Duration {
        let current = self.next;
        // The growth happens in float space; a factor large enough to
        // overflow `Duration` saturates at the ceiling instead of panicking.
        let scaled = current.as_secs_f64() * self.factor;
        self.next = if scaled.is_finite() && scaled < self.ceiling.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.ceiling
        };
        current
    }
}

/// Retry budget: a backoff schedule plus an overall wall-clock timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    backoff: Backoff,
    timeout: Duration,
}

impl RetryPolicy {
    /// Policy pausing `delay` between attempts until `timeout` elapses.
    #[must_use]
    pub const fn fixed(delay: Duration, timeout: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
            timeout,
        }
    }

    /// Policy whose pause starts at `initial` and grows by `factor` per
    /// attempt, capped at `ceiling`, until `timeout` elapses.
    #[must_use]
    pub const fn exponential(
        initial: Duration,
        factor: f64,
        ceiling: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial,
                factor,
                ceiling,
            },
            timeout,
        }
    }

    /// Overall wall-clock budget of this policy.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Failure modes of [`retry`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation kept reporting [`Attempt::TryAgain`] past the budget.
    #[error("operation still not ready after {attempts} attempts over {timeout:?}")]
    Timeout {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Budget that was exhausted.
        timeout: Duration,
    },
    /// The operation reported [`Attempt::Failed`]; no further attempts ran.
    #[error("operation failed: {0}")]
    Failed(E),
    /// [`retry`] was entered from inside an attempt already running under
    /// [`retry`] on this thread. This is caller misuse, not a transient
    /// condition, and is reported before the first attempt.
    #[error("retry invoked re-entrantly on the same thread")]
    Nested,
}

struct ReentryGuard;

impl ReentryGuard {
    fn enter<E>() -> Result<Self, RetryError<E>> {
        let already_active = IN_RETRY.with(|flag| flag.replace(true));
        if already_active {
            // The outer invocation still owns the flag; leave it set.
            return Err(RetryError::Nested);
        }
        Ok(Self)
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_RETRY.with(|flag| flag.set(false));
    }
}

/// Runs `op` until it reports [`Attempt::Done`], pausing between attempts
/// per `policy`.
///
/// The first attempt runs immediately. After an [`Attempt::TryAgain`] the
/// loop checks the deadline, then sleeps the lesser of the next scheduled
/// pause and the time remaining, so control returns at or shortly after the
/// deadline. [`Attempt::Failed`] aborts at once with the operation's own
/// error.
///
/// # Errors
/// [`RetryError::Timeout`] when the budget lapses whilst the operation keeps
/// asking to try again, [`RetryError::Failed`] when an attempt fails
/// outright, and [`RetryError::Nested`] when invoked re-entrantly on the
/// same thread.
pub fn retry<T, E, F>(policy: RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Attempt<T, E>,
{
    let _guard = ReentryGuard::enter::<E>()?;
    let deadline = Instant::now() + policy.timeout;
    let mut pauses = policy.backoff.schedule();
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match op() {
            Attempt::Done(value) => return Ok(value),
            Attempt::Failed(error) => return Err(RetryError::Failed(error)),
            Attempt::TryAgain => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(RetryError::Timeout {
                attempts,
                timeout: policy.timeout,
            });
        }
        thread::sleep(pauses.step().min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rstest::rstest;

    use super::{Attempt, Backoff, RetryError, RetryPolicy, retry};

    const QUICK_POLICY: RetryPolicy =
        RetryPolicy::fixed(Duration::from_millis(1), Duration::from_millis(200));

    #[test]
    fn first_success_returns_immediately() {
        let started = Instant::now();
        let outcome: Result<u32, RetryError<String>> =
            retry(QUICK_POLICY, || Attempt::Done(42));
        assert_eq!(outcome.expect("first attempt succeeds"), 42);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn transient_attempts_eventually_succeed() {
        let mut remaining_transients = 2_u32;
        let outcome: Result<&str, RetryError<String>> = retry(QUICK_POLICY, || {
            if remaining_transients == 0 {
                Attempt::Done("ready")
            } else {
                remaining_transients -= 1;
                Attempt::TryAgain
            }
        });
        assert_eq!(outcome.expect("third attempt succeeds"), "ready");
    }

    #[test]
    fn failure_aborts_without_further_attempts() {
        let mut attempts = 0_u32;
        let outcome: Result<(), RetryError<&str>> = retry(QUICK_POLICY, || {
            attempts += 1;
            Attempt::Failed("broken")
        });
        assert!(matches!(outcome, Err(RetryError::Failed("broken"))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn exhausted_budget_reports_timeout_near_deadline() {
        let timeout = Duration::from_millis(50);
        let policy = RetryPolicy::fixed(Duration::from_millis(5), timeout);
        let started = Instant::now();
        let outcome: Result<(), RetryError<String>> = retry(policy, || Attempt::TryAgain);
        let elapsed = started.elapsed();
        match outcome {
            Err(RetryError::Timeout { attempts, .. }) => assert!(attempts >= 2),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= timeout);
        // Pauses are clamped to the remaining budget, so overshoot is only
        // scheduling jitter.
        assert!(elapsed < timeout + Duration::from_millis(150));
    }

    #[test]
    fn nested_invocation_is_rejected_and_outer_continues() {
        let outcome: Result<u8, RetryError<String>> = retry(QUICK_POLICY, || {
            let inner: Result<u8, RetryError<String>> =
                retry(QUICK_POLICY, || Attempt::Done(1));
            assert!(matches!(inner, Err(RetryError::Nested)));
            Attempt::Done(7)
        });
        assert_eq!(outcome.expect("outer loop unaffected"), 7);
    }

    #[test]
    fn guard_releases_after_completion() {
        let first: Result<(), RetryError<String>> = retry(
            RetryPolicy::fixed(Duration::from_millis(1), Duration::from_millis(5)),
            || Attempt::TryAgain,
        );
        assert!(matches!(first, Err(RetryError::Timeout { .. })));
        let second: Result<u8, RetryError<String>> = retry(QUICK_POLICY, || Attempt::Done(3));
        assert_eq!(second.expect("guard reset after timeout"), 3);
    }

    #[rstest]
    #[case(Backoff::Fixed(Duration::from_millis(10)), vec![10, 10, 10])]
    #[case(
        Backoff::Exponential {
            initial: Duration::from_millis(10),
            factor: 2.0,
            ceiling: Duration::from_millis(25),
        },
        vec![10, 20, 25, 25],
    )]
    #[case(
        Backoff::Exponential {
            initial: Duration::from_millis(10),
            factor: 0.5,
            ceiling: Duration::from_millis(40),
        },
        vec![10, 10, 10],
    )]
    #[case(
        Backoff::Exponential {
            initial: Duration::from_secs(1),
            factor: 1e300,
            ceiling: Duration::from_secs(2),
        },
        vec![1000, 2000, 2000],
    )]
    fn schedules_follow_their_curve(#[case] backoff: Backoff, #[case] expected_millis: Vec<u64>) {
        let mut schedule = backoff.schedule();
        for expected in expected_millis {
            assert_eq!(schedule.step(), Duration::from_millis(expected));
        }
    }
}
