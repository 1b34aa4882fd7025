//! Per-probe circuit breaker
//!
//! Converts sustained probe failure into cheap, fast failures for the
//! duration of a recovery window, sparing the target. One breaker per
//! probe; there is no global breaker.

use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::probes::{ProbeError, ProbeResult};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls pass through
    Closed = 0,
    /// Tripped, calls fail immediately
    Open = 1,
    /// Recovery window elapsed, the next call is a trial
    HalfOpen = 2,
}

impl BreakerState {
    /// Stable label for logs and the health snapshot
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Failure-counting state machine wrapping a single probe's check.
///
/// State transitions:
/// - closed → open once the failure tally reaches the threshold
/// - open → half-open after `recovery_timeout` has elapsed since opening
/// - half-open → closed on the first success, half-open → open on any failure
///
/// `state()` is cheap and never mutates; it derives half-open from the
/// elapsed recovery window so the exposition server can query concurrently
/// with the owning kernel.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: AtomicU8::new(BreakerState::Closed as u8),
            failures: AtomicU32::new(0),
            failure_threshold,
            recovery_timeout,
            opened_at: Mutex::new(None),
        }
    }

    /// Execute `f` under the breaker.
    ///
    /// Fails immediately with [`ProbeError::CircuitOpen`] while the breaker
    /// is open and the recovery window has not elapsed; otherwise runs the
    /// thunk and feeds the outcome back into the state machine.
    pub async fn call<F, Fut, T>(&self, f: F) -> ProbeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProbeResult<T>>,
    {
        if !self.try_acquire() {
            return Err(ProbeError::CircuitOpen);
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Current state without mutation.
    ///
    /// An open breaker whose recovery window has elapsed reports half-open
    /// even though no call has performed the transition yet.
    pub fn state(&self) -> BreakerState {
        let raw = BreakerState::from(self.state.load(Ordering::SeqCst));

        if raw == BreakerState::Open && self.recovery_elapsed() {
            return BreakerState::HalfOpen;
        }

        raw
    }

    /// Whether a call may proceed; performs the open → half-open transition
    /// when the recovery window has elapsed.
    fn try_acquire(&self) -> bool {
        match BreakerState::from(self.state.load(Ordering::SeqCst)) {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.recovery_elapsed() {
                    self.state
                        .store(BreakerState::HalfOpen as u8, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn recovery_elapsed(&self) -> bool {
        let guard = self.opened_at.lock().expect("breaker clock poisoned");
        matches!(*guard, Some(at) if at.elapsed() >= self.recovery_timeout)
    }

    fn record_success(&self) {
        match BreakerState::from(self.state.load(Ordering::SeqCst)) {
            BreakerState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
            }
            BreakerState::HalfOpen => {
                // Trial call succeeded, close and zero all tallies
                self.state
                    .store(BreakerState::Closed as u8, Ordering::SeqCst);
                self.failures.store(0, Ordering::SeqCst);
                let mut guard = self.opened_at.lock().expect("breaker clock poisoned");
                *guard = None;
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        match BreakerState::from(self.state.load(Ordering::SeqCst)) {
            BreakerState::Closed => {
                let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;

                if count >= self.failure_threshold {
                    self.state.store(BreakerState::Open as u8, Ordering::SeqCst);
                    let mut guard = self.opened_at.lock().expect("breaker clock poisoned");
                    *guard = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                // Trial call failed, re-open and restart the recovery clock
                self.state.store(BreakerState::Open as u8, Ordering::SeqCst);
                self.failures.store(0, Ordering::SeqCst);
                let mut guard = self.opened_at.lock().expect("breaker clock poisoned");
                *guard = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok(breaker: &CircuitBreaker) -> ProbeResult<()> {
        breaker.call(|| async { Ok(()) }).await
    }

    async fn fail(breaker: &CircuitBreaker) -> ProbeResult<()> {
        breaker
            .call(|| async { Err(ProbeError::Network("refused".into())) })
            .await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls_through() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(ok(&breaker).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

        for _ in 0..2 {
            assert!(fail(&breaker).await.is_err());
            assert_eq!(breaker.state(), BreakerState::Closed);
        }

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_with_sentinel() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        // The thunk must not run while open
        let result: ProbeResult<()> = breaker
            .call(|| async { panic!("thunk ran while breaker open") })
            .await;
        assert!(matches!(result, Err(ProbeError::CircuitOpen)));
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_tally() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        ok(&breaker).await.unwrap();

        // Tally reset: needs the full threshold again to trip
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_after_recovery_then_closes_on_first_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(30));

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        ok(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failure_and_restarts_clock() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(30));

        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Trial fails: re-open with a fresh recovery window
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.call(|| async { Ok(()) }).await,
            Err(ProbeError::CircuitOpen)
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        ok(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn state_query_does_not_perform_transition() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));

        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Repeated queries report half-open without consuming the trial
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        ok(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
