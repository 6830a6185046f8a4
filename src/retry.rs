//! Bounded retry and circuit breaking for the external collaborators.
//!
//! Only transient failure classes (timeouts, connect errors, 5xx, 429) are
//! retried; validation failures and other 4xx are terminal on the first
//! attempt. The breaker suppresses calls after repeated failures and admits
//! a single probe once the cooldown elapses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{PttsError, Result};

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_BACKOFF_MS: u64 = 250;
pub const MAX_BACKOFF_MS: u64 = 10_000;

const BREAK_AFTER_FAILURES: u32 = 5;
const OPEN_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-collaborator circuit breaker with an observable state.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: &'static str,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Gate a call. `CIRCUIT_OPEN` while cooling down; the first call after
    /// the cooldown flips to HALF_OPEN and is admitted as a probe.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= OPEN_COOLDOWN {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!(service = self.service, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(PttsError::CircuitOpen {
                        service: self.service,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(service = self.service, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= BREAK_AFTER_FAILURES;
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                service = self.service,
                failures = inner.consecutive_failures,
                "circuit opened"
            );
        }
    }
}

/// Run `op` up to [`MAX_ATTEMPTS`] times with doubling backoff, consulting
/// the breaker before each attempt and reporting the outcome back to it.
pub async fn with_retries<T, F, Fut>(
    breaker: &CircuitBreaker,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff_ms = BASE_BACKOFF_MS;
    let mut last_err: Option<PttsError> = None;

    for attempt in 0..MAX_ATTEMPTS {
        breaker.check()?;

        match op().await {
            Ok(v) => {
                if attempt > 0 {
                    tracing::info!(operation, attempt, "collaborator recovered after retries");
                }
                breaker.record_success();
                return Ok(v);
            }
            Err(e) => {
                breaker.record_failure();
                if !e.is_transient() {
                    return Err(e);
                }
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max = MAX_ATTEMPTS,
                    error = %e,
                    "transient collaborator failure"
                );
                last_err = Some(e);
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    Err(last_err.unwrap_or(PttsError::ExternalUnavailable {
        operation: operation.to_string(),
        cause: "retries exhausted".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient(op: &str) -> PttsError {
        PttsError::ExternalUnavailable {
            operation: op.into(),
            cause: "503".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let breaker = CircuitBreaker::new("ocr");
        let calls = AtomicU32::new(0);

        let out = with_retries(&breaker, "ocr", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient("ocr"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn validation_failures_are_not_retried() {
        let breaker = CircuitBreaker::new("embed");
        let calls = AtomicU32::new(0);

        let err = with_retries(&breaker, "embed", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(PttsError::validation("empty text")) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "VALIDATION_ERROR");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn breaker_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("vision");
        for _ in 0..BREAK_AFTER_FAILURES {
            breaker.check().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.check().unwrap_err().kind(), "CIRCUIT_OPEN");

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("vision");
        {
            let mut inner = breaker.inner.lock();
            inner.state = BreakerState::HalfOpen;
        }
        breaker.check().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
