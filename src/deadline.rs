//! Per-operation deadlines derived from the request deadline.
//!
//! Every store, cache, and pub/sub call made on behalf of a request runs under
//! `min(per_op, time left on the request)`. Finalization uses a detached
//! deadline that ignores the request deadline.

use crate::error::MeterError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Default per-operation bound.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    per_op: Duration,
    request_deadline: Option<Instant>,
}

impl Deadline {
    /// Deadline with no inherited request bound.
    pub fn new(per_op: Duration) -> Self {
        Self { per_op, request_deadline: None }
    }

    /// Inherit the request deadline `budget` from now.
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.request_deadline = budget.map(|b| Instant::now() + b);
        self
    }

    /// Detached deadline for finalization work.
    pub fn detached(per_op: Duration) -> Self {
        Self::new(per_op)
    }

    /// Time left on the request, if bounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.request_deadline.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Bound for the next operation.
    pub fn op_timeout(&self) -> Duration {
        match self.remaining() {
            Some(left) => left.min(self.per_op),
            None => self.per_op,
        }
    }

    /// Run `fut` under the operation bound.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, MeterError>
    where
        F: Future<Output = Result<T, MeterError>>,
    {
        let timeout = self.op_timeout();
        if timeout.is_zero() {
            return Err(MeterError::DependencyTimeout { operation, timeout });
        }
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MeterError::DependencyTimeout { operation, timeout }),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_inside_bound() {
        let d = Deadline::new(Duration::from_millis(200));
        let out = d.run("fast", async { Ok::<_, MeterError>(5) }).await;
        assert_eq!(out.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out() {
        let d = Deadline::new(Duration::from_millis(50));
        let out = d
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, MeterError>(())
            })
            .await;
        match out {
            Err(MeterError::DependencyTimeout { operation, timeout }) => {
                assert_eq!(operation, "slow");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_budget_caps_operation_bound() {
        let d = Deadline::new(Duration::from_secs(2)).with_budget(Some(Duration::from_millis(300)));
        assert!(d.op_timeout() <= Duration::from_millis(300));
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(d.op_timeout(), Duration::ZERO);
        let out = d.run("late", async { Ok::<_, MeterError>(()) }).await;
        assert!(matches!(out, Err(MeterError::DependencyTimeout { .. })));
    }

    #[test]
    fn detached_ignores_request_budget() {
        let d = Deadline::detached(Duration::from_secs(5));
        assert_eq!(d.op_timeout(), Duration::from_secs(5));
        assert!(d.remaining().is_none());
    }
}
