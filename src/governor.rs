//! Request governor: per-identity token buckets and request deadlines
//!
//! Buckets are process-local and keyed `{route_class}:{user}:{remote_addr}`;
//! the table is behind a trait-free facade so it can be swapped for a
//! distributed counter later.

use crate::error::{OrchestratorError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

//
// ================= Request Context =================
//

/// Deadline and cancellation signal threaded through every I/O call.
/// There is no ambient timeout; everything observes this context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining().is_zero()
    }

    /// Fail fast between suspension points. `CANCELLED` takes precedence
    /// over any other error once the deadline fires.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep that aborts early on cancellation or deadline expiry.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let capped = duration.min(self.remaining());
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            _ = tokio::time::sleep(capped) => self.checkpoint(),
        }
    }
}

//
// ================= Route Classes =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Chat,
    InsightsCompute,
    Simulate,
    UploadCsv,
    Preferences,
}

impl RouteClass {
    /// Requests allowed per minute.
    pub fn per_minute(&self) -> f64 {
        match self {
            Self::Chat => 10.0,
            Self::InsightsCompute => 6.0,
            Self::Simulate => 5.0,
            Self::UploadCsv => 3.0,
            Self::Preferences => 10.0,
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Chat => "chat",
            Self::InsightsCompute => "insights.compute",
            Self::Simulate => "simulate",
            Self::UploadCsv => "upload-csv",
            Self::Preferences => "preferences",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Token Buckets =================
//

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter. Capacity equals the per-minute budget; tokens
/// refill continuously at `capacity / 60` per second.
pub struct RequestGovernor {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
}

impl RequestGovernor {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Take one token for the identity, or fail with `RATE_LIMIT` and a
    /// retry-after hint.
    pub async fn admit(
        &self,
        route: RouteClass,
        user_id: &str,
        remote_addr: &str,
    ) -> Result<()> {
        let key = format!("{}:{}:{}", route, user_id, remote_addr);
        let capacity = route.per_minute();
        let refill_per_sec = capacity / 60.0;

        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        let bucket = buckets.entry(key.clone()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - bucket.tokens;
        let retry_after_secs = (deficit / refill_per_sec).ceil() as u64;

        debug!(bucket = %key, retry_after_secs, "Rate limit exhausted");

        Err(OrchestratorError::RateLimit { retry_after_secs })
    }
}

impl Default for RequestGovernor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_exhaustion_and_hint() {
        let governor = RequestGovernor::new();

        for _ in 0..3 {
            governor
                .admit(RouteClass::UploadCsv, "user-1", "10.0.0.1")
                .await
                .unwrap();
        }

        let err = governor
            .admit(RouteClass::UploadCsv, "user-1", "10.0.0.1")
            .await
            .unwrap_err();
        match err {
            OrchestratorError::RateLimit { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        // A different identity gets its own bucket.
        governor
            .admit(RouteClass::UploadCsv, "user-2", "10.0.0.1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_context_checkpoint_and_cancel() {
        let ctx = RequestContext::new(Duration::from_secs(5));
        assert!(ctx.checkpoint().is_ok());

        ctx.cancel.cancel();
        assert!(matches!(
            ctx.checkpoint(),
            Err(OrchestratorError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_expired_deadline_is_cancelled() {
        let ctx = RequestContext::new(Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(ctx.is_cancelled());
    }
}
