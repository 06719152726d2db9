//! crates/repetition_core/src/effects.rs
//!
//! Side effects that run after the primary operation has already committed.
//! Their failures are logged and contained here; they never reach the caller.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::ports::PortResult;

/// Runs `effect` under `limit`. Returns `None` if it failed or timed out.
pub async fn best_effort<T, F>(label: &'static str, limit: Duration, effect: F) -> Option<T>
where
    F: Future<Output = PortResult<T>>,
{
    match tokio::time::timeout(limit, effect).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(effect = label, error = %e, "Best-effort side effect failed");
            None
        }
        Err(_) => {
            warn!(effect = label, timeout_ms = limit.as_millis() as u64, "Best-effort side effect timed out");
            None
        }
    }
}
