//! Whole-cycle retry loop shared by both components

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;

/// Retry budget of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub wait: Duration,
}

/// Result of one consumption cycle
#[derive(Debug)]
pub struct CycleOutcome {
    pub result: Result<()>,
    /// At least one batch was processed successfully
    pub made_progress: bool,
}

/// Run `cycle` until it succeeds, the budget is spent or `token` is cancelled
///
/// A cycle that made progress resets the budget, so a component that keeps
/// processing something before failing retries indefinitely. A cycle ending
/// because of cancellation counts as a clean stop.
pub async fn run_with_retries<F, Fut>(policy: RetryPolicy, token: &CancellationToken, mut cycle: F) -> Result<()>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = CycleOutcome>,
{
    let mut attempt: u32 = 0;
    let mut cycles: u64 = 0;

    loop {
        cycles += 1;
        let outcome = cycle(cycles).await;

        let err = match outcome.result {
            Ok(()) => return Ok(()),
            Err(err) if err.is_cancelled() => {
                info!(cycle = cycles, "Consumption cancelled");
                return Ok(());
            },
            Err(err) => err,
        };

        if token.is_cancelled() || policy.retries == 0 {
            return Err(err);
        }

        if outcome.made_progress && attempt > 0 {
            info!(cycle = cycles, "Cycle made progress, resetting retry budget");
            attempt = 0;
        }
        if attempt >= policy.retries {
            warn!(cycle = cycles, retries = policy.retries, "Retry budget exhausted");
            return Err(err);
        }
        attempt += 1;

        warn!(
            cycle = cycles,
            attempt,
            retries = policy.retries,
            wait_ms = policy.wait.as_millis() as u64,
            error = %err,
            "Consumption cycle failed, retrying"
        );

        tokio::select! {
            _ = token.cancelled() => return Err(err),
            _ = tokio::time::sleep(policy.wait) => {},
        }
    }
}
