//! Doubling backoff schedules shared by the model gateway and the job queue.

use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

/// `base, 2·base, 4·base, …`; unbounded, callers `take` what they need.
///
/// `ExponentialBackoff` multiplies its base by itself each step, so a base of
/// 2 scaled by `factor` gives the doubling; halving keeps odd bases exact.
pub fn doubling(base_ms: u64) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(base_ms)
        .map(|d| d / 2)
}
