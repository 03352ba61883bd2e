use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Sleeps for `duration` in slices of at most `step`, returning early once the token
/// is cancelled. Returns `true` when the full duration elapsed.
pub fn sleep_unless_cancelled(
    cancel_token: &CancellationToken,
    duration: Duration,
    step: Duration,
) -> bool {
    let deadline = Instant::now() + duration;
    let step = step.max(Duration::from_millis(1));
    loop {
        if cancel_token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}

/// Converts a loop frequency into its period. Zero is clamped to 1 Hz.
pub fn period_for_hz(hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / hz.max(1) as f64)
}
