// ── Backoff calculation ──
//
// Shared by the reconnect loop and the cache's fetch retries:
// `delay = min(base * 2^attempt, cap)`.

use std::time::Duration;

pub(crate) fn delay_for_attempt(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let doubled = base.saturating_mul(2u32.saturating_pow(attempt));
    doubled.min(cap)
}
