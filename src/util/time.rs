use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic instant corresponding to wall-clock `at`; past times map to now.
#[inline]
pub fn instant_at(at: DateTime<Utc>) -> Instant {
    Instant::now() + until(at)
}

/// Time left until `at`, saturating at zero.
#[inline]
pub fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Lock expiry for a lock taken now and held for `lock`.
#[inline]
pub fn lock_expiry(lock: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(lock)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
