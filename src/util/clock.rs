//! Wall-clock helpers.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Current wall-clock instant.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Time left until `instant`, zero when it already passed.
pub fn until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Time elapsed since `instant`, zero when it lies in the future.
pub fn since(instant: DateTime<Utc>) -> Duration {
    (Utc::now() - instant).to_std().unwrap_or(Duration::ZERO)
}

/// Add a std duration to an instant, saturating at the chrono maximum.
pub fn add(instant: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delta)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
