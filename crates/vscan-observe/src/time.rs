use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock Unix time in milliseconds; clamps to 0 if the clock is before the epoch.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}
