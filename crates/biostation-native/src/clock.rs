//! Host wall-clock timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch as a float, millisecond resolution or better.
///
/// Returns `0.0` if the system clock is set before the epoch.
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
