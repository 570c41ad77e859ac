//! Wall-clock helpers.

use chrono::Utc;

/// Milliseconds since the unix epoch.
///
/// Used to stamp cache entries and replay records. Clamped to zero for clocks
/// set before 1970.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
