// Timekeeping helpers
//
// Monotonic timestamps used by the logging infrastructure and by
// backends that track acquire timeout budgets.
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current time in milliseconds
///
/// This is used to tag log lines. It is wall clock time, do not
/// use it for timeout arithmetic.
pub fn get_current_millis() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the unix epoch");

    now.as_millis() as u64
}

/// Get the current monotonic time in nanoseconds
///
/// Backends measure acquire timeout budgets against this clock.
pub fn get_monotonic_nanos() -> u64 {
    use std::time::Instant;
    lazy_static::lazy_static! {
        static ref EPOCH: Instant = Instant::now();
    }

    EPOCH.elapsed().as_nanos() as u64
}
