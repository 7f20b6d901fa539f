//! Process clocks: wall time for `ts_server`, monotonic seconds for everything
//! that gets compared or aged (replay records, commits, session offsets).

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic seconds since process start. Never goes backwards.
pub fn monotonic_secs() -> f64 {
    PROCESS_START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Unix timestamp in fractional seconds (wall clock).
pub fn wall_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Unix timestamp for "now" (whole seconds). Used in session metadata.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Monotonic clock as a value, so queues/storage can age records against a
/// clock the tests control.
pub type ClockFn = Arc<dyn Fn() -> f64 + Send + Sync>;

pub fn default_clock() -> ClockFn {
    Arc::new(monotonic_secs)
}
