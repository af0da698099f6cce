use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the epoch, saturating at zero for clocks set before 1970.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn sleep(seconds: u64) {
    thread::sleep(Duration::from_secs(seconds));
}
