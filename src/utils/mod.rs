pub mod shutdown;

pub use self::shutdown::Shutdown;

use chrono::Utc;

/// Return the current time in seconds since the Unix epoch.
pub fn unix_time() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
