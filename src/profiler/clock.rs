//! Monotonic event clock shared by all recorders of one request

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Origin for every offset recorded against one request.
///
/// Offsets are microseconds since the origin and come from a monotonic
/// clock, so they never go backwards even if the wall clock is adjusted.
#[derive(Debug, Clone, Copy)]
pub struct EventClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl EventClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }

    /// Microseconds elapsed since the origin
    pub fn now_us(&self) -> u64 {
        duration_to_us(self.origin.elapsed())
    }

    /// Offset of an arbitrary instant; instants before the origin clamp to 0
    pub fn offset_of(&self, instant: Instant) -> u64 {
        duration_to_us(instant.saturating_duration_since(self.origin))
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Wall-clock time at which the request began
    pub fn started_at(&self) -> DateTime<Utc> {
        self.wall_origin
    }
}

pub fn duration_to_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

pub fn ms_to_us(ms: u64) -> u64 {
    ms.saturating_mul(1_000)
}

/// Current wall-clock time as Unix milliseconds
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}
