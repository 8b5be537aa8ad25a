//! Time-derived version tokens.
//!
//! A version is `v` followed by the UTC timestamp `YYYYMMDDHHMMSS`, e.g.
//! `v20240101120000`. Tokens sort lexically in creation order. Two requests
//! in the same second would collide, so the generator remembers the last
//! timestamp it issued and steps forward one second when the clock has not
//! moved past it.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of version tokens.
pub trait VersionGenerator: Send + Sync {
    fn next_version(&self) -> String;
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall-clock generator, monotonic within the process.
pub struct ClockVersionGenerator {
    clock: Clock,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ClockVersionGenerator {
    pub fn new() -> Self {
        Self::with_clock(Utc::now)
    }

    pub fn with_clock(clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            last: Mutex::new(None),
        }
    }
}

impl Default for ClockVersionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionGenerator for ClockVersionGenerator {
    fn next_version(&self) -> String {
        let now = (self.clock)();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let ts = match *last {
            Some(prev) if now.timestamp() <= prev.timestamp() => prev + Duration::seconds(1),
            _ => now,
        };
        *last = Some(ts);
        format_version(ts)
    }
}

pub fn format_version(ts: DateTime<Utc>) -> String {
    format!("v{}", ts.format("%Y%m%d%H%M%S"))
}
