use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use parley_types::{ChatError, ChatResult};

/// Fixed-width UTC timestamp with microseconds; text order equals time order.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Hands out strictly increasing write timestamps at microsecond precision,
/// so `created_at` never goes backwards even if the wall clock does.
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    pub fn tick(&self) -> DateTime<Utc> {
        let now = truncate_to_micros(Utc::now());
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> ChatResult<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by SQLite's datetime('now') carry no zone.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| ChatError::Internal(format!("corrupt timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_strictly_increase() {
        let clock = MonotonicClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn formatted_timestamps_sort_like_time() {
        let clock = MonotonicClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(format_ts(a).len(), format_ts(b).len());
    }

    #[test]
    fn parse_accepts_both_formats() {
        let ts = truncate_to_micros(Utc::now());
        assert_eq!(parse_ts(&format_ts(ts)).unwrap(), ts);
        assert!(parse_ts("2024-01-02 03:04:05").is_ok());
        assert!(matches!(parse_ts("yesterday"), Err(ChatError::Internal(_))));
    }
}
