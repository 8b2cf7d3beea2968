use std::sync::{Mutex, PoisonError};

use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::{MetricsError, MetricsResult};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn format_timestamp(at: OffsetDateTime) -> MetricsResult<String> {
    at.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| MetricsError::invalid(format!("format timestamp: {err}")))
}

pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::{format_timestamp, parse_timestamp, Clock, ManualClock};
    use time::{Duration, OffsetDateTime};

    #[test]
    fn manual_clock_advances() {
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("start");
        let clock = ManualClock::new(start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now() - start, Duration::hours(2));
    }

    #[test]
    fn timestamps_parse_back() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("at");
        let raw = format_timestamp(at).expect("format");
        assert_eq!(raw, "2023-11-14T22:13:20Z");
        assert_eq!(parse_timestamp(&raw), Some(at));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
