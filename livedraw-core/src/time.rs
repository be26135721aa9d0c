//! Wall-clock access and minute-boundary arithmetic.
//!
//! Every scheduling decision is made against a [`WallClock`] timestamp, so the
//! engine can run against real UTC time in production and against tokio's
//! paused clock in tests.

use chrono::{DateTime, Duration, Utc};

/// Length of one round in seconds.
pub const ROUND_SECS: i64 = 60;

/// Source of the current UTC time.
pub trait WallClock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from tokio's monotonic clock, starting at a fixed anchor.
///
/// Under `tokio::time::pause` this advances only when the runtime advances
/// virtual time, which lets whole rounds run instantly in tests.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl WallClock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.anchor + elapsed
    }
}

/// Truncate to the start of the containing UTC minute.
pub fn floor_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp().div_euclid(ROUND_SECS) * ROUND_SECS;
    DateTime::from_timestamp(secs, 0).unwrap_or(at)
}

/// The first minute boundary at or after `at`.
pub fn next_minute_boundary(at: DateTime<Utc>) -> DateTime<Utc> {
    let floor = floor_to_minute(at);
    if floor == at {
        floor
    } else {
        floor + Duration::seconds(ROUND_SECS)
    }
}

/// Time left until `target`, clamped to zero when `target` is already past.
pub fn delay_until(target: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (target - now).to_std().unwrap_or(std::time::Duration::ZERO)
}

/// Whole seconds until `target`, rounded up and never negative.
pub fn seconds_until(target: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (target - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        ((millis + 999) / 1000) as u64
    }
}

/// ISO-8601 UTC without fractional seconds, e.g. `2024-01-01T00:01:00Z`.
pub fn iso_utc(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Serde adapter writing timestamps with [`iso_utc`].
pub mod iso_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::iso_utc(*at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.serialize_str(&super::super::iso_utc(*at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_boundary_rounds_up() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 42).unwrap();
        let next = next_minute_boundary(at);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 16, 0).unwrap());

        let with_millis = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap() + Duration::milliseconds(1);
        assert_eq!(
            next_minute_boundary(with_millis),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 16, 0).unwrap()
        );
    }

    #[test]
    fn test_exact_boundary_is_kept() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap();
        assert_eq!(next_minute_boundary(at), at);
        assert_eq!(floor_to_minute(at + Duration::seconds(59)), at);
    }

    #[test]
    fn test_negative_delay_is_clamped() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        let past = now - Duration::seconds(5);
        assert_eq!(delay_until(past, now), std::time::Duration::ZERO);
        assert_eq!(seconds_until(past, now), 0);
        assert_eq!(seconds_until(now + Duration::milliseconds(1500), now), 2);
    }

    #[test]
    fn test_iso_has_no_fraction() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 8, 7, 6).unwrap() + Duration::milliseconds(250);
        assert_eq!(iso_utc(at), "2024-03-09T08:07:06Z");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_virtual_time() {
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TokioClock::starting_at(anchor);
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now(), anchor + Duration::seconds(90));
    }
}
