use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Daily UTC window during which the bot may hold a ladder.
///
/// A window whose end is before its start wraps midnight, e.g. 22:00-04:00.
/// Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSession {
    #[serde(with = "clock")]
    pub start: NaiveTime,
    #[serde(with = "clock")]
    pub end: NaiveTime,
}

impl TradingSession {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.contains(now.time())
    }

    /// Time until the next session start after `now`.
    pub fn until_start(&self, now: DateTime<Utc>) -> Duration {
        let today_start = now.date_naive().and_time(self.start).and_utc();
        let next = if now >= today_start {
            today_start + Duration::days(1)
        } else {
            today_start
        };
        next - now
    }
}

/// `HH:MM` or `HH:MM:SS` in config files.
mod clock {
    use super::*;

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M"))
            .map_err(|e| serde::de::Error::custom(format!("invalid time '{}': {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_day_session() {
        let s = TradingSession::new(t(8, 0), t(16, 30));
        assert!(s.contains(t(8, 0)));
        assert!(s.contains(t(12, 0)));
        assert!(s.contains(t(16, 30)));
        assert!(!s.contains(t(16, 31)));
        assert!(!s.contains(t(7, 59)));
    }

    #[test]
    fn test_session_wraps_midnight() {
        let s = TradingSession::new(t(22, 0), t(4, 0));
        assert!(s.contains(t(23, 15)));
        assert!(s.contains(t(0, 0)));
        assert!(s.contains(t(3, 59)));
        assert!(!s.contains(t(12, 0)));
    }

    #[test]
    fn test_until_start() {
        let s = TradingSession::new(t(8, 0), t(16, 0));
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap();
        assert_eq!(s.until_start(before), Duration::minutes(90));
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 17, 0, 0).unwrap();
        assert_eq!(s.until_start(after), Duration::hours(15));
    }

    #[test]
    fn test_parse_short_and_long_times() {
        let s: TradingSession = toml::from_str("start = \"22:00\"\nend = \"04:15:30\"\n").unwrap();
        assert_eq!(s.start, t(22, 0));
        assert_eq!(s.end, NaiveTime::from_hms_opt(4, 15, 30).unwrap());
    }
}
