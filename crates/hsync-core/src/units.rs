//! Unit conversion and timezone alignment rules shared by every normalizer.
//!
//! The ledger is metric: kilometres, minutes per kilometre, kilometres per
//! hour, minutes, kilocalories. Derived decimals are rounded half-up to two
//! places.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

pub const KM_PER_MILE: f64 = 1.609344;
pub const KMH_PER_MPS: f64 = 3.6;

pub fn round_2dp(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn seconds_to_minutes(seconds: f64) -> f64 {
    round_2dp(seconds / 60.0)
}

pub fn meters_to_km(meters: f64) -> f64 {
    round_2dp(meters / 1000.0)
}

pub fn miles_to_km(miles: f64) -> f64 {
    round_2dp(miles * KM_PER_MILE)
}

pub fn mph_to_kmh(mph: f64) -> f64 {
    round_2dp(mph * KM_PER_MILE)
}

pub fn mps_to_kmh(mps: f64) -> f64 {
    round_2dp(mps * KMH_PER_MPS)
}

/// `None` for a zero or negative speed: a pace would be infinite.
pub fn kmh_to_pace(kmh: f64) -> Option<f64> {
    (kmh > 0.0).then(|| round_2dp(60.0 / kmh))
}

/// Minutes per mile to minutes per kilometre.
pub fn pace_per_mile_to_per_km(min_per_mile: f64) -> f64 {
    round_2dp(min_per_mile / KM_PER_MILE)
}

/// Speed and pace from metres per second; both `None` when not moving.
pub fn speed_and_pace_from_mps(mps: f64) -> (Option<f64>, Option<f64>) {
    if mps <= 0.0 {
        return (None, None);
    }
    let kmh = mps * KMH_PER_MPS;
    (Some(round_2dp(kmh)), kmh_to_pace(kmh))
}

/// Parses `h:mm:ss`, `mm:ss` or plain minutes into minutes.
pub fn clock_to_minutes(text: &str) -> Option<f64> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    let nums: Option<Vec<f64>> = parts.iter().map(|p| p.trim().parse::<f64>().ok()).collect();
    let nums = nums?;
    let minutes = match nums.as_slice() {
        [m] => *m,
        [m, s] => m + s / 60.0,
        [h, m, s] => h * 60.0 + m + s / 60.0,
        _ => return None,
    };
    Some(round_2dp(minutes))
}

const WORKOUT_TYPES: &[(&str, &str)] = &[
    ("run", "run"),
    ("running", "run"),
    ("trail_running", "run"),
    ("treadmill_running", "run"),
    ("ride", "ride"),
    ("cycling", "ride"),
    ("bike", "ride"),
    ("road_biking", "ride"),
    ("indoor_cycling", "ride"),
    ("swim", "swim"),
    ("swimming", "swim"),
    ("lap_swimming", "swim"),
    ("strength", "strength"),
    ("strength_training", "strength"),
    ("weight_training", "strength"),
    ("walk", "walk"),
    ("walking", "walk"),
    ("hike", "hike"),
    ("hiking", "hike"),
    ("yoga", "yoga"),
];

/// Maps vendor sport vocabulary onto the ledger's workout types.
pub fn normalize_workout_type(value: &str) -> String {
    let key = value.trim().replace(['-', ' '], "_").to_ascii_lowercase();
    WORKOUT_TYPES
        .iter()
        .find(|(vendor, _)| *vendor == key)
        .map(|(_, unified)| (*unified).to_string())
        .unwrap_or_else(|| "other".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown timezone `{0}`")]
pub struct UnknownTimezone(pub String);

/// The single timezone every ledger timestamp is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingTz(Tz);

impl Default for ReportingTz {
    fn default() -> Self {
        Self(Tz::UTC)
    }
}

impl ReportingTz {
    pub fn parse(name: &str) -> Result<Self, UnknownTimezone> {
        name.trim()
            .parse::<Tz>()
            .map(Self)
            .map_err(|_| UnknownTimezone(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn align(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.0).fixed_offset()
    }

    pub fn align_offset(&self, ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        self.align(ts.with_timezone(&Utc))
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.0).date_naive()
    }

    pub fn from_epoch_seconds(&self, secs: i64) -> Option<DateTime<FixedOffset>> {
        Utc.timestamp_opt(secs, 0).single().map(|utc| self.align(utc))
    }

    pub fn from_epoch_millis(&self, millis: i64) -> Option<DateTime<FixedOffset>> {
        Utc.timestamp_millis_opt(millis).single().map(|utc| self.align(utc))
    }

    /// Parses an RFC 3339 timestamp and moves it into the reporting timezone.
    pub fn parse_rfc3339(&self, text: &str) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|ts| self.align_offset(ts))
    }

    pub fn today(&self) -> NaiveDate {
        self.local_date(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mile_conversions_use_exact_constant() {
        assert_eq!(miles_to_km(1.0), 1.61);
        assert_eq!(miles_to_km(3.1), 4.99);
        assert_eq!(miles_to_km(26.2), 42.16);
        // 8:00 min/mile is 4.97 min/km
        assert_eq!(pace_per_mile_to_per_km(8.0), 4.97);
        assert_eq!(mph_to_kmh(6.0), 9.66);
    }

    #[test]
    fn speed_and_pace_from_meters_per_second() {
        assert_eq!(speed_and_pace_from_mps(2.5), (Some(9.0), Some(6.67)));
        assert_eq!(speed_and_pace_from_mps(0.0), (None, None));
        assert_eq!(kmh_to_pace(0.0), None);
    }

    #[test]
    fn clock_text_parses_to_minutes() {
        assert_eq!(clock_to_minutes("1:02:30"), Some(62.5));
        assert_eq!(clock_to_minutes("9:30"), Some(9.5));
        assert_eq!(clock_to_minutes("45"), Some(45.0));
        assert_eq!(clock_to_minutes("n/a"), None);
    }

    #[test]
    fn seconds_and_meters_round_to_two_places() {
        assert_eq!(seconds_to_minutes(27_150.0), 452.5);
        assert_eq!(meters_to_km(5_034.0), 5.03);
    }

    #[test]
    fn workout_vocabulary_is_normalized() {
        assert_eq!(normalize_workout_type("Running"), "run");
        assert_eq!(normalize_workout_type("weight-training"), "strength");
        assert_eq!(normalize_workout_type("road biking"), "ride");
        assert_eq!(normalize_workout_type("padel"), "other");
    }

    #[test]
    fn timestamps_are_moved_into_reporting_timezone() {
        let tz = ReportingTz::parse("Europe/Sarajevo").unwrap();
        let aligned = tz.parse_rfc3339("2025-01-01T22:30:00Z").unwrap();
        assert_eq!(aligned.to_rfc3339(), "2025-01-01T23:30:00+01:00");
        let summer = tz.from_epoch_seconds(1_751_328_000).unwrap();
        assert_eq!(summer.offset().local_minus_utc(), 7200);
        assert!(ReportingTz::parse("Mars/Olympus").is_err());
    }

    #[test]
    fn local_date_crosses_midnight_in_reporting_timezone() {
        let tz = ReportingTz::parse("Asia/Tokyo").unwrap();
        let instant = DateTime::parse_from_rfc3339("2025-01-01T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(tz.local_date(instant), NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
    }
}
