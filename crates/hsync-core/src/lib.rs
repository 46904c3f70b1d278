//! Unified record model, ledger column contract and normalization rules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod credentials;
pub mod units;

pub use credentials::{Cookie, OAuthClient, OAuthTokens, OriginState, SessionState, SourceSecret, StorageItem};
pub use units::ReportingTz;

pub const CRATE_NAME: &str = "hsync-core";

/// Column order of the ledger. Downstream consumers rely on it; append-only.
pub const LEDGER_COLUMNS: [&str; 23] = [
    "date",
    "source",
    "bedtime",
    "wake_time",
    "sleep_duration_min",
    "sleep_score",
    "rhr_bpm",
    "hrv_ms",
    "readiness_or_body_battery_score",
    "health_score",
    "steps",
    "active_calories",
    "activity_score",
    "workout_type",
    "workout_duration_min",
    "workout_active_calories",
    "workout_avg_hr_bpm",
    "workout_max_hr_bpm",
    "distance_km",
    "pace_min_per_km",
    "avg_speed_kmh",
    "workout_or_strain_score",
    "source_record_id",
];

/// Known vendors. The lower-case name is what lands in the `source` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Oura,
    Ultrahuman,
    Polar,
    Withings,
    Garmin,
    RollaOne,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Oura,
        Source::Ultrahuman,
        Source::Polar,
        Source::Withings,
        Source::Garmin,
        Source::RollaOne,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Oura => "oura",
            Source::Ultrahuman => "ultrahuman",
            Source::Polar => "polar",
            Source::Withings => "withings",
            Source::Garmin => "garmin",
            Source::RollaOne => "rollaone",
        }
    }

    /// Browser-only vendors authenticate with a captured session, not tokens.
    pub fn is_browser(&self) -> bool {
        matches!(self, Source::Garmin | Source::RollaOne)
    }

    /// Prefix of the environment variables carrying this source's credentials.
    pub fn env_prefix(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }

    pub fn default_token_url(&self) -> Option<&'static str> {
        match self {
            Source::Oura => Some("https://api.ouraring.com/oauth/token"),
            Source::Ultrahuman => Some("https://partner.ultrahuman.com/oauth/token"),
            Source::Polar => Some("https://polarremote.com/v2/oauth2/token"),
            Source::Withings => Some("https://wbsapi.withings.net/v2/oauth2"),
            Source::Garmin | Source::RollaOne => None,
        }
    }

    /// Where the account owner approves an authorization-code grant.
    pub fn default_authorize_url(&self) -> Option<&'static str> {
        match self {
            Source::Oura => Some("https://cloud.ouraring.com/oauth/authorize"),
            Source::Ultrahuman => Some("https://partner.ultrahuman.com/oauth/authorize"),
            Source::Polar => Some("https://flow.polar.com/oauth2/authorization"),
            Source::Withings => Some("https://account.withings.com/oauth2_user/authorize2"),
            Source::Garmin | Source::RollaOne => None,
        }
    }

    pub fn oauth_scopes(&self) -> Option<&'static str> {
        match self {
            Source::Oura => Some("daily personal email"),
            Source::Ultrahuman => Some("profile ring_data"),
            Source::Polar => Some("accesslink.read_all"),
            Source::Withings => Some("user.activity,user.metrics"),
            Source::Garmin | Source::RollaOne => None,
        }
    }

    /// Polar's token endpoint authenticates the client with HTTP Basic.
    pub fn token_endpoint_wants_basic_auth(&self) -> bool {
        matches!(self, Source::Polar)
    }

    /// Withings multiplexes its token endpoint on an `action` form field.
    pub fn token_request_action(&self) -> Option<&'static str> {
        match self {
            Source::Withings => Some("requesttoken"),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == key)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Workout sub-record. Present only when the payload describes a workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workout {
    pub workout_type: String,
    pub duration_min: Option<f64>,
    pub active_calories: Option<i64>,
    pub avg_hr_bpm: Option<i64>,
    pub max_hr_bpm: Option<i64>,
    pub distance_km: Option<f64>,
    pub pace_min_per_km: Option<f64>,
    pub avg_speed_kmh: Option<f64>,
    pub strain_score: Option<i64>,
}

impl Workout {
    pub fn of_type(workout_type: impl Into<String>) -> Self {
        Self {
            workout_type: workout_type.into(),
            duration_min: None,
            active_calories: None,
            avg_hr_bpm: None,
            max_hr_bpm: None,
            distance_km: None,
            pace_min_per_km: None,
            avg_speed_kmh: None,
            strain_score: None,
        }
    }
}

/// One ledger row. Built by a normalizer from exactly one raw payload.
///
/// All numeric values are metric and every timestamp carries the reporting
/// timezone's offset. Missing values stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub date: NaiveDate,
    pub source: Source,
    pub bedtime: Option<DateTime<FixedOffset>>,
    pub wake_time: Option<DateTime<FixedOffset>>,
    pub sleep_duration_min: Option<f64>,
    pub sleep_score: Option<i64>,
    pub rhr_bpm: Option<i64>,
    pub hrv_ms: Option<i64>,
    pub readiness_or_body_battery_score: Option<i64>,
    pub health_score: Option<i64>,
    pub steps: Option<i64>,
    pub active_calories: Option<i64>,
    pub activity_score: Option<i64>,
    pub workout: Option<Workout>,
    pub source_record_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub date: NaiveDate,
    pub source: Source,
    pub source_record_id: String,
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.date, self.source, self.source_record_id)
    }
}

/// SHA-256 over the canonical ledger row. Equal fingerprints mean "unchanged".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    fn canonical(&self) -> String {
        match self {
            Cell::Null => "\u{0}".to_string(),
            Cell::Int(v) => v.to_string(),
            Cell::Float(v) => format!("{v:?}"),
            Cell::Text(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Cell::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Cell::Float(v) => Some(*v),
            Cell::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

fn text_cell(value: Option<String>) -> Cell {
    value.map(Cell::Text).unwrap_or(Cell::Null)
}

fn int_cell(value: Option<i64>) -> Cell {
    value.map(Cell::Int).unwrap_or(Cell::Null)
}

fn float_cell(value: Option<f64>) -> Cell {
    value.map(Cell::Float).unwrap_or(Cell::Null)
}

/// Ledger rendering of `bedtime`/`wake_time`: RFC 3339, whole seconds, offset kept.
pub fn timestamp_text(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowDecodeError {
    #[error("ledger row has {0} cells, expected 23")]
    Width(usize),
    #[error("column `{column}` holds an unexpected value")]
    Column { column: &'static str },
}

fn column_error(i: usize) -> RowDecodeError {
    RowDecodeError::Column { column: LEDGER_COLUMNS[i] }
}

fn text_at(row: &[Cell], i: usize) -> Result<Option<&str>, RowDecodeError> {
    match &row[i] {
        Cell::Null => Ok(None),
        Cell::Text(v) => Ok(Some(v.as_str())),
        _ => Err(column_error(i)),
    }
}

fn int_at(row: &[Cell], i: usize) -> Result<Option<i64>, RowDecodeError> {
    match &row[i] {
        Cell::Null => Ok(None),
        Cell::Int(v) => Ok(Some(*v)),
        _ => Err(column_error(i)),
    }
}

fn float_at(row: &[Cell], i: usize) -> Result<Option<f64>, RowDecodeError> {
    match &row[i] {
        Cell::Null => Ok(None),
        other => other.as_float().map(Some).ok_or_else(|| column_error(i)),
    }
}

fn timestamp_at(row: &[Cell], i: usize) -> Result<Option<DateTime<FixedOffset>>, RowDecodeError> {
    text_at(row, i)?
        .map(|v| DateTime::parse_from_rfc3339(v).map_err(|_| column_error(i)))
        .transpose()
}

impl UnifiedRecord {
    pub fn new(date: NaiveDate, source: Source, source_record_id: impl Into<String>) -> Self {
        Self {
            date,
            source,
            bedtime: None,
            wake_time: None,
            sleep_duration_min: None,
            sleep_score: None,
            rhr_bpm: None,
            hrv_ms: None,
            readiness_or_body_battery_score: None,
            health_score: None,
            steps: None,
            active_calories: None,
            activity_score: None,
            workout: None,
            source_record_id: source_record_id.into(),
        }
    }

    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity {
            date: self.date,
            source: self.source,
            source_record_id: self.source_record_id.clone(),
        }
    }

    /// True when at least one metric column carries a value.
    pub fn has_metrics(&self) -> bool {
        self.bedtime.is_some()
            || self.wake_time.is_some()
            || self.sleep_duration_min.is_some()
            || self.sleep_score.is_some()
            || self.rhr_bpm.is_some()
            || self.hrv_ms.is_some()
            || self.readiness_or_body_battery_score.is_some()
            || self.health_score.is_some()
            || self.steps.is_some()
            || self.active_calories.is_some()
            || self.activity_score.is_some()
            || self.workout.is_some()
    }

    /// Cells in `LEDGER_COLUMNS` order.
    pub fn to_ledger_row(&self) -> Vec<Cell> {
        let w = self.workout.as_ref();
        vec![
            Cell::Text(self.date.format("%Y-%m-%d").to_string()),
            Cell::Text(self.source.as_str().to_string()),
            text_cell(self.bedtime.as_ref().map(timestamp_text)),
            text_cell(self.wake_time.as_ref().map(timestamp_text)),
            float_cell(self.sleep_duration_min),
            int_cell(self.sleep_score),
            int_cell(self.rhr_bpm),
            int_cell(self.hrv_ms),
            int_cell(self.readiness_or_body_battery_score),
            int_cell(self.health_score),
            int_cell(self.steps),
            int_cell(self.active_calories),
            int_cell(self.activity_score),
            text_cell(w.map(|w| w.workout_type.clone())),
            float_cell(w.and_then(|w| w.duration_min)),
            int_cell(w.and_then(|w| w.active_calories)),
            int_cell(w.and_then(|w| w.avg_hr_bpm)),
            int_cell(w.and_then(|w| w.max_hr_bpm)),
            float_cell(w.and_then(|w| w.distance_km)),
            float_cell(w.and_then(|w| w.pace_min_per_km)),
            float_cell(w.and_then(|w| w.avg_speed_kmh)),
            int_cell(w.and_then(|w| w.strain_score)),
            Cell::Text(self.source_record_id.clone()),
        ]
    }

    pub fn from_ledger_row(row: &[Cell]) -> Result<Self, RowDecodeError> {
        if row.len() != LEDGER_COLUMNS.len() {
            return Err(RowDecodeError::Width(row.len()));
        }

        let date = text_at(row, 0)?
            .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
            .ok_or(RowDecodeError::Column { column: "date" })?;
        let source = text_at(row, 1)?
            .and_then(|v| v.parse::<Source>().ok())
            .ok_or(RowDecodeError::Column { column: "source" })?;
        let source_record_id = text_at(row, 22)?
            .ok_or(RowDecodeError::Column { column: "source_record_id" })?
            .to_string();

        let workout = match text_at(row, 13)? {
            Some(workout_type) => Some(Workout {
                workout_type: workout_type.to_string(),
                duration_min: float_at(row, 14)?,
                active_calories: int_at(row, 15)?,
                avg_hr_bpm: int_at(row, 16)?,
                max_hr_bpm: int_at(row, 17)?,
                distance_km: float_at(row, 18)?,
                pace_min_per_km: float_at(row, 19)?,
                avg_speed_kmh: float_at(row, 20)?,
                strain_score: int_at(row, 21)?,
            }),
            None => None,
        };

        Ok(Self {
            date,
            source,
            bedtime: timestamp_at(row, 2)?,
            wake_time: timestamp_at(row, 3)?,
            sleep_duration_min: float_at(row, 4)?,
            sleep_score: int_at(row, 5)?,
            rhr_bpm: int_at(row, 6)?,
            hrv_ms: int_at(row, 7)?,
            readiness_or_body_battery_score: int_at(row, 8)?,
            health_score: int_at(row, 9)?,
            steps: int_at(row, 10)?,
            active_calories: int_at(row, 11)?,
            activity_score: int_at(row, 12)?,
            workout,
            source_record_id,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for (i, cell) in self.to_ledger_row().iter().enumerate() {
            if i > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(cell.canonical().as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

/// Deterministic id for payloads whose source has no native identifier.
///
/// `identity_fields` must only hold values that identify the underlying event
/// (never metric values or fetch metadata), so re-fetches map to the same id.
pub fn fallback_record_id(
    source: Source,
    date: NaiveDate,
    kind: &str,
    identity_fields: &[&str],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    for field in identity_fields {
        hasher.update(b"|");
        hasher.update(field.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("fp-{}", &digest[..16])
}
