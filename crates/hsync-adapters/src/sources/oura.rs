//! Oura ring: v2 user collections over bearer or OAuth2 auth.
//!
//! The daily collections (`daily_sleep`, `daily_readiness`, `daily_activity`
//! and the `sleep` sessions) are folded into one daily payload per day.
//! Each workout becomes its own payload keyed by the vendor's `id`.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use hsync_core::units::{kmh_to_pace, meters_to_km, normalize_workout_type, round_2dp, seconds_to_minutes, speed_and_pace_from_mps};
use hsync_core::{fallback_record_id, Source, UnifiedRecord, Workout};
use hsync_storage::HttpRequest;
use serde_json::{Map, Value as JsonValue};

use super::{trim_base, with_cursor};
use crate::api::{ApiSource, PageBody, PlannedRequest};
use crate::normalize::{at, first_int, first_number, int_at, number_at, str_at, timestamp, NormalizationError, NormalizeContext, Normalizer};
use crate::{DateWindow, PayloadKind, RawPayload};

pub const DEFAULT_BASE_URL: &str = "https://api.ouraring.com";

const DAILY_COLLECTIONS: [&str; 4] = ["daily_sleep", "daily_readiness", "daily_activity", "sleep"];
const WORKOUT_COLLECTION: &str = "workout";

#[derive(Debug, Clone)]
pub struct OuraPlan {
    base_url: String,
}

impl OuraPlan {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: trim_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
        }
    }

    fn collection(&self, name: &str, start: NaiveDate, end: NaiveDate) -> PlannedRequest {
        // end_date is exclusive on Oura's side
        PlannedRequest::new(
            name,
            HttpRequest::get(format!("{}/v2/usercollection/{name}", self.base_url))
                .query("start_date", start.to_string())
                .query("end_date", (end + Duration::days(1)).to_string()),
        )
    }
}

impl ApiSource for OuraPlan {
    fn source(&self) -> Source {
        Source::Oura
    }

    fn requests(&self, window: &DateWindow) -> Vec<PlannedRequest> {
        DAILY_COLLECTIONS
            .iter()
            .chain(std::iter::once(&WORKOUT_COLLECTION))
            .map(|name| self.collection(name, window.start, window.end))
            .collect()
    }

    fn next_page(&self, previous: &PlannedRequest, body: &JsonValue) -> Option<PlannedRequest> {
        let token = str_at(body, &["next_token"])?;
        Some(with_cursor(previous, "next_token", token))
    }

    fn assemble(&self, window: &DateWindow, pages: Vec<PageBody>) -> Result<Vec<RawPayload>, String> {
        let mut days: BTreeMap<NaiveDate, Map<String, JsonValue>> = BTreeMap::new();
        let mut workouts = Vec::new();

        for page in pages {
            let items = page
                .body
                .get("data")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| format!("`{}` page has no `data` array", page.label))?;

            for item in items {
                let Some(day) = str_at(item, &["day"]).and_then(|d| d.parse::<NaiveDate>().ok()) else {
                    continue;
                };
                if !window.contains(day) {
                    continue;
                }
                if page.label == WORKOUT_COLLECTION {
                    workouts.push(RawPayload {
                        source: Source::Oura,
                        kind: PayloadKind::Workout,
                        day,
                        native_id: str_at(item, &["id"]).map(str::to_string),
                        body: item.clone(),
                    });
                    continue;
                }
                let entry = days.entry(day).or_default();
                if page.label == "sleep" {
                    keep_main_sleep(entry, item);
                } else {
                    entry.insert(page.label.clone(), item.clone());
                }
            }
        }

        let mut out: Vec<RawPayload> = days
            .into_iter()
            .map(|(day, body)| RawPayload {
                source: Source::Oura,
                kind: PayloadKind::Daily,
                day,
                native_id: None,
                body: JsonValue::Object(body),
            })
            .collect();
        out.extend(workouts);
        Ok(out)
    }

    fn probe_request(&self, today: NaiveDate) -> PlannedRequest {
        self.collection("daily_activity", today, today)
    }
}

/// A night can hold naps next to the main sleep; keep the `long_sleep`
/// period, else the longest one.
fn keep_main_sleep(entry: &mut Map<String, JsonValue>, item: &JsonValue) {
    let rank = |v: &JsonValue| {
        let long = str_at(v, &["type"]) == Some("long_sleep");
        (long, number_at(v, &["total_sleep_duration"]).unwrap_or(0.0))
    };
    let replace = match entry.get("sleep") {
        Some(current) => rank(item) > rank(current),
        None => true,
    };
    if replace {
        entry.insert("sleep".to_string(), item.clone());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OuraNormalizer;

impl OuraNormalizer {
    fn daily(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        if !payload.body.is_object() {
            return Err(NormalizationError::new(payload, "daily payload is not an object"));
        }
        let body = &payload.body;
        let id = fallback_record_id(Source::Oura, payload.day, PayloadKind::Daily.as_str(), &[]);
        let mut record = UnifiedRecord::new(payload.day, Source::Oura, id);

        if let Some(sleep) = at(body, &["sleep"]) {
            record.bedtime = at(sleep, &["bedtime_start"]).and_then(|v| timestamp(v, &ctx.tz));
            record.wake_time = at(sleep, &["bedtime_end"]).and_then(|v| timestamp(v, &ctx.tz));
            record.sleep_duration_min = first_number(sleep, &["total_sleep_duration", "duration"]).map(seconds_to_minutes);
            record.rhr_bpm = first_int(sleep, &["lowest_heart_rate", "average_heart_rate", "average_bpm"]);
            record.hrv_ms = int_at(sleep, &["average_hrv"]);
        }
        record.sleep_score = int_at(body, &["daily_sleep", "score"]);
        record.readiness_or_body_battery_score = int_at(body, &["daily_readiness", "score"]);
        record.steps = int_at(body, &["daily_activity", "steps"]);
        record.active_calories = int_at(body, &["daily_activity", "active_calories"]);
        record.activity_score = int_at(body, &["daily_activity", "score"]);

        Ok(if record.has_metrics() { vec![record] } else { Vec::new() })
    }

    fn workout(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let body = &payload.body;
        if !body.is_object() {
            return Err(NormalizationError::new(payload, "workout payload is not an object"));
        }
        let start = at(body, &["start_datetime"]).and_then(|v| timestamp(v, &ctx.tz));
        let end = at(body, &["end_datetime"]).and_then(|v| timestamp(v, &ctx.tz));
        let sport = str_at(body, &["activity"]).or_else(|| str_at(body, &["sport"]));
        if start.is_none() && sport.is_none() && payload.native_id.is_none() {
            return Err(NormalizationError::new(payload, "workout has no id, start time or activity"));
        }
        let date = start.map(|ts| ts.date_naive()).unwrap_or(payload.day);

        let mut workout = Workout::of_type(sport.map(normalize_workout_type).unwrap_or_else(|| "other".to_string()));
        workout.duration_min = number_at(body, &["duration"]).map(seconds_to_minutes).or_else(|| match (start, end) {
            (Some(s), Some(e)) if e > s => Some(seconds_to_minutes((e - s).num_seconds() as f64)),
            _ => None,
        });
        workout.active_calories = first_int(body, &["calories", "active_calories"]);
        workout.avg_hr_bpm = int_at(body, &["average_heart_rate"]);
        workout.max_hr_bpm = int_at(body, &["max_heart_rate"]);
        workout.distance_km = number_at(body, &["distance"]).filter(|m| *m > 0.0).map(meters_to_km);

        match number_at(body, &["average_speed"]) {
            Some(mps) => (workout.avg_speed_kmh, workout.pace_min_per_km) = speed_and_pace_from_mps(mps),
            None => {
                if let (Some(km), Some(min)) = (workout.distance_km, workout.duration_min.filter(|m| *m > 0.0)) {
                    let kmh = km / (min / 60.0);
                    workout.avg_speed_kmh = Some(round_2dp(kmh));
                    workout.pace_min_per_km = kmh_to_pace(kmh);
                }
            }
        }

        let id = match &payload.native_id {
            Some(id) => id.clone(),
            None => {
                // Without a start time the whole body tells same-day workouts apart.
                let started = match start {
                    Some(ts) => ts.to_rfc3339(),
                    None => payload.body.to_string(),
                };
                fallback_record_id(Source::Oura, date, PayloadKind::Workout.as_str(), &[&started, &workout.workout_type])
            }
        };
        let mut record = UnifiedRecord::new(date, Source::Oura, id);
        record.workout = Some(workout);
        Ok(vec![record])
    }
}

impl Normalizer for OuraNormalizer {
    fn source(&self) -> Source {
        Source::Oura
    }

    fn normalize(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        match payload.kind {
            PayloadKind::Daily => self.daily(payload, ctx),
            PayloadKind::Workout => self.workout(payload, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn requests_cover_every_collection_with_exclusive_end() {
        let plan = OuraPlan::new(Some("http://mock/"));
        let window = DateWindow::new(day(1), day(2)).unwrap();
        let requests = plan.requests(&window);
        let labels: Vec<_> = requests.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["daily_sleep", "daily_readiness", "daily_activity", "sleep", "workout"]);
        assert_eq!(requests[4].request.url, "http://mock/v2/usercollection/workout");
        assert_eq!(
            requests[0].request.query,
            vec![("start_date".to_string(), "2025-01-01".to_string()), ("end_date".to_string(), "2025-01-03".to_string())]
        );
    }

    #[test]
    fn next_token_drives_pagination() {
        let plan = OuraPlan::new(None);
        let first = plan.collection("workout", day(1), day(1));
        let second = plan.next_page(&first, &json!({"data": [], "next_token": "abc"})).unwrap();
        let third = plan.next_page(&second, &json!({"data": [], "next_token": "def"})).unwrap();
        assert_eq!(third.request.query.iter().filter(|(k, _)| k == "next_token").count(), 1);
        assert!(plan.next_page(&third, &json!({"data": [], "next_token": null})).is_none());
    }

    #[test]
    fn assemble_groups_daily_collections_and_drops_out_of_window_days() {
        let plan = OuraPlan::new(None);
        let window = DateWindow::single(day(1));
        let pages = vec![
            PageBody { label: "daily_sleep".into(), body: json!({"data": [{"day": "2025-01-01", "score": 80}, {"day": "2025-01-02", "score": 70}]}) },
            PageBody { label: "sleep".into(), body: json!({"data": [
                {"day": "2025-01-01", "type": "sleep", "total_sleep_duration": 1800},
                {"day": "2025-01-01", "type": "long_sleep", "total_sleep_duration": 25200}
            ]}) },
            PageBody { label: "workout".into(), body: json!({"data": [{"id": "w1", "day": "2025-01-01"}]}) },
        ];
        let payloads = plan.assemble(&window, pages).unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].kind, PayloadKind::Daily);
        assert_eq!(payloads[0].body["daily_sleep"]["score"], 80);
        assert_eq!(payloads[0].body["sleep"]["type"], "long_sleep");
        assert_eq!(payloads[1].native_id.as_deref(), Some("w1"));

        let err = plan
            .assemble(&window, vec![PageBody { label: "sleep".into(), body: json!({"detail": "nope"}) }])
            .unwrap_err();
        assert!(err.contains("no `data` array"));
    }

    #[test]
    fn daily_id_is_stable_when_a_score_is_finalized() {
        let ctx = NormalizeContext::default();
        let payload = |score: i64| RawPayload {
            source: Source::Oura,
            kind: PayloadKind::Daily,
            day: day(1),
            native_id: None,
            body: json!({"daily_sleep": {"score": score}}),
        };
        let first = OuraNormalizer.normalize(&payload(70), &ctx).unwrap();
        let second = OuraNormalizer.normalize(&payload(78), &ctx).unwrap();
        assert_eq!(first[0].source_record_id, second[0].source_record_id);
        assert_ne!(first[0].fingerprint(), second[0].fingerprint());
    }

    #[test]
    fn empty_day_yields_no_record() {
        let payload = RawPayload {
            source: Source::Oura,
            kind: PayloadKind::Daily,
            day: day(1),
            native_id: None,
            body: json!({"daily_activity": {"steps": null}}),
        };
        assert!(OuraNormalizer.normalize(&payload, &NormalizeContext::default()).unwrap().is_empty());
    }

    #[test]
    fn workout_speed_is_derived_from_distance_when_missing() {
        let payload = RawPayload {
            source: Source::Oura,
            kind: PayloadKind::Workout,
            day: day(1),
            native_id: None,
            body: json!({
                "activity": "running",
                "start_datetime": "2025-01-01T07:00:00+00:00",
                "end_datetime": "2025-01-01T07:30:00+00:00",
                "distance": 5000.0
            }),
        };
        let records = OuraNormalizer.normalize(&payload, &NormalizeContext::default()).unwrap();
        let workout = records[0].workout.as_ref().unwrap();
        assert_eq!(workout.workout_type, "run");
        assert_eq!(workout.duration_min, Some(30.0));
        assert_eq!(workout.distance_km, Some(5.0));
        assert_eq!(workout.avg_speed_kmh, Some(10.0));
        assert_eq!(workout.pace_min_per_km, Some(6.0));
        assert!(records[0].source_record_id.starts_with("fp-"));
    }

    #[test]
    fn untimed_workouts_on_the_same_day_keep_distinct_ids() {
        let ctx = NormalizeContext::default();
        let workout = |calories: i64| RawPayload {
            source: Source::Oura,
            kind: PayloadKind::Workout,
            day: day(1),
            native_id: None,
            body: json!({"activity": "walking", "calories": calories, "duration": 1200}),
        };
        let morning = OuraNormalizer.normalize(&workout(90), &ctx).unwrap();
        let evening = OuraNormalizer.normalize(&workout(140), &ctx).unwrap();
        let again = OuraNormalizer.normalize(&workout(90), &ctx).unwrap();
        assert_ne!(morning[0].source_record_id, evening[0].source_record_id);
        assert_eq!(morning[0].source_record_id, again[0].source_record_id);
    }
}
