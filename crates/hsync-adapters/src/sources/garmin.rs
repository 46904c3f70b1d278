//! Garmin Connect, read through the JSON endpoints its web dashboard uses.
//!
//! The dashboard authenticates with a JWT kept in local storage plus the
//! `JWT_FGP` device cookie; both come from the captured browser session.

use chrono::{NaiveDate, NaiveDateTime};
use hsync_core::units::{meters_to_km, normalize_workout_type, seconds_to_minutes, speed_and_pace_from_mps};
use hsync_core::{fallback_record_id, SessionState, Source, UnifiedRecord, Workout};
use serde_json::{Map, Value as JsonValue};

use super::trim_base;
use crate::browser::{BrowserSource, PageRequest, PageResponse};
use crate::normalize::{at, first_int, first_number, int_at, number_at, str_at, NormalizationError, NormalizeContext, Normalizer};
use crate::{PayloadKind, RawPayload};

pub const DEFAULT_BASE_URL: &str = "https://connect.garmin.com/modern/proxy";
pub const DEFAULT_API_URL: &str = "https://connectapi.garmin.com";

const DEVICE_COOKIE: &str = "JWT_FGP";
const TOKEN_KEY: &str = "token";
const ACTIVITIES: &str = "activities";
const DAILY_VIEWS: [&str; 4] = ["sleep", "summary", "hrv", "body_battery"];

#[derive(Debug, Clone)]
pub struct GarminPlan {
    base_url: String,
    api_url: String,
}

impl Default for GarminPlan {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl GarminPlan {
    pub fn new(base_url: Option<&str>, api_url: Option<&str>) -> Self {
        Self {
            base_url: trim_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
            api_url: trim_base(api_url.unwrap_or(DEFAULT_API_URL)),
        }
    }

    /// Bearer token the dashboard keeps under `localStorage.token`.
    fn access_token(session: &SessionState) -> Option<String> {
        let raw = session.local_storage(TOKEN_KEY)?;
        let parsed: JsonValue = serde_json::from_str(raw).ok()?;
        str_at(&parsed, &["access_token"]).map(str::to_string)
    }

    fn view(&self, label: &str, path: &str, session: &SessionState) -> PageRequest {
        let mut view = PageRequest::new(label, format!("{}{path}", self.base_url))
            .alternate(format!("{}{path}", self.api_url))
            .header("Accept", "application/json, text/plain, */*")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("x-app-id", "com.garmin.connect.web")
            .header("NK", "NT");
        if let Some(token) = Self::access_token(session) {
            view = view
                .header("Authorization", format!("Bearer {token}"))
                .header("di-auth", format!("Bearer {token}"));
        }
        if let Some(fgp) = session.cookie(DEVICE_COOKIE) {
            view = view
                .header("DI-DEVICE-ID", fgp.value.as_str())
                .header("DI-APP-PLATFORM", "web");
        }
        view
    }

    fn wellness(&self, label: &str, endpoint: &str, day: NaiveDate, session: &SessionState) -> PageRequest {
        self.view(label, &format!("/wellness-service/wellness/{endpoint}"), session)
            .query("date", day.to_string())
    }
}

impl BrowserSource for GarminPlan {
    fn source(&self) -> Source {
        Source::Garmin
    }

    fn required_cookies(&self) -> &'static [&'static str] {
        &[DEVICE_COOKIE]
    }

    fn check_session(&self, session: &SessionState) -> Result<(), String> {
        Self::access_token(session)
            .map(|_| ())
            .ok_or_else(|| "no access token in the stored local storage".to_string())
    }

    fn views(&self, day: NaiveDate, session: &SessionState) -> Vec<PageRequest> {
        let summary = self
            .wellness("summary", "dailySummary", day, session)
            .alternate(format!(
                "{}/usersummary-service/usersummary/daily?calendarDate={day}",
                self.base_url
            ));
        let activities = self
            .view(ACTIVITIES, "/activitylist-service/activities/search/activities", session)
            .query("startDate", day.to_string())
            .query("endDate", day.to_string())
            .query("limit", "50");
        vec![
            self.wellness("sleep", "dailySleepData", day, session),
            summary,
            self.wellness("hrv", "dailyHrv", day, session),
            self.wellness("body_battery", "bodyBattery", day, session),
            activities,
        ]
    }

    fn is_login_page(&self, page: &PageResponse) -> bool {
        let html = page
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("text/html"));
        let url = page.final_url.to_ascii_lowercase();
        matches!(page.status, 401 | 403) || url.contains("/signin") || url.contains("/sso/") || (html && page.is_success())
    }

    fn extract(&self, day: NaiveDate, pages: &[(PageRequest, PageResponse)]) -> Result<Vec<RawPayload>, String> {
        let mut daily = Map::new();
        let mut out = Vec::new();

        for (view, page) in pages {
            let body = page
                .json()
                .ok_or_else(|| format!("`{}` did not return JSON", view.label))?;
            if view.label == ACTIVITIES {
                let list = match &body {
                    JsonValue::Array(items) => items.clone(),
                    other => at(other, &["activityList"])
                        .and_then(JsonValue::as_array)
                        .cloned()
                        .unwrap_or_default(),
                };
                for activity in list {
                    let native_id = at(&activity, &["activityId"]).map(|id| match id {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                    out.push(RawPayload {
                        source: Source::Garmin,
                        kind: PayloadKind::Workout,
                        day,
                        native_id,
                        body: activity,
                    });
                }
            } else if DAILY_VIEWS.contains(&view.label.as_str()) {
                daily.insert(view.label.clone(), body);
            }
        }

        if !daily.is_empty() {
            out.insert(
                0,
                RawPayload {
                    source: Source::Garmin,
                    kind: PayloadKind::Daily,
                    day,
                    native_id: None,
                    body: JsonValue::Object(daily),
                },
            );
        }
        Ok(out)
    }

    fn probe_view(&self, today: NaiveDate, session: &SessionState) -> PageRequest {
        self.wellness("summary", "dailySummary", today, session)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GarminNormalizer;

impl GarminNormalizer {
    fn daily(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let body = &payload.body;
        if !body.is_object() {
            return Err(NormalizationError::new(payload, "daily payload is not an object"));
        }
        let id = fallback_record_id(Source::Garmin, payload.day, PayloadKind::Daily.as_str(), &[]);
        let mut record = UnifiedRecord::new(payload.day, Source::Garmin, id);

        let empty = JsonValue::Null;
        let sleep = at(body, &["sleep"]).map(|s| at(s, &["dailySleepDTO"]).unwrap_or(s)).unwrap_or(&empty);
        let summary = at(body, &["summary"]).unwrap_or(&empty);
        let hrv = at(body, &["hrv"]).unwrap_or(&empty);
        let battery = match at(body, &["body_battery"]) {
            Some(JsonValue::Array(items)) => items.first().unwrap_or(&empty),
            Some(other) => other,
            None => &empty,
        };

        // the daily summary repeats the sleep window when the sleep view is empty
        let millis = |keys: &[&str]| {
            first_int(sleep, keys)
                .or_else(|| first_int(summary, keys))
                .and_then(|ms| ctx.tz.from_epoch_millis(ms))
        };
        record.bedtime = millis(&["sleepStartTimestampGMT", "sleepStartTimestampUTC", "overallSleepStartTimestamp"]);
        record.wake_time = millis(&["sleepEndTimestampGMT", "sleepEndTimestampUTC", "overallSleepEndTimestamp"]);

        let sleep_keys = ["durationInSeconds", "sleepTimeSeconds", "sleepingSeconds"];
        record.sleep_duration_min = first_number(sleep, &sleep_keys)
            .or_else(|| first_number(summary, &sleep_keys))
            .map(seconds_to_minutes);
        record.sleep_score = first_int(sleep, &["overallSleepScore", "sleepScore"])
            .or_else(|| int_at(sleep, &["sleepScores", "overall", "value"]))
            .or_else(|| first_int(summary, &["sleepScore"]));

        let lowest_sleep_hr = first_int(sleep, &["lowestHeartRate", "lowestRespirationHeartRate", "minHeartRate"]);
        let resting = first_int(summary, &["restingHeartRate", "minHeartRate"]).or_else(|| int_at(hrv, &["restingHeartRate"]));
        record.rhr_bpm = lowest_sleep_hr.or(resting);

        record.hrv_ms = first_int(hrv, &["avgRmssd", "rmssd", "averageRmssd"])
            .or_else(|| int_at(hrv, &["hrvSummary", "lastNightAvg"]));
        record.readiness_or_body_battery_score = first_int(
            battery,
            &["mostRecentValue", "mostRecent", "bodyBatteryMostRecent", "bodyBatteryMax"],
        );
        record.steps = first_int(summary, &["steps", "totalSteps"]);
        record.active_calories = first_int(summary, &["activeKilocalories", "activeCalories"]);

        Ok(if record.has_metrics() { vec![record] } else { Vec::new() })
    }

    fn workout(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let body = &payload.body;
        if !body.is_object() {
            return Err(NormalizationError::new(payload, "activity is not an object"));
        }
        let start = str_at(body, &["startTimeGMT"])
            .and_then(|text| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").ok())
            .map(|naive| ctx.tz.align(naive.and_utc()));
        let date = start.map(|ts| ts.date_naive()).unwrap_or(payload.day);
        let kind = str_at(body, &["activityType", "typeKey"]).unwrap_or("other");

        let mut workout = Workout::of_type(normalize_workout_type(kind));
        workout.duration_min = first_number(body, &["duration", "movingDuration"]).map(seconds_to_minutes);
        workout.distance_km = number_at(body, &["distance"]).filter(|m| *m > 0.0).map(meters_to_km);
        if let Some(mps) = number_at(body, &["averageSpeed"]) {
            (workout.avg_speed_kmh, workout.pace_min_per_km) = speed_and_pace_from_mps(mps);
        }
        workout.active_calories = first_int(body, &["activeKilocalories", "calories"]);
        workout.avg_hr_bpm = int_at(body, &["averageHR"]);
        workout.max_hr_bpm = int_at(body, &["maxHR"]);
        workout.strain_score = int_at(body, &["activityTrainingLoad"]);

        let id = match &payload.native_id {
            Some(id) => id.clone(),
            None => {
                let started = start.map(|ts| ts.to_rfc3339()).unwrap_or_default();
                if started.is_empty() {
                    return Err(NormalizationError::new(payload, "activity has neither an id nor a start time"));
                }
                fallback_record_id(Source::Garmin, date, PayloadKind::Workout.as_str(), &[&started, &workout.workout_type])
            }
        };
        let mut record = UnifiedRecord::new(date, Source::Garmin, id);
        record.workout = Some(workout);
        Ok(vec![record])
    }
}

impl Normalizer for GarminNormalizer {
    fn source(&self) -> Source {
        Source::Garmin
    }

    fn normalize(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        match payload.kind {
            PayloadKind::Daily => self.daily(payload, ctx),
            PayloadKind::Workout => self.workout(payload, ctx),
        }
    }
}
