//! Withings public API: sleep summaries and daily activity.
//!
//! Every call is a form POST with an `action` field, answered with HTTP 200
//! and a `{"status": n, "body": {...}}` envelope. Status 0 is success; 401
//! inside the envelope is an expired token. Listings page with `more` and
//! `offset`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use hsync_core::units::seconds_to_minutes;
use hsync_core::{fallback_record_id, Source, UnifiedRecord};
use hsync_storage::HttpRequest;
use serde_json::{Map, Value as JsonValue};

use super::trim_base;
use crate::api::{ApiSource, PageBody, PlannedRequest};
use crate::normalize::{as_number, at, first_int, first_number, str_at, timestamp, NormalizationError, NormalizeContext, Normalizer};
use crate::{DateWindow, PayloadKind, RawPayload};

pub const DEFAULT_BASE_URL: &str = "https://wbsapi.withings.net";

const SLEEP: &str = "sleep";
const ACTIVITY: &str = "activity";

const SLEEP_FIELDS: &str =
    "total_sleep_time,asleepduration,sleep_score,hr_average,hr_min,hr_max,rmssd_average,total_timeinbed,wakeupcount";
const SLEEP_SECONDS: [&str; 3] = ["total_sleep_time", "asleepduration", "duration"];
const STATUS_INVALID_TOKEN: i64 = 401;

#[derive(Debug, Clone)]
pub struct WithingsPlan {
    base_url: String,
}

impl WithingsPlan {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: trim_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
        }
    }

    fn call(&self, label: &str, path: &str, action: &str, start: NaiveDate, end: NaiveDate) -> PlannedRequest {
        let mut form = vec![
            ("action".to_string(), action.to_string()),
            ("startdateymd".to_string(), start.to_string()),
            ("enddateymd".to_string(), end.to_string()),
        ];
        if label == SLEEP {
            form.push(("data_fields".to_string(), SLEEP_FIELDS.to_string()));
        }
        PlannedRequest::new(
            label,
            HttpRequest::post_form(format!("{}{path}", self.base_url), form).header("Accept", "application/json"),
        )
    }

    fn sleep(&self, window: &DateWindow) -> PlannedRequest {
        self.call(SLEEP, "/v2/sleep", "getsummary", window.start, window.end)
    }

    fn activity(&self, start: NaiveDate, end: NaiveDate) -> PlannedRequest {
        self.call(ACTIVITY, "/v2/measure", "getactivity", start, end)
    }
}

fn envelope_status(body: &JsonValue) -> Option<i64> {
    body.get("status").and_then(JsonValue::as_i64)
}

/// The `body` of a successful envelope.
fn unwrap_envelope<'a>(label: &str, page: &'a JsonValue) -> Result<&'a JsonValue, String> {
    match envelope_status(page) {
        Some(0) => page
            .get("body")
            .filter(|body| body.is_object())
            .ok_or_else(|| format!("`{label}` envelope has no body")),
        Some(status) => {
            let error = str_at(page, &["error"]).unwrap_or("no detail");
            Err(format!("`{label}` returned status {status}: {error}"))
        }
        None => Err(format!("`{label}` is not a Withings envelope")),
    }
}

impl ApiSource for WithingsPlan {
    fn source(&self) -> Source {
        Source::Withings
    }

    fn requests(&self, window: &DateWindow) -> Vec<PlannedRequest> {
        vec![self.sleep(window), self.activity(window.start, window.end)]
    }

    fn next_page(&self, previous: &PlannedRequest, body: &JsonValue) -> Option<PlannedRequest> {
        let inner = body.get("body")?;
        let more = match inner.get("more")? {
            JsonValue::Bool(more) => *more,
            other => as_number(other).is_some_and(|n| n != 0.0),
        };
        if !more {
            return None;
        }
        let offset = inner.get("offset").and_then(as_number)? as i64;
        let mut next = previous.clone();
        if let Some(form) = next.request.form.as_mut() {
            form.retain(|(key, _)| key != "offset");
            form.push(("offset".to_string(), offset.to_string()));
        }
        Some(next)
    }

    fn assemble(&self, window: &DateWindow, pages: Vec<PageBody>) -> Result<Vec<RawPayload>, String> {
        let mut nights: Vec<JsonValue> = Vec::new();
        let mut activities: Vec<JsonValue> = Vec::new();

        for page in &pages {
            let body = unwrap_envelope(&page.label, &page.body)?;
            let (key, into) = match page.label.as_str() {
                SLEEP => ("series", &mut nights),
                ACTIVITY => ("activities", &mut activities),
                label => return Err(format!("unexpected request label `{label}`")),
            };
            match body.get(key) {
                Some(JsonValue::Array(items)) => into.extend(items.iter().cloned()),
                None | Some(JsonValue::Null) => {}
                Some(_) => return Err(format!("`{}` has a non-array `{key}`", page.label)),
            }
        }

        let mut days: BTreeMap<NaiveDate, Map<String, JsonValue>> = BTreeMap::new();
        for day in window.days() {
            let day_text = day.to_string();
            let on_day = |item: &&JsonValue| str_at(item, &["date"]) == Some(day_text.as_str());
            let night = nights
                .iter()
                .filter(on_day)
                .max_by(|a, b| night_seconds(a).total_cmp(&night_seconds(b)));
            if let Some(night) = night {
                days.entry(day).or_default().insert("sleep".to_string(), night.clone());
            }
            if let Some(activity) = activities.iter().find(on_day) {
                days.entry(day).or_default().insert("activity".to_string(), activity.clone());
            }
        }

        Ok(days
            .into_iter()
            .map(|(day, body)| RawPayload {
                source: Source::Withings,
                kind: PayloadKind::Daily,
                day,
                native_id: None,
                body: JsonValue::Object(body),
            })
            .collect())
    }

    fn probe_request(&self, today: NaiveDate) -> PlannedRequest {
        self.activity(today, today)
    }

    fn rejects_token(&self, body: &JsonValue) -> bool {
        envelope_status(body) == Some(STATUS_INVALID_TOKEN)
    }
}

fn night_seconds(night: &JsonValue) -> f64 {
    at(night, &["data"]).and_then(|data| first_number(data, &SLEEP_SECONDS)).unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WithingsNormalizer;

impl Normalizer for WithingsNormalizer {
    fn source(&self) -> Source {
        Source::Withings
    }

    fn normalize(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let body = &payload.body;
        if payload.kind != PayloadKind::Daily {
            return Err(NormalizationError::new(payload, "only daily summaries are read"));
        }
        if !body.is_object() {
            return Err(NormalizationError::new(payload, "daily payload is not an object"));
        }

        let id = fallback_record_id(Source::Withings, payload.day, PayloadKind::Daily.as_str(), &[]);
        let mut record = UnifiedRecord::new(payload.day, Source::Withings, id);

        if let Some(night) = at(body, &["sleep"]) {
            record.bedtime = at(night, &["startdate"]).and_then(|v| timestamp(v, &ctx.tz));
            record.wake_time = at(night, &["enddate"]).and_then(|v| timestamp(v, &ctx.tz));
            if let Some(data) = at(night, &["data"]) {
                record.sleep_duration_min = first_number(data, &SLEEP_SECONDS).map(seconds_to_minutes);
                record.sleep_score = first_int(data, &["sleep_score", "score"]);
                record.rhr_bpm = first_int(data, &["hr_min", "hr_average"]);
                record.hrv_ms = first_int(data, &["rmssd_average", "rmssd"]);
            }
        }

        if let Some(activity) = at(body, &["activity"]) {
            record.steps = first_int(activity, &["steps"]);
            record.active_calories = first_int(activity, &["calories", "caloriesactive"]);
        }

        Ok(if record.has_metrics() { vec![record] } else { Vec::new() })
    }
}
