//! Polar AccessLink v3: sleep nights, nightly recharge and daily activity.
//!
//! Sleep and recharge are listed over the window padded by a day on each
//! side, since a night belongs to the day it ends on. Activity is read per
//! day. AccessLink answers 404 for "nothing recorded", which is not an error.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use hsync_core::units::seconds_to_minutes;
use hsync_core::{fallback_record_id, Source, UnifiedRecord};
use hsync_storage::HttpRequest;
use serde_json::{Map, Value as JsonValue};

use super::trim_base;
use crate::api::{ApiSource, PageBody, PlannedRequest};
use crate::normalize::{as_number, at, first_int, first_number, str_at, timestamp, NormalizationError, NormalizeContext, Normalizer};
use crate::{DateWindow, PayloadKind, RawPayload};

pub const DEFAULT_BASE_URL: &str = "https://www.polaraccesslink.com";

const SLEEP: &str = "sleep";
const RECHARGE: &str = "nightly_recharge";
const ACTIVITY_PREFIX: &str = "activity:";

const LIST_KEYS: [&str; 7] = ["data", "items", "nights", "recharges", "summaries", "activities", "physical_activities"];
const NIGHT_START: [&str; 3] = ["sleep_start_time", "start_time", "bedtime_start"];
const NIGHT_END: [&str; 3] = ["sleep_end_time", "end_time", "bedtime_end"];
const NIGHT_SECONDS: [&str; 3] = ["total_sleep_time", "actual_sleep_time", "duration"];
const SLEEP_STAGES: [&str; 3] = ["light_sleep", "deep_sleep", "rem_sleep"];

#[derive(Debug, Clone)]
pub struct PolarPlan {
    base_url: String,
}

impl PolarPlan {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: trim_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
        }
    }

    fn get(&self, path: &str) -> HttpRequest {
        HttpRequest::get(format!("{}/v3/users/{path}", self.base_url)).header("Accept", "application/json")
    }

    fn listing(&self, label: &str, path: &str, window: &DateWindow) -> PlannedRequest {
        PlannedRequest::new(
            label,
            self.get(path)
                .query("start_date", (window.start - Duration::days(1)).to_string())
                .query("end_date", (window.end + Duration::days(1)).to_string()),
        )
        .optional()
    }

    fn activity(&self, day: NaiveDate) -> PlannedRequest {
        PlannedRequest::new(
            format!("{ACTIVITY_PREFIX}{day}"),
            self.get(&format!("activities/{day}")).query("steps", "true"),
        )
        .optional()
    }
}

impl ApiSource for PolarPlan {
    fn source(&self) -> Source {
        Source::Polar
    }

    fn requests(&self, window: &DateWindow) -> Vec<PlannedRequest> {
        let mut out = vec![
            self.listing(SLEEP, "sleep", window),
            self.listing(RECHARGE, "nightly-recharge", window),
        ];
        out.extend(window.days().map(|day| self.activity(day)));
        out
    }

    fn next_page(&self, _previous: &PlannedRequest, _body: &JsonValue) -> Option<PlannedRequest> {
        None
    }

    fn assemble(&self, window: &DateWindow, pages: Vec<PageBody>) -> Result<Vec<RawPayload>, String> {
        let mut nights = Vec::new();
        let mut recharges = Vec::new();
        let mut days: BTreeMap<NaiveDate, Map<String, JsonValue>> = BTreeMap::new();

        for page in pages {
            if page.body.is_null() {
                continue;
            }
            let items = list_items(&page.body).ok_or_else(|| format!("`{}` page has an unexpected shape", page.label))?;
            match page.label.as_str() {
                SLEEP => nights.extend(items),
                RECHARGE => recharges.extend(items),
                label => {
                    let day = label
                        .strip_prefix(ACTIVITY_PREFIX)
                        .and_then(|d| d.parse::<NaiveDate>().ok())
                        .ok_or_else(|| format!("unexpected request label `{label}`"))?;
                    let day_text = day.to_string();
                    let summary = match items.as_slice() {
                        [only] => Some(only.clone()),
                        many => many.iter().find(|it| str_at(it, &["date"]) == Some(day_text.as_str())).cloned(),
                    };
                    if let Some(summary) = summary {
                        days.entry(day).or_default().insert("activity".to_string(), summary);
                    }
                }
            }
        }

        for day in window.days() {
            let day_text = day.to_string();
            if let Some(night) = pick_night(&nights, day) {
                days.entry(day).or_default().insert("sleep".to_string(), night.clone());
            }
            if let Some(recharge) = recharges.iter().find(|it| str_at(it, &["date"]) == Some(day_text.as_str())) {
                days.entry(day).or_default().insert("recharge".to_string(), recharge.clone());
            }
        }

        Ok(days
            .into_iter()
            .filter(|(day, _)| window.contains(*day))
            .map(|(day, body)| RawPayload {
                source: Source::Polar,
                kind: PayloadKind::Daily,
                day,
                native_id: None,
                body: JsonValue::Object(body),
            })
            .collect())
    }

    fn probe_request(&self, today: NaiveDate) -> PlannedRequest {
        self.activity(today)
    }
}

/// The items of a listing: a bare array, an array under a known key, or a
/// single object standing for itself.
fn list_items(body: &JsonValue) -> Option<Vec<JsonValue>> {
    match body {
        JsonValue::Array(items) => Some(items.clone()),
        JsonValue::Object(map) => Some(
            LIST_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(JsonValue::as_array).cloned())
                .unwrap_or_else(|| if map.is_empty() { Vec::new() } else { vec![body.clone()] }),
        ),
        _ => None,
    }
}

/// Wall-clock time as the vendor reported it, offset ignored.
fn wall_clock(item: &JsonValue, keys: &[&str]) -> Option<NaiveDateTime> {
    let text = keys.iter().find_map(|key| str_at(item, &[*key]))?;
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

fn night_seconds(item: &JsonValue) -> f64 {
    first_number(item, &NIGHT_SECONDS).unwrap_or(0.0)
}

/// The night ending on `day` (longest if several), else the one overlapping
/// `day` the most.
fn pick_night(nights: &[JsonValue], day: NaiveDate) -> Option<&JsonValue> {
    let start = day.and_hms_opt(0, 0, 0)?;
    let end = start + Duration::days(1);

    let ending = nights
        .iter()
        .filter(|night| wall_clock(night, &NIGHT_END).is_some_and(|at| start <= at && at < end))
        .max_by(|a, b| night_seconds(a).total_cmp(&night_seconds(b)));
    if ending.is_some() {
        return ending;
    }

    let overlap = |night: &JsonValue| -> i64 {
        match (wall_clock(night, &NIGHT_START), wall_clock(night, &NIGHT_END)) {
            (Some(s), Some(e)) => (e.min(end) - s.max(start)).num_seconds().max(0),
            _ => 0,
        }
    };
    nights
        .iter()
        .map(|night| (overlap(night), night))
        .filter(|(secs, _)| *secs > 0)
        .max_by_key(|(secs, _)| *secs)
        .map(|(_, night)| night)
}

/// Lowest heart rate of the night: reported directly, or the minimum of the
/// per-minute samples.
fn lowest_night_hr(night: &JsonValue) -> Option<i64> {
    first_int(night, &["lowest_heart_rate", "lowest_hr", "lowest_hrt"]).or_else(|| {
        at(night, &["heart_rate_samples"])?
            .as_object()?
            .values()
            .filter_map(as_number)
            .map(|v| v.round() as i64)
            .min()
    })
}

/// Recharge fields sit at the top level or under `ans`, `ans_charge` or
/// `recharge.ans`, depending on the API revision.
fn recharge_int(recharge: &JsonValue, keys: &[&str]) -> Option<i64> {
    let nested = [&["ans"][..], &["ans_charge"][..], &["recharge", "ans"][..]];
    std::iter::once(Some(recharge))
        .chain(nested.iter().map(|path| at(recharge, path).filter(|v| v.is_object())))
        .flatten()
        .find_map(|node| first_int(node, keys))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolarNormalizer;

impl Normalizer for PolarNormalizer {
    fn source(&self) -> Source {
        Source::Polar
    }

    fn normalize(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let body = &payload.body;
        if payload.kind != PayloadKind::Daily {
            return Err(NormalizationError::new(payload, "only daily summaries are read"));
        }
        if !body.is_object() {
            return Err(NormalizationError::new(payload, "daily payload is not an object"));
        }

        let id = fallback_record_id(Source::Polar, payload.day, PayloadKind::Daily.as_str(), &[]);
        let mut record = UnifiedRecord::new(payload.day, Source::Polar, id);

        if let Some(night) = at(body, &["sleep"]) {
            record.bedtime = NIGHT_START.iter().find_map(|key| at(night, &[*key])).and_then(|v| timestamp(v, &ctx.tz));
            record.wake_time = NIGHT_END.iter().find_map(|key| at(night, &[*key])).and_then(|v| timestamp(v, &ctx.tz));
            let seconds = first_number(night, &NIGHT_SECONDS).or_else(|| {
                let staged: f64 = SLEEP_STAGES.iter().filter_map(|key| first_number(night, &[*key])).sum();
                (staged > 0.0).then_some(staged)
            });
            record.sleep_duration_min = seconds.map(seconds_to_minutes);
            record.sleep_score = first_int(night, &["sleep_score", "score"]);
            record.rhr_bpm = lowest_night_hr(night);
        }

        if let Some(recharge) = at(body, &["recharge"]) {
            record.hrv_ms = recharge_int(
                recharge,
                &["rmssd", "rmssd_ms", "hrv", "heart_rate_variability_avg", "heart_rate_variabilty_avg"],
            );
            if record.rhr_bpm.is_none() {
                record.rhr_bpm = recharge_int(recharge, &["resting_hr", "resting_heart_rate"]);
            }
            record.readiness_or_body_battery_score = recharge_int(
                recharge,
                &["ans_charge", "ans_charge_score", "overall_score", "recharge_score", "score", "nightly_recharge_status"],
            );
        }

        if let Some(activity) = at(body, &["activity"]) {
            record.steps = first_int(activity, &["steps", "step_count", "stepCount"]);
            record.active_calories = first_int(activity, &["active_calories", "calories_active", "activeCalories"]);
        }

        Ok(if record.has_metrics() { vec![record] } else { Vec::new() })
    }
}
