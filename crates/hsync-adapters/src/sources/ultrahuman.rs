//! Ultrahuman partner API: one metrics document per user and day.
//!
//! The document's layout varies between ring firmware and API revisions, so
//! the normalizer searches it for known field aliases instead of fixed paths.

use chrono::NaiveDate;
use hsync_core::units::{round_2dp, seconds_to_minutes};
use hsync_core::{fallback_record_id, Source, UnifiedRecord};
use hsync_storage::HttpRequest;
use serde_json::Value as JsonValue;

use super::trim_base;
use crate::api::{ApiSource, PageBody, PlannedRequest};
use crate::normalize::{deep_find, deep_int, deep_number, timestamp, NormalizationError, NormalizeContext, Normalizer};
use crate::{DateWindow, PayloadKind, RawPayload};

pub const DEFAULT_BASE_URL: &str = "https://partner.ultrahuman.com";

const SLEEP_MINUTES: &[&str] = &["sleep_duration_min", "total_sleep_minutes", "sleep_minutes", "total_sleep", "duration_min"];
const SLEEP_SCORE: &[&str] = &["sleep_score", "sleep_quality_score"];
const RHR: &[&str] = &["rhr_bpm", "resting_heart_rate", "resting_hr", "avg_rhr", "lowest_rhr", "rhr"];
const HRV: &[&str] = &["hrv_ms", "avg_hrv", "rmssd_ms", "rmssd", "hrv"];
const READINESS: &[&str] = &["recovery_index", "recovery_score", "readiness", "readiness_score"];
const HEALTH: &[&str] = &["health_score", "metabolic_score"];
const STEPS: &[&str] = &["steps", "total_steps", "step_count"];
const ACTIVE_CALORIES: &[&str] = &["active_calories", "total_calories", "calories_active", "calories"];
const ACTIVITY_SCORE: &[&str] = &["activity_score", "movement_index", "movement_score"];
const BEDTIME: &[&str] = &["bedtime", "bed_time", "sleep_start", "start_time", "start"];
const WAKE_TIME: &[&str] = &["wake_time", "waketime", "sleep_end", "end_time", "end"];

/// Sleep totals above this are in seconds, not minutes.
const SLEEP_SECONDS_THRESHOLD: f64 = 2000.0;

#[derive(Debug, Clone)]
pub struct UltrahumanPlan {
    base_url: String,
    email: String,
}

impl UltrahumanPlan {
    pub fn new(base_url: Option<&str>, email: impl Into<String>) -> Self {
        Self {
            base_url: trim_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
            email: email.into(),
        }
    }

    fn metrics(&self, day: NaiveDate) -> PlannedRequest {
        PlannedRequest::new(
            day.to_string(),
            HttpRequest::get(format!("{}/api/v1/metrics", self.base_url))
                .query("email", self.email.as_str())
                .query("date", day.to_string()),
        )
    }
}

impl ApiSource for UltrahumanPlan {
    fn source(&self) -> Source {
        Source::Ultrahuman
    }

    fn requests(&self, window: &DateWindow) -> Vec<PlannedRequest> {
        window.days().map(|day| self.metrics(day)).collect()
    }

    fn next_page(&self, _previous: &PlannedRequest, _body: &JsonValue) -> Option<PlannedRequest> {
        None
    }

    fn assemble(&self, _window: &DateWindow, pages: Vec<PageBody>) -> Result<Vec<RawPayload>, String> {
        let mut out = Vec::new();
        for page in pages {
            let day = page
                .label
                .parse::<NaiveDate>()
                .map_err(|_| format!("unexpected request label `{}`", page.label))?;
            if matches!(&page.body, JsonValue::Null) || page.body.as_object().is_some_and(|o| o.is_empty()) {
                continue;
            }
            out.push(RawPayload {
                source: Source::Ultrahuman,
                kind: PayloadKind::Daily,
                day,
                native_id: None,
                body: page.body,
            });
        }
        Ok(out)
    }

    fn probe_request(&self, today: NaiveDate) -> PlannedRequest {
        self.metrics(today)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UltrahumanNormalizer;

impl Normalizer for UltrahumanNormalizer {
    fn source(&self) -> Source {
        Source::Ultrahuman
    }

    fn normalize(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let body = &payload.body;
        if payload.kind != PayloadKind::Daily {
            return Err(NormalizationError::new(payload, "only daily metrics are published"));
        }
        if !body.is_object() {
            return Err(NormalizationError::new(payload, "metrics document is not an object"));
        }

        let id = fallback_record_id(Source::Ultrahuman, payload.day, PayloadKind::Daily.as_str(), &[]);
        let mut record = UnifiedRecord::new(payload.day, Source::Ultrahuman, id);
        record.sleep_duration_min = deep_number(body, SLEEP_MINUTES).map(|v| {
            if v > SLEEP_SECONDS_THRESHOLD {
                seconds_to_minutes(v)
            } else {
                round_2dp(v)
            }
        });
        record.sleep_score = deep_int(body, SLEEP_SCORE);
        record.rhr_bpm = deep_int(body, RHR);
        record.hrv_ms = deep_int(body, HRV);
        record.readiness_or_body_battery_score = deep_int(body, READINESS);
        record.health_score = deep_int(body, HEALTH);
        record.steps = deep_int(body, STEPS);
        record.active_calories = deep_int(body, ACTIVE_CALORIES);
        record.activity_score = deep_int(body, ACTIVITY_SCORE);
        record.bedtime = deep_find(body, BEDTIME).and_then(|v| timestamp(v, &ctx.tz));
        record.wake_time = deep_find(body, WAKE_TIME).and_then(|v| timestamp(v, &ctx.tz));

        Ok(if record.has_metrics() { vec![record] } else { Vec::new() })
    }
}
