//! Rolla One web dashboard. There is no data API, so each day's dashboard
//! page is scraped: metric tiles plus the workout table, both rendered in
//! whatever display units the account is set to.

use chrono::NaiveDate;
use hsync_core::units::{clock_to_minutes, kmh_to_pace, miles_to_km, mph_to_kmh, normalize_workout_type, pace_per_mile_to_per_km, round_2dp};
use hsync_core::{fallback_record_id, SessionState, Source, UnifiedRecord, Workout};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value as JsonValue};

use super::trim_base;
use crate::browser::{BrowserSource, PageRequest, PageResponse};
use crate::normalize::{at, str_at, timestamp, NormalizationError, NormalizeContext, Normalizer};
use crate::{PayloadKind, RawPayload};

pub const DEFAULT_BASE_URL: &str = "https://app.rolla.app";

const SESSION_COOKIE: &str = "rolla_session";

#[derive(Debug, Clone)]
pub struct RollaOnePlan {
    base_url: String,
}

impl RollaOnePlan {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: trim_base(base_url.unwrap_or(DEFAULT_BASE_URL)),
        }
    }

    fn day_view(&self, day: NaiveDate) -> PageRequest {
        PageRequest::new("day", format!("{}/dashboard/day/{day}", self.base_url)).header("Accept", "text/html")
    }
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("bad selector `{css}`: {e}"))
}

fn text_of(el: ElementRef<'_>) -> Option<String> {
    let text = el.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// The `datetime` of a nested `<time>`, else the element's `.value` text, else its text.
fn cell_value(el: ElementRef<'_>, time_sel: &Selector, value_sel: &Selector) -> Option<String> {
    if let Some(dt) = el.select(time_sel).next().and_then(|t| t.value().attr("datetime")) {
        return Some(dt.trim().to_string());
    }
    el.select(value_sel).next().and_then(text_of).or_else(|| text_of(el))
}

fn scrape_day(html: &str) -> Result<(JsonValue, Vec<(Option<String>, JsonValue)>), String> {
    let doc = Html::parse_document(html);
    let summary_sel = selector(".day-summary")?;
    let tile_sel = selector("[data-metric]")?;
    let time_sel = selector("time[datetime]")?;
    let value_sel = selector(".value")?;
    let row_sel = selector("table.workouts tr[data-workout-id]")?;
    let cell_sel = selector("td[data-col]")?;

    let summary = doc
        .select(&summary_sel)
        .next()
        .ok_or_else(|| "day page has no `.day-summary` block".to_string())?;
    let units = summary.value().attr("data-units").unwrap_or("metric").to_ascii_lowercase();

    let mut metrics = Map::new();
    for tile in summary.select(&tile_sel) {
        let (Some(name), Some(value)) = (tile.value().attr("data-metric"), cell_value(tile, &time_sel, &value_sel)) else {
            continue;
        };
        metrics.insert(name.to_string(), JsonValue::String(value));
    }
    let daily = json!({"units": units, "metrics": metrics});

    let mut workouts = Vec::new();
    for row in doc.select(&row_sel) {
        let id = row
            .value()
            .attr("data-workout-id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let mut cells = Map::new();
        for cell in row.select(&cell_sel) {
            if let (Some(col), Some(value)) = (cell.value().attr("data-col"), cell_value(cell, &time_sel, &value_sel)) {
                cells.insert(col.to_string(), JsonValue::String(value));
            }
        }
        cells.insert("units".to_string(), JsonValue::String(units.clone()));
        workouts.push((id, JsonValue::Object(cells)));
    }
    Ok((daily, workouts))
}

impl BrowserSource for RollaOnePlan {
    fn source(&self) -> Source {
        Source::RollaOne
    }

    fn required_cookies(&self) -> &'static [&'static str] {
        &[SESSION_COOKIE]
    }

    fn views(&self, day: NaiveDate, _session: &SessionState) -> Vec<PageRequest> {
        vec![self.day_view(day)]
    }

    fn is_login_page(&self, page: &PageResponse) -> bool {
        let url = page.final_url.to_ascii_lowercase();
        if matches!(page.status, 401 | 403) || url.contains("/login") || url.contains("/signin") {
            return true;
        }
        // expired sessions are served the sign-in form in place
        let Ok(password) = selector("input[type=password]") else {
            return false;
        };
        Html::parse_document(&page.body).select(&password).next().is_some()
    }

    fn extract(&self, day: NaiveDate, pages: &[(PageRequest, PageResponse)]) -> Result<Vec<RawPayload>, String> {
        let mut out = Vec::new();
        for (_, page) in pages {
            let (daily, workouts) = scrape_day(&page.body)?;
            out.push(RawPayload {
                source: Source::RollaOne,
                kind: PayloadKind::Daily,
                day,
                native_id: None,
                body: daily,
            });
            out.extend(workouts.into_iter().map(|(native_id, body)| RawPayload {
                source: Source::RollaOne,
                kind: PayloadKind::Workout,
                day,
                native_id,
                body,
            }));
        }
        Ok(out)
    }

    fn probe_view(&self, today: NaiveDate, _session: &SessionState) -> PageRequest {
        self.day_view(today)
    }
}

/// First number in `text`, ignoring thousands separators: `"10,234 steps"` → 10234.
fn leading_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit() || c == '-' || c == '.')?;
    let number: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .filter(|c| *c != ',')
        .collect();
    number.parse().ok()
}

/// `"7h 32m"`, `"45m 10s"`, `"1:02:30"` or bare minutes.
fn duration_minutes(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.contains(':') {
        return clock_to_minutes(text);
    }
    let mut total = 0.0;
    let mut seen = false;
    let mut number = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let scale = match c.to_ascii_lowercase() {
            'h' => 60.0,
            'm' => 1.0,
            's' => 1.0 / 60.0,
            _ => continue,
        };
        if let Ok(value) = number.parse::<f64>() {
            total += value * scale;
            seen = true;
        }
        number.clear();
    }
    if !number.is_empty() {
        total += number.parse::<f64>().ok()?;
        seen = true;
    }
    seen.then(|| round_2dp(total))
}

/// Unit words decide; the account setting only applies to bare numbers.
fn is_imperial(text: &str, units: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    let mut words = lower.split(|c: char| !c.is_ascii_alphabetic()).filter(|word| !word.is_empty());
    match words.find(|word| matches!(*word, "km" | "kms" | "kmh" | "kph" | "mi" | "mile" | "miles" | "mph")) {
        Some(word) => matches!(word, "mi" | "mile" | "miles" | "mph"),
        None => units == "imperial",
    }
}

fn distance_km(text: &str, units: &str) -> Option<f64> {
    let value = leading_number(text)?;
    Some(if is_imperial(text, units) { miles_to_km(value) } else { round_2dp(value) })
}

/// `"8:00 /mi"` or `"4:58 /km"` to minutes per kilometre.
fn pace_min_per_km(text: &str, units: &str) -> Option<f64> {
    let clock = text.split('/').next()?.split_whitespace().next()?;
    let minutes = clock_to_minutes(clock)?;
    Some(if is_imperial(text, units) { pace_per_mile_to_per_km(minutes) } else { minutes })
}

fn speed_kmh(text: &str, units: &str) -> Option<f64> {
    let value = leading_number(text)?;
    Some(if is_imperial(text, units) { mph_to_kmh(value) } else { round_2dp(value) })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollaOneNormalizer;

impl RollaOneNormalizer {
    fn daily(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let metrics = at(&payload.body, &["metrics"])
            .filter(|m| m.is_object())
            .ok_or_else(|| NormalizationError::new(payload, "scraped day has no metrics block"))?;
        let int = |name: &str| str_at(metrics, &[name]).and_then(leading_number).map(|v| v.round() as i64);

        let id = fallback_record_id(Source::RollaOne, payload.day, PayloadKind::Daily.as_str(), &[]);
        let mut record = UnifiedRecord::new(payload.day, Source::RollaOne, id);
        record.bedtime = at(metrics, &["bedtime"]).and_then(|v| timestamp(v, &ctx.tz));
        record.wake_time = at(metrics, &["wake_time"]).and_then(|v| timestamp(v, &ctx.tz));
        record.sleep_duration_min = str_at(metrics, &["sleep_duration"]).and_then(duration_minutes);
        record.sleep_score = int("sleep_score");
        record.rhr_bpm = int("resting_hr");
        record.hrv_ms = int("hrv");
        record.readiness_or_body_battery_score = int("recovery");
        record.health_score = int("health_score");
        record.steps = int("steps");
        record.active_calories = int("active_calories");
        record.activity_score = int("activity_score");

        Ok(if record.has_metrics() { vec![record] } else { Vec::new() })
    }

    fn workout(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
        let body = &payload.body;
        if !body.is_object() {
            return Err(NormalizationError::new(payload, "workout row is not an object"));
        }
        let units = str_at(body, &["units"]).unwrap_or("metric");
        let int = |name: &str| str_at(body, &[name]).and_then(leading_number).map(|v| v.round() as i64);

        let start = at(body, &["start"]).and_then(|v| timestamp(v, &ctx.tz));
        let date = start.map(|ts| ts.date_naive()).unwrap_or(payload.day);

        let mut workout = Workout::of_type(normalize_workout_type(str_at(body, &["type"]).unwrap_or("other")));
        workout.duration_min = str_at(body, &["duration"]).and_then(duration_minutes);
        workout.distance_km = str_at(body, &["distance"]).and_then(|t| distance_km(t, units)).filter(|km| *km > 0.0);
        workout.pace_min_per_km = str_at(body, &["pace"]).and_then(|t| pace_min_per_km(t, units));
        workout.avg_speed_kmh = str_at(body, &["speed"]).and_then(|t| speed_kmh(t, units));
        if let (None, Some(km), Some(min)) = (workout.avg_speed_kmh, workout.distance_km, workout.duration_min.filter(|m| *m > 0.0)) {
            let kmh = km / (min / 60.0);
            workout.avg_speed_kmh = Some(round_2dp(kmh));
            if workout.pace_min_per_km.is_none() {
                workout.pace_min_per_km = kmh_to_pace(kmh);
            }
        }
        workout.avg_hr_bpm = int("avg_hr");
        workout.max_hr_bpm = int("max_hr");
        workout.active_calories = int("calories");
        workout.strain_score = int("strain");

        let id = match &payload.native_id {
            Some(id) => id.clone(),
            None => {
                let started = start
                    .map(|ts| ts.to_rfc3339())
                    .ok_or_else(|| NormalizationError::new(payload, "workout row has neither an id nor a start time"))?;
                fallback_record_id(Source::RollaOne, date, PayloadKind::Workout.as_str(), &[&started, &workout.workout_type])
            }
        };
        let mut record = UnifiedRecord::new(date, Source::RollaOne, id);
        record.workout = Some(workout);
        Ok(vec![record])
    }
}

impl Normalizer for RollaOneNormalizer {
    fn source(&self) -> Source {
        Source::RollaOne
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

    fn page(body: &str) -> PageResponse {
        PageResponse {
            status: 200,
            final_url: "https://app.rolla.app/dashboard/day/2025-01-02".into(),
            content_type: Some("text/html".into()),
            body: body.into(),
            set_cookies: Vec::new(),
        }
    }

    #[test]
    fn text_helpers_parse_dashboard_vocabulary() {
        assert_eq!(leading_number("10,234 steps"), Some(10234.0));
        assert_eq!(leading_number("52 bpm"), Some(52.0));
        assert_eq!(leading_number("--"), None);
        assert_eq!(duration_minutes("7h 32m"), Some(452.0));
        assert_eq!(duration_minutes("45m 30s"), Some(45.5));
        assert_eq!(duration_minutes("1:02:30"), Some(62.5));
        assert_eq!(duration_minutes("n/a"), None);
    }

    #[test]
    fn imperial_units_are_converted() {
        assert_eq!(distance_km("3.1 mi", "imperial"), Some(4.99));
        assert_eq!(distance_km("5.2 km", "imperial"), Some(5.2));
        assert_eq!(distance_km("10", "imperial"), Some(16.09));
        assert_eq!(pace_min_per_km("8:00 /mi", "metric"), Some(4.97));
        assert_eq!(pace_min_per_km("5:30 /km", "imperial"), Some(5.5));
        assert_eq!(speed_kmh("10 mph", "metric"), Some(16.09));
    }

    #[test]
    fn minute_suffix_is_not_read_as_miles() {
        assert_eq!(pace_min_per_km("5:00 min", "metric"), Some(5.0));
        assert_eq!(pace_min_per_km("5:00 min/km", "metric"), Some(5.0));
        assert_eq!(distance_km("4.2 miles", "metric"), Some(6.76));
        assert_eq!(speed_kmh("12 km/h", "imperial"), Some(12.0));
    }

    #[test]
    fn password_form_is_a_login_page() {
        let plan = RollaOnePlan::new(None);
        assert!(plan.is_login_page(&page(r#"<form><input type="password" name="pw"></form>"#)));
        assert!(!plan.is_login_page(&page(r#"<div class="day-summary"></div>"#)));
    }

    #[test]
    fn page_without_summary_is_rejected() {
        let plan = RollaOnePlan::new(None);
        let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let err = plan
            .extract(day, &[(plan.day_view(day), page("<html><body>maintenance</body></html>"))])
            .unwrap_err();
        assert!(err.contains("day-summary"));
    }
}
