//! Raw payload → unified record mapping, plus the JSON lookup helpers the
//! per-source normalizers share.

use std::collections::VecDeque;

use chrono::{DateTime, FixedOffset, NaiveDate};
use hsync_core::{ReportingTz, Source, UnifiedRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::RawPayload;

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeContext {
    pub tz: ReportingTz,
}

impl NormalizeContext {
    pub fn new(tz: ReportingTz) -> Self {
        Self { tz }
    }
}

/// A payload that could not be mapped. Scoped to one record; the run goes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{vendor} {day}{}: {reason}", .native_id.as_deref().map(|id| format!(" ({id})")).unwrap_or_default())]
pub struct NormalizationError {
    #[serde(rename = "source")]
    pub vendor: Source,
    pub day: NaiveDate,
    pub native_id: Option<String>,
    pub reason: String,
}

impl NormalizationError {
    pub fn new(payload: &RawPayload, reason: impl Into<String>) -> Self {
        Self {
            vendor: payload.source,
            day: payload.day,
            native_id: payload.native_id.clone(),
            reason: reason.into(),
        }
    }
}

pub trait Normalizer: Send + Sync {
    fn source(&self) -> Source;

    /// Zero records when the payload carries no mappable metric.
    fn normalize(&self, payload: &RawPayload, ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError>;
}

/// Normalizes a batch, collecting per-payload failures instead of stopping.
pub fn normalize_payloads(
    normalizer: &dyn Normalizer,
    payloads: &[RawPayload],
    ctx: &NormalizeContext,
) -> (Vec<UnifiedRecord>, Vec<NormalizationError>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for payload in payloads {
        if payload.source != normalizer.source() {
            let err = NormalizationError::new(payload, format!("payload routed to the {} normalizer", normalizer.source()));
            warn!(error = %err, "skipping payload");
            errors.push(err);
            continue;
        }
        match normalizer.normalize(payload, ctx) {
            Ok(mut out) => records.append(&mut out),
            Err(err) => {
                warn!(error = %err, "skipping payload");
                errors.push(err);
            }
        }
    }
    (records, errors)
}

pub(crate) fn at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    (!cur.is_null()).then_some(cur)
}

/// Numbers, or strings holding a number (vendors are inconsistent).
pub(crate) fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

pub(crate) fn number_at(value: &JsonValue, path: &[&str]) -> Option<f64> {
    at(value, path).and_then(as_number)
}

pub(crate) fn int_at(value: &JsonValue, path: &[&str]) -> Option<i64> {
    number_at(value, path).map(|v| v.round() as i64)
}

pub(crate) fn str_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    at(value, path)?.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// First present number among sibling keys.
pub(crate) fn first_number(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| number_at(value, &[*key]))
}

pub(crate) fn first_int(value: &JsonValue, keys: &[&str]) -> Option<i64> {
    first_number(value, keys).map(|v| v.round() as i64)
}

/// Breadth-first search for the first key matching any alias
/// (case-insensitive), anywhere in the document.
pub(crate) fn deep_find<'a>(value: &'a JsonValue, aliases: &[&str]) -> Option<&'a JsonValue> {
    let mut queue = VecDeque::from([value]);
    while let Some(node) = queue.pop_front() {
        match node {
            JsonValue::Object(map) => {
                let hit = aliases.iter().find_map(|alias| {
                    map.iter()
                        .find(|(key, v)| key.eq_ignore_ascii_case(alias) && !v.is_null() && !v.is_object() && !v.is_array())
                        .map(|(_, v)| v)
                });
                if hit.is_some() {
                    return hit;
                }
                queue.extend(map.values());
            }
            JsonValue::Array(items) => queue.extend(items),
            _ => {}
        }
    }
    None
}

pub(crate) fn deep_number(value: &JsonValue, aliases: &[&str]) -> Option<f64> {
    deep_find(value, aliases).and_then(as_number)
}

pub(crate) fn deep_int(value: &JsonValue, aliases: &[&str]) -> Option<i64> {
    deep_number(value, aliases).map(|v| v.round() as i64)
}

/// RFC 3339 text, epoch seconds or epoch milliseconds, aligned to `tz`.
pub(crate) fn timestamp(value: &JsonValue, tz: &ReportingTz) -> Option<DateTime<FixedOffset>> {
    match value {
        JsonValue::String(s) => tz.parse_rfc3339(s).or_else(|| {
            s.trim()
                .parse::<i64>()
                .ok()
                .and_then(|n| epoch(n, tz))
        }),
        JsonValue::Number(n) => n.as_i64().and_then(|n| epoch(n, tz)),
        _ => None,
    }
}

fn epoch(n: i64, tz: &ReportingTz) -> Option<DateTime<FixedOffset>> {
    // anything past year 2286 in seconds is really milliseconds
    if n.abs() >= 10_000_000_000 {
        tz.from_epoch_millis(n)
    } else {
        tz.from_epoch_seconds(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PayloadKind;
    use serde_json::json;

    #[test]
    fn deep_find_prefers_shallow_matches_and_ignores_case() {
        let doc = json!({
            "data": {"metrics": [{"type": "hr", "RHR": 51}]},
            "summary": {"steps": "8,412"},
            "rhr": null
        });
        assert_eq!(deep_int(&doc, &["rhr_bpm", "rhr"]), Some(51));
        assert_eq!(deep_int(&doc, &["steps"]), Some(8412));
        assert_eq!(deep_find(&doc, &["missing"]), None);
    }

    #[test]
    fn number_helpers_treat_null_and_text_sensibly() {
        let doc = json!({"a": null, "b": "12.5", "c": "n/a", "d": 3});
        assert_eq!(first_number(&doc, &["a", "c", "b"]), Some(12.5));
        assert_eq!(first_int(&doc, &["a", "d"]), Some(3));
        assert_eq!(str_at(&doc, &["b"]), Some("12.5"));
        assert_eq!(at(&doc, &["a"]), None);
    }

    #[test]
    fn timestamps_accept_text_seconds_and_millis() {
        let tz = ReportingTz::parse("Europe/Berlin").unwrap();
        let expected = "2025-01-02T07:00:00+01:00";
        for value in [json!("2025-01-02T06:00:00Z"), json!(1_735_797_600), json!(1_735_797_600_000_i64)] {
            assert_eq!(timestamp(&value, &tz).unwrap().to_rfc3339(), expected, "{value}");
        }
        assert_eq!(timestamp(&json!(true), &tz), None);
    }

    struct Rejecting;

    impl Normalizer for Rejecting {
        fn source(&self) -> Source {
            Source::Oura
        }

        fn normalize(&self, payload: &RawPayload, _ctx: &NormalizeContext) -> Result<Vec<UnifiedRecord>, NormalizationError> {
            match payload.body.get("ok") {
                Some(_) => Ok(vec![UnifiedRecord::new(payload.day, Source::Oura, "x")]),
                None => Err(NormalizationError::new(payload, "no ok field")),
            }
        }
    }

    #[test]
    fn batch_keeps_going_past_bad_payloads() {
        let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let payload = |body: JsonValue, source| RawPayload {
            source,
            kind: PayloadKind::Daily,
            day,
            native_id: Some("n1".into()),
            body,
        };
        let payloads = vec![
            payload(json!({"ok": 1}), Source::Oura),
            payload(json!({}), Source::Oura),
            payload(json!({"ok": 1}), Source::Garmin),
        ];
        let (records, errors) = normalize_payloads(&Rejecting, &payloads, &NormalizeContext::default());
        assert_eq!(records.len(), 1);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].to_string(), "oura 2025-01-01 (n1): no ok field");
        assert_eq!(serde_json::to_value(&errors[0]).unwrap()["source"], "oura");
    }
}
