//! Source adapter contracts (API and browser families), per-vendor plans and
//! the normalization layer that turns raw payloads into unified records.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use hsync_core::{OAuthTokens, SessionState, Source};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod api;
pub mod browser;
pub mod login;
pub mod normalize;
pub mod registry;
pub mod sources;

pub use api::{authorize_url, exchange_code, ApiAdapter, ApiAuth, ApiSource, PageBody, PlannedRequest};
pub use browser::{BrowserAdapter, BrowserDriver, BrowserSource, DriverError, HttpSessionDriver, PageRequest, PageResponse};
pub use login::{authorization_link, complete_authorization, import_session, login_instructions, LoginError};
pub use normalize::{normalize_payloads, NormalizationError, NormalizeContext, Normalizer};
pub use registry::{build_adapter, normalizer_for, SourceSettings};

pub const CRATE_NAME: &str = "hsync-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("window start {start} is after end {end}")]
pub struct InvertedWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Inclusive range of calendar days requested from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InvertedWindow> {
        if start > end {
            return Err(InvertedWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// The last `days` days plus today.
    pub fn since(days: u32, today: NaiveDate) -> Self {
        Self {
            start: today - Duration::days(i64::from(days)),
            end: today,
        }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let start = self.start;
        (0..self.len_days()).map(move |offset| start + Duration::days(offset))
    }

    /// Consecutive sub-windows of at most `max_days` days covering `self`.
    pub fn split(&self, max_days: u32) -> Vec<DateWindow> {
        let step = i64::from(max_days.max(1));
        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let end = (cursor + Duration::days(step - 1)).min(self.end);
            out.push(DateWindow { start: cursor, end });
            cursor = end + Duration::days(1);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Daily,
    Workout,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Daily => "daily",
            PayloadKind::Workout => "workout",
        }
    }
}

/// Source-native data for one day summary or one workout, identical in shape
/// for both adapter families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub source: Source,
    pub kind: PayloadKind,
    pub day: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_id: Option<String>,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}: credentials expired and could not be refreshed: {1}")]
    AuthExpired(Source, String),
    #[error("{0}: source unavailable: {1}")]
    SourceUnavailable(Source, String),
    #[error("{0}: interactive login required: {1}")]
    LoginRequired(Source, String),
    #[error("{0}: no usable credential configured: {1}")]
    MissingCredential(Source, String),
    #[error("{0}: response has an unexpected shape: {1}")]
    InvalidResponse(Source, String),
}

impl AdapterError {
    pub fn vendor(&self) -> Source {
        match self {
            AdapterError::AuthExpired(s, _)
            | AdapterError::SourceUnavailable(s, _)
            | AdapterError::LoginRequired(s, _)
            | AdapterError::MissingCredential(s, _)
            | AdapterError::InvalidResponse(s, _) => *s,
        }
    }

    /// Stable machine-readable kind, used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::AuthExpired(..) => "auth_expired",
            AdapterError::SourceUnavailable(..) => "source_unavailable",
            AdapterError::LoginRequired(..) => "login_required",
            AdapterError::MissingCredential(..) => "missing_credential",
            AdapterError::InvalidResponse(..) => "invalid_response",
        }
    }
}

/// A fetch that stopped early. Credentials renewed before the failure ride
/// along so the caller can still persist them.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FetchFailure {
    #[source]
    pub error: AdapterError,
    pub refreshed_tokens: Option<OAuthTokens>,
    pub refreshed_session: Option<SessionState>,
}

impl FetchFailure {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    pub fn vendor(&self) -> Source {
        self.error.vendor()
    }

    pub fn has_renewed_credentials(&self) -> bool {
        self.refreshed_tokens.is_some() || self.refreshed_session.is_some()
    }
}

impl From<AdapterError> for FetchFailure {
    fn from(error: AdapterError) -> Self {
        Self {
            error,
            refreshed_tokens: None,
            refreshed_session: None,
        }
    }
}

/// Everything one fetch produced. Credentials renewed during the fetch are
/// handed back so the caller can persist them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutput {
    pub payloads: Vec<RawPayload>,
    pub refreshed_tokens: Option<OAuthTokens>,
    pub refreshed_session: Option<SessionState>,
}

/// A configured connection to one source: exactly one of the two families.
pub enum SourceAdapter {
    Api(ApiAdapter),
    Browser(BrowserAdapter),
}

impl SourceAdapter {
    pub fn source(&self) -> Source {
        match self {
            SourceAdapter::Api(adapter) => adapter.source(),
            SourceAdapter::Browser(adapter) => adapter.source(),
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            SourceAdapter::Api(_) => "api",
            SourceAdapter::Browser(_) => "browser",
        }
    }

    pub async fn fetch(&self, window: &DateWindow) -> Result<FetchOutput, FetchFailure> {
        match self {
            SourceAdapter::Api(adapter) => adapter.fetch(window).await,
            SourceAdapter::Browser(adapter) => adapter.fetch(window).await,
        }
    }

    /// One cheap authenticated request proving the credentials work.
    pub async fn probe(&self, today: NaiveDate) -> Result<FetchOutput, FetchFailure> {
        match self {
            SourceAdapter::Api(adapter) => adapter.probe(today).await,
            SourceAdapter::Browser(adapter) => adapter.probe(today).await,
        }
    }

    /// Carries renewed credentials from a previous fetch into the next one.
    pub fn absorb(&mut self, output: &FetchOutput) {
        self.absorb_credentials(output.refreshed_tokens.as_ref(), output.refreshed_session.as_ref());
    }

    pub fn absorb_credentials(&mut self, tokens: Option<&OAuthTokens>, session: Option<&SessionState>) {
        match self {
            SourceAdapter::Api(adapter) => {
                if let Some(tokens) = tokens {
                    adapter.replace_tokens(tokens.clone());
                }
            }
            SourceAdapter::Browser(adapter) => {
                if let Some(session) = session {
                    adapter.replace_session(session.clone());
                }
            }
        }
    }
}

/// Reads a JSON array of raw payloads, as captured under `fixtures/<source>/sample/`.
pub fn load_payload_fixture(path: impl AsRef<Path>) -> Result<Vec<RawPayload>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn inverted_window_is_rejected() {
        assert!(DateWindow::new(day(2025, 1, 3), day(2025, 1, 2)).is_err());
        assert_eq!(DateWindow::new(day(2025, 1, 2), day(2025, 1, 2)).unwrap().len_days(), 1);
    }

    #[test]
    fn since_counts_back_from_today() {
        let window = DateWindow::since(2, day(2025, 3, 1));
        assert_eq!(window.start, day(2025, 2, 27));
        assert_eq!(window.days().count(), 3);
    }

    #[test]
    fn split_covers_window_without_overlap() {
        let window = DateWindow::new(day(2025, 1, 1), day(2025, 1, 10)).unwrap();
        let parts = window.split(4);
        assert_eq!(
            parts,
            vec![
                DateWindow { start: day(2025, 1, 1), end: day(2025, 1, 4) },
                DateWindow { start: day(2025, 1, 5), end: day(2025, 1, 8) },
                DateWindow { start: day(2025, 1, 9), end: day(2025, 1, 10) },
            ]
        );
        assert_eq!(window.split(0).len(), 10);
        assert_eq!(window.split(30), vec![window]);
    }

    #[test]
    fn adapter_errors_expose_kind_and_source() {
        let err = AdapterError::LoginRequired(Source::Garmin, "session expired".into());
        assert_eq!(err.kind(), "login_required");
        assert_eq!(err.vendor(), Source::Garmin);
        assert_eq!(err.to_string(), "garmin: interactive login required: session expired");
    }

    #[test]
    fn fetch_failure_displays_the_underlying_error() {
        let failure = FetchFailure {
            refreshed_tokens: Some(OAuthTokens {
                access_token: "fresh".into(),
                refresh_token: Some("r2".into()),
                expires_at: None,
            }),
            ..FetchFailure::from(AdapterError::SourceUnavailable(Source::Oura, "503".into()))
        };
        assert_eq!(failure.kind(), "source_unavailable");
        assert_eq!(failure.to_string(), "oura: source unavailable: 503");
        assert!(failure.has_renewed_credentials());
        assert!(!FetchFailure::from(AdapterError::LoginRequired(Source::Garmin, "x".into())).has_renewed_credentials());
    }

    #[test]
    fn raw_payload_serializes_kind_snake_case() {
        let payload = RawPayload {
            source: Source::Oura,
            kind: PayloadKind::Workout,
            day: day(2025, 1, 2),
            native_id: Some("A-100".into()),
            body: serde_json::json!({}),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "workout");
        assert_eq!(json["source"], "oura");
    }
}
