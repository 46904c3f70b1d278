use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use hsync_core::{SessionState, Source};
use hsync_storage::{FetchError, HttpFetcher, HttpRequest};
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

use crate::{AdapterError, DateWindow, FetchFailure, FetchOutput, RawPayload};

/// One dashboard view. Alternates are tried in order when a view answers
/// with "not found" or an empty document.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub label: String,
    pub url: String,
    pub alternates: Vec<String>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl PageRequest {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            alternates: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn alternate(mut self, url: impl Into<String>) -> Self {
        self.alternates.push(url.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn candidates(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.url).chain(self.alternates.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
    pub set_cookies: Vec<String>,
}

impl PageResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Blank bodies and bare `{}` / `[]` carry no data.
    pub fn is_empty_document(&self) -> bool {
        matches!(self.body.trim(), "" | "{}" | "[]" | "null")
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
}

/// Renders views inside an isolated browser context seeded with a session.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self, session: &SessionState, view: &PageRequest, url: &str) -> Result<PageResponse, DriverError>;
}

/// Replays a captured browser session over plain HTTP: cookies scoped to
/// the target host plus whatever headers the view asks for.
pub struct HttpSessionDriver {
    http: Arc<HttpFetcher>,
    source: Source,
}

impl HttpSessionDriver {
    pub fn new(http: Arc<HttpFetcher>, source: Source) -> Self {
        Self { http, source }
    }
}

#[async_trait]
impl BrowserDriver for HttpSessionDriver {
    async fn open(&self, session: &SessionState, view: &PageRequest, url: &str) -> Result<PageResponse, DriverError> {
        let host = host_of(url).ok_or_else(|| DriverError::InvalidUrl(url.to_string()))?;

        let mut request = HttpRequest::get(url);
        request.query = view.query.clone();
        for (name, value) in &view.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(cookies) = session.cookie_header_for(&host, Utc::now()) {
            request = request.header("Cookie", cookies);
        }

        match self.http.send(self.source.as_str(), &request).await {
            Ok(resp) => Ok(PageResponse {
                status: resp.status.as_u16(),
                final_url: resp.final_url.clone(),
                content_type: resp.content_type.clone(),
                body: resp.text(),
                set_cookies: resp.set_cookies,
            }),
            Err(FetchError::HttpStatus { status, url, body }) => Ok(PageResponse {
                status,
                final_url: url,
                content_type: None,
                body,
                set_cookies: Vec::new(),
            }),
            Err(err) => Err(DriverError::Transport(err.to_string())),
        }
    }
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// What a browser-only vendor looks like: which views make up a day, how
/// its sign-in wall is recognized, and how pages become raw payloads.
pub trait BrowserSource: Send + Sync {
    fn source(&self) -> Source;

    /// Cookies that must be present and unexpired for the session to be usable.
    fn required_cookies(&self) -> &'static [&'static str];

    /// Extra session checks beyond cookie liveness.
    fn check_session(&self, _session: &SessionState) -> Result<(), String> {
        Ok(())
    }

    fn views(&self, day: NaiveDate, session: &SessionState) -> Vec<PageRequest>;

    fn is_login_page(&self, page: &PageResponse) -> bool {
        let url = page.final_url.to_ascii_lowercase();
        matches!(page.status, 401 | 403)
            || url.contains("/signin")
            || url.contains("/login")
            || url.contains("/sso/")
    }

    /// Turns the pages captured for `day` into payloads. Views that had no
    /// data are absent from `pages`.
    fn extract(&self, day: NaiveDate, pages: &[(PageRequest, PageResponse)]) -> Result<Vec<RawPayload>, String>;

    fn probe_view(&self, today: NaiveDate, session: &SessionState) -> PageRequest;
}

pub struct BrowserAdapter {
    plan: Arc<dyn BrowserSource>,
    driver: Arc<dyn BrowserDriver>,
    session: Option<SessionState>,
}

impl BrowserAdapter {
    pub fn new(plan: Arc<dyn BrowserSource>, driver: Arc<dyn BrowserDriver>, session: Option<SessionState>) -> Self {
        Self { plan, driver, session }
    }

    pub fn source(&self) -> Source {
        self.plan.source()
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn replace_session(&mut self, session: SessionState) {
        self.session = Some(session);
    }

    /// The stored session, if it can still be used without an interactive login.
    fn usable_session(&self) -> Result<&SessionState, AdapterError> {
        let source = self.source();
        let session = self
            .session
            .as_ref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdapterError::LoginRequired(source, "no stored browser session".into()))?;

        let now = Utc::now();
        if let Some(name) = self
            .plan
            .required_cookies()
            .iter()
            .find(|name| !session.is_cookie_live(name, now))
        {
            return Err(AdapterError::LoginRequired(
                source,
                format!("session cookie `{name}` is missing or expired"),
            ));
        }
        self.plan
            .check_session(session)
            .map_err(|reason| AdapterError::LoginRequired(source, reason))?;
        Ok(session)
    }

    pub async fn fetch(&self, window: &DateWindow) -> Result<FetchOutput, FetchFailure> {
        let source = self.source();
        let span = info_span!("browser_fetch", %source, start = %window.start, end = %window.end);
        let mut session = LiveSession::new(self.usable_session()?.clone());
        let result = self.fetch_days(&mut session, window).instrument(span).await;
        session.finish(result, |payloads| FetchOutput {
            payloads,
            ..FetchOutput::default()
        })
    }

    async fn fetch_days(&self, session: &mut LiveSession, window: &DateWindow) -> Result<Vec<RawPayload>, AdapterError> {
        let mut payloads = Vec::new();
        for day in window.days() {
            let mut pages = Vec::new();
            for view in self.plan.views(day, &session.state) {
                if let Some(page) = self.open_view(&session.state, &view).await? {
                    session.merge(&page);
                    pages.push((view, page));
                }
            }
            let extracted = self
                .plan
                .extract(day, &pages)
                .map_err(|reason| AdapterError::InvalidResponse(self.source(), reason))?;
            debug!(%day, views = pages.len(), payloads = extracted.len(), "day scraped");
            payloads.extend(extracted);
        }

        info!(payloads = payloads.len(), session_changed = session.changed, "browser fetch complete");
        Ok(payloads)
    }

    pub async fn probe(&self, today: NaiveDate) -> Result<FetchOutput, FetchFailure> {
        let mut session = LiveSession::new(self.usable_session()?.clone());
        let view = self.plan.probe_view(today, &session.state);
        let result = match self.open_view(&session.state, &view).await {
            Ok(Some(page)) => {
                session.merge(&page);
                Ok(())
            }
            Ok(None) => Err(AdapterError::SourceUnavailable(
                self.source(),
                format!("probe view `{}` returned nothing", view.label),
            )),
            Err(err) => Err(err),
        };
        session.finish(result, |()| FetchOutput::default())
    }

    /// Opens the first candidate URL of `view` that yields content. `None`
    /// when every candidate reports no data.
    async fn open_view(&self, session: &SessionState, view: &PageRequest) -> Result<Option<PageResponse>, AdapterError> {
        let source = self.source();
        for url in view.candidates() {
            let page = self
                .driver
                .open(session, view, url)
                .await
                .map_err(|err| AdapterError::SourceUnavailable(source, format!("`{}`: {err}", view.label)))?;

            if self.plan.is_login_page(&page) {
                return Err(AdapterError::LoginRequired(
                    source,
                    format!("`{}` redirected to sign-in (status {})", view.label, page.status),
                ));
            }
            if page.status >= 500 || page.status == 429 {
                return Err(AdapterError::SourceUnavailable(
                    source,
                    format!("`{}` answered status {}", view.label, page.status),
                ));
            }
            if page.is_success() && !page.is_empty_document() {
                return Ok(Some(page));
            }
            debug!(label = %view.label, url = %url, status = page.status, "view had no data");
        }
        Ok(None)
    }
}

/// The session as it evolves over one fetch. Cookies the vendor rotated are
/// handed back whether or not the fetch finished.
struct LiveSession {
    state: SessionState,
    changed: bool,
}

impl LiveSession {
    fn new(state: SessionState) -> Self {
        Self { state, changed: false }
    }

    fn merge(&mut self, page: &PageResponse) {
        self.changed |= merge_cookies(&mut self.state, page);
    }

    fn finish<T>(self, result: Result<T, AdapterError>, output: impl FnOnce(T) -> FetchOutput) -> Result<FetchOutput, FetchFailure> {
        let refreshed_session = self.changed.then_some(self.state);
        match result {
            Ok(value) => Ok(FetchOutput {
                refreshed_session,
                ..output(value)
            }),
            Err(error) => Err(FetchFailure {
                error,
                refreshed_tokens: None,
                refreshed_session,
            }),
        }
    }
}

fn merge_cookies(session: &mut SessionState, page: &PageResponse) -> bool {
    let Some(host) = host_of(&page.final_url) else {
        return false;
    };
    let now = Utc::now();
    page.set_cookies
        .iter()
        .fold(false, |changed, header| session.merge_set_cookie(header, &host, now) || changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PayloadKind;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned pages keyed by URL and records what was opened.
    #[derive(Default)]
    struct ScriptedDriver {
        pages: HashMap<String, PageResponse>,
        opened: Mutex<Vec<String>>,
    }

    impl ScriptedDriver {
        fn page(mut self, url: &str, status: u16, body: &str) -> Self {
            self.pages.insert(
                url.to_string(),
                PageResponse {
                    status,
                    final_url: url.to_string(),
                    content_type: Some("application/json".into()),
                    body: body.to_string(),
                    set_cookies: Vec::new(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl BrowserDriver for ScriptedDriver {
        async fn open(&self, _session: &SessionState, _view: &PageRequest, url: &str) -> Result<PageResponse, DriverError> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(self.pages.get(url).cloned().unwrap_or(PageResponse {
                status: 404,
                final_url: url.to_string(),
                content_type: None,
                body: String::new(),
                set_cookies: Vec::new(),
            }))
        }
    }

    struct DashboardPlan;

    impl BrowserSource for DashboardPlan {
        fn source(&self) -> Source {
            Source::Garmin
        }

        fn required_cookies(&self) -> &'static [&'static str] {
            &["SESSION"]
        }

        fn views(&self, day: NaiveDate, _session: &SessionState) -> Vec<PageRequest> {
            vec![PageRequest::new("summary", format!("https://dash.example.com/summary/{day}"))
                .alternate(format!("https://api.example.com/summary/{day}"))]
        }

        fn extract(&self, day: NaiveDate, pages: &[(PageRequest, PageResponse)]) -> Result<Vec<RawPayload>, String> {
            Ok(pages
                .iter()
                .filter_map(|(_, page)| page.json())
                .map(|body| RawPayload {
                    source: Source::Garmin,
                    kind: PayloadKind::Daily,
                    day,
                    native_id: None,
                    body,
                })
                .collect())
        }

        fn probe_view(&self, today: NaiveDate, session: &SessionState) -> PageRequest {
            self.views(today, session).remove(0)
        }
    }

    fn session(expires: f64) -> SessionState {
        serde_json::from_value(serde_json::json!({
            "cookies": [{"name": "SESSION", "value": "s1", "domain": "dash.example.com", "expires": expires}],
            "origins": []
        }))
        .unwrap()
    }

    fn two_days() -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
        )
        .unwrap()
    }

    fn adapter(driver: ScriptedDriver, session: Option<SessionState>) -> (BrowserAdapter, Arc<ScriptedDriver>) {
        let driver = Arc::new(driver);
        (
            BrowserAdapter::new(Arc::new(DashboardPlan), driver.clone(), session),
            driver,
        )
    }

    #[tokio::test]
    async fn missing_session_requires_login_before_any_request() {
        let (adapter, driver) = adapter(ScriptedDriver::default(), None);
        let err = adapter.fetch(&two_days()).await.unwrap_err();
        assert_eq!(err.kind(), "login_required");
        assert!(driver.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_cookie_requires_login_before_any_request() {
        let (adapter, driver) = adapter(ScriptedDriver::default(), Some(session(1_000.0)));
        assert_eq!(adapter.fetch(&two_days()).await.unwrap_err().kind(), "login_required");
        assert!(driver.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sign_in_wall_mid_batch_is_login_required() {
        let driver = ScriptedDriver::default()
            .page("https://dash.example.com/summary/2025-01-01", 200, r#"{"steps": 1}"#)
            .page("https://dash.example.com/summary/2025-01-02", 401, "");
        let (adapter, _) = adapter(driver, Some(session(-1.0)));
        assert_eq!(adapter.fetch(&two_days()).await.unwrap_err().kind(), "login_required");
    }

    #[tokio::test]
    async fn empty_views_fall_back_to_alternates() {
        let driver = ScriptedDriver::default()
            .page("https://dash.example.com/summary/2025-01-01", 200, "{}")
            .page("https://api.example.com/summary/2025-01-01", 200, r#"{"steps": 10}"#)
            .page("https://dash.example.com/summary/2025-01-02", 200, r#"{"steps": 20}"#);
        let (adapter, driver) = adapter(driver, Some(session(-1.0)));
        let out = adapter.fetch(&two_days()).await.unwrap();
        let steps: Vec<_> = out.payloads.iter().map(|p| p.body["steps"].as_i64().unwrap()).collect();
        assert_eq!(steps, vec![10, 20]);
        assert_eq!(driver.opened.lock().unwrap().len(), 3);
        assert!(out.refreshed_session.is_none());
    }

    #[tokio::test]
    async fn rotated_cookies_are_returned_for_persistence() {
        let mut driver = ScriptedDriver::default()
            .page("https://dash.example.com/summary/2025-01-01", 200, r#"{"steps": 1}"#)
            .page("https://dash.example.com/summary/2025-01-02", 200, r#"{"steps": 2}"#);
        if let Some(page) = driver.pages.get_mut("https://dash.example.com/summary/2025-01-02") {
            page.set_cookies.push("SESSION=s2; Path=/".into());
        }
        let (adapter, _) = adapter(driver, Some(session(-1.0)));
        let out = adapter.fetch(&two_days()).await.unwrap();
        let refreshed = out.refreshed_session.expect("rotated session");
        assert_eq!(refreshed.cookie("SESSION").unwrap().value, "s2");
        // the adapter's own copy is untouched until the caller absorbs the output
        assert_eq!(adapter.session().unwrap().cookie("SESSION").unwrap().value, "s1");
    }

    #[tokio::test]
    async fn cookies_rotated_before_a_sign_in_wall_are_kept() {
        let mut driver = ScriptedDriver::default()
            .page("https://dash.example.com/summary/2025-01-01", 200, r#"{"steps": 1}"#)
            .page("https://dash.example.com/summary/2025-01-02", 401, "");
        if let Some(page) = driver.pages.get_mut("https://dash.example.com/summary/2025-01-01") {
            page.set_cookies.push("SESSION=s2; Path=/".into());
        }
        let (adapter, _) = adapter(driver, Some(session(-1.0)));
        let failure = adapter.fetch(&two_days()).await.unwrap_err();
        assert_eq!(failure.kind(), "login_required");
        let kept = failure.refreshed_session.expect("rotated session survives the failure");
        assert_eq!(kept.cookie("SESSION").unwrap().value, "s2");
    }

    #[tokio::test]
    async fn server_errors_are_source_unavailable() {
        let driver = ScriptedDriver::default().page("https://dash.example.com/summary/2025-01-01", 503, "");
        let (adapter, _) = adapter(driver, Some(session(-1.0)));
        assert_eq!(adapter.fetch(&two_days()).await.unwrap_err().kind(), "source_unavailable");
    }
}
