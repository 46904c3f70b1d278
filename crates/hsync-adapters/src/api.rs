use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use hsync_core::{OAuthClient, OAuthTokens, Source, SourceSecret};
use base64::{engine::general_purpose, Engine as _};
use hsync_storage::{FetchError, HttpFetcher, HttpRequest};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{AdapterError, DateWindow, FetchFailure, FetchOutput, RawPayload};

/// Upper bound on pages followed for one request chain.
pub const MAX_PAGES: usize = 100;

const EXPIRY_SKEW_SECS: i64 = 60;

/// One request in a source's plan. `label` names the collection it reads so
/// the plan can assemble pages later.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRequest {
    pub label: String,
    pub request: HttpRequest,
    /// A 404 means "nothing recorded" and yields a `null` page.
    pub missing_is_empty: bool,
}

impl PlannedRequest {
    pub fn new(label: impl Into<String>, request: HttpRequest) -> Self {
        Self {
            label: label.into(),
            request,
            missing_is_empty: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.missing_is_empty = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageBody {
    pub label: String,
    pub body: JsonValue,
}

/// What an API vendor looks like: which requests cover a window, how its
/// cursor works, and how responses become raw payloads. No I/O.
pub trait ApiSource: Send + Sync {
    fn source(&self) -> Source;

    fn requests(&self, window: &DateWindow) -> Vec<PlannedRequest>;

    /// Request for the page after `body`, or `None` on the last page.
    fn next_page(&self, previous: &PlannedRequest, body: &JsonValue) -> Option<PlannedRequest>;

    fn assemble(&self, window: &DateWindow, pages: Vec<PageBody>) -> Result<Vec<RawPayload>, String>;

    fn probe_request(&self, today: NaiveDate) -> PlannedRequest;

    /// For vendors that answer an expired token with HTTP 200 and an error body.
    fn rejects_token(&self, _body: &JsonValue) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiAuth {
    Bearer(String),
    OAuth { client: OAuthClient, tokens: OAuthTokens },
}

impl ApiAuth {
    pub fn from_secret(source: Source, secret: SourceSecret) -> Result<Self, AdapterError> {
        match secret {
            SourceSecret::Bearer(token) => Ok(ApiAuth::Bearer(token)),
            SourceSecret::OAuth { client, tokens } => Ok(ApiAuth::OAuth { client, tokens }),
            SourceSecret::Session(_) => Err(AdapterError::MissingCredential(
                source,
                "a browser session cannot authenticate an API source".to_string(),
            )),
        }
    }

    fn access_token(&self) -> &str {
        match self {
            ApiAuth::Bearer(token) => token,
            ApiAuth::OAuth { tokens, .. } => &tokens.access_token,
        }
    }

    fn can_refresh(&self) -> bool {
        matches!(self, ApiAuth::OAuth { tokens, .. } if tokens.refresh_token.is_some())
    }

    fn needs_refresh(&self) -> bool {
        match self {
            ApiAuth::Bearer(_) => false,
            ApiAuth::OAuth { tokens, .. } => {
                self.can_refresh()
                    && (tokens.access_token.is_empty()
                        || tokens.is_expired(Utc::now(), Duration::seconds(EXPIRY_SKEW_SECS)))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Per-fetch credential state. Lives on the stack of one `fetch` call and
/// hands renewed tokens back on success and failure alike.
struct AuthSession {
    auth: ApiAuth,
    refreshed: bool,
}

impl AuthSession {
    fn new(auth: ApiAuth) -> Self {
        Self { auth, refreshed: false }
    }

    fn refreshed_tokens(&self) -> Option<OAuthTokens> {
        match (&self.auth, self.refreshed) {
            (ApiAuth::OAuth { tokens, .. }, true) => Some(tokens.clone()),
            _ => None,
        }
    }

    fn finish<T>(self, result: Result<T, AdapterError>, output: impl FnOnce(T) -> FetchOutput) -> Result<FetchOutput, FetchFailure> {
        let refreshed_tokens = self.refreshed_tokens();
        match result {
            Ok(value) => Ok(FetchOutput {
                refreshed_tokens,
                ..output(value)
            }),
            Err(error) => {
                if refreshed_tokens.is_some() {
                    warn!(source = %error.vendor(), "fetch failed after a token refresh; renewed tokens are kept");
                }
                Err(FetchFailure {
                    error,
                    refreshed_tokens,
                    refreshed_session: None,
                })
            }
        }
    }
}

pub struct ApiAdapter {
    plan: Arc<dyn ApiSource>,
    auth: ApiAuth,
    http: Arc<HttpFetcher>,
}

impl ApiAdapter {
    pub fn new(plan: Arc<dyn ApiSource>, auth: ApiAuth, http: Arc<HttpFetcher>) -> Self {
        Self { plan, auth, http }
    }

    pub fn source(&self) -> Source {
        self.plan.source()
    }

    pub fn replace_tokens(&mut self, tokens: OAuthTokens) {
        if let ApiAuth::OAuth { tokens: current, .. } = &mut self.auth {
            *current = tokens;
        }
    }

    pub async fn fetch(&self, window: &DateWindow) -> Result<FetchOutput, FetchFailure> {
        let source = self.source();
        let span = info_span!("api_fetch", %source, start = %window.start, end = %window.end);
        let mut session = AuthSession::new(self.auth.clone());
        let result = self.fetch_pages(&mut session, window).instrument(span).await;
        session.finish(result, |payloads| FetchOutput {
            payloads,
            ..FetchOutput::default()
        })
    }

    async fn fetch_pages(&self, session: &mut AuthSession, window: &DateWindow) -> Result<Vec<RawPayload>, AdapterError> {
        let source = self.source();
        let mut pages = Vec::new();

        for first in self.plan.requests(window) {
            let mut next = Some(first);
            let mut followed = 0usize;
            while let Some(planned) = next.take() {
                if followed == MAX_PAGES {
                    return Err(AdapterError::InvalidResponse(
                        source,
                        format!("`{}` did not stop paginating after {MAX_PAGES} pages", planned.label),
                    ));
                }
                let body = self.send_authorized(session, &planned).await?;
                next = self.plan.next_page(&planned, &body);
                pages.push(PageBody {
                    label: planned.label,
                    body,
                });
                followed += 1;
            }
        }

        let page_count = pages.len();
        let payloads = self
            .plan
            .assemble(window, pages)
            .map_err(|reason| AdapterError::InvalidResponse(source, reason))?;
        info!(pages = page_count, payloads = payloads.len(), "api fetch complete");
        Ok(payloads)
    }

    pub async fn probe(&self, today: NaiveDate) -> Result<FetchOutput, FetchFailure> {
        let mut session = AuthSession::new(self.auth.clone());
        let result = self.send_authorized(&mut session, &self.plan.probe_request(today)).await;
        session.finish(result, |_| FetchOutput::default())
    }

    async fn send_authorized(
        &self,
        session: &mut AuthSession,
        planned: &PlannedRequest,
    ) -> Result<JsonValue, AdapterError> {
        let source = self.source();
        let mut refreshed_here = false;
        if session.auth.needs_refresh() {
            self.refresh(session).await?;
            refreshed_here = true;
        }

        loop {
            let request = planned.request.clone().bearer(session.auth.access_token());
            match self.http.send(source.as_str(), &request).await {
                Ok(resp) => {
                    let body: JsonValue = resp.json().map_err(|err| {
                        AdapterError::InvalidResponse(source, format!("`{}` is not JSON: {err}", planned.label))
                    })?;
                    if !self.plan.rejects_token(&body) {
                        return Ok(body);
                    }
                }
                Err(err) if err.is_unauthorized() => {}
                Err(FetchError::HttpStatus { status: 404, .. }) if planned.missing_is_empty => {
                    debug!(label = %planned.label, "nothing recorded");
                    return Ok(JsonValue::Null);
                }
                Err(err) => return Err(unavailable(source, &planned.label, err)),
            }

            if refreshed_here || !session.auth.can_refresh() {
                return Err(AdapterError::AuthExpired(
                    source,
                    format!("`{}` rejected the access token", planned.label),
                ));
            }
            debug!(label = %planned.label, "access token rejected, refreshing");
            self.refresh(session).await?;
            refreshed_here = true;
        }
    }

    async fn refresh(&self, session: &mut AuthSession) -> Result<(), AdapterError> {
        let source = self.source();
        let ApiAuth::OAuth { client, tokens } = &mut session.auth else {
            return Err(AdapterError::AuthExpired(source, "bearer tokens cannot be refreshed".into()));
        };
        let Some(refresh_token) = tokens.refresh_token.clone() else {
            return Err(AdapterError::AuthExpired(source, "no refresh token stored".into()));
        };

        let grant = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.clone()),
        ];
        let mut renewed = request_tokens(&self.http, source, client, grant)
            .await
            .map_err(|reason| {
                warn!(%source, %reason, "token refresh failed");
                AdapterError::AuthExpired(source, format!("token refresh failed: {reason}"))
            })?;
        renewed.refresh_token = renewed.refresh_token.or(Some(refresh_token));
        *tokens = renewed;
        session.refreshed = true;
        info!(%source, "access token refreshed");
        Ok(())
    }
}

/// Posts one grant to the token endpoint. Client credentials travel in the
/// form body, and also as HTTP Basic auth for vendors that require it.
async fn request_tokens(
    http: &HttpFetcher,
    source: Source,
    client: &OAuthClient,
    mut grant: Vec<(String, String)>,
) -> Result<OAuthTokens, String> {
    if let Some(action) = source.token_request_action() {
        grant.push(("action".to_string(), action.to_string()));
    }
    grant.push(("client_id".to_string(), client.client_id.clone()));
    grant.push(("client_secret".to_string(), client.client_secret.clone()));
    let mut request = HttpRequest::post_form(client.token_url.clone(), grant).header("Accept", "application/json");
    if source.token_endpoint_wants_basic_auth() {
        let basic = general_purpose::STANDARD.encode(format!("{}:{}", client.client_id, client.client_secret));
        request = request.header("Authorization", format!("Basic {basic}"));
    }

    let resp = http.send(source.as_str(), &request).await.map_err(|err| err.to_string())?;
    let mut body: JsonValue = resp.json().map_err(|err| format!("token response is not JSON: {err}"))?;
    // {"status": 0, "body": {...}} envelopes carry the tokens inside `body`
    if let Some(status) = body.get("status").and_then(JsonValue::as_i64) {
        if status != 0 {
            return Err(format!("token endpoint answered status {status}"));
        }
        body = body.get("body").cloned().unwrap_or(JsonValue::Null);
    }
    let parsed: TokenResponse =
        serde_json::from_value(body).map_err(|err| format!("token response has an unexpected shape: {err}"))?;
    let access_token = parsed
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| "token response lacks access_token".to_string())?;
    Ok(OAuthTokens {
        access_token,
        refresh_token: parsed.refresh_token.filter(|token| !token.is_empty()),
        expires_at: parsed.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
    })
}

/// Browser URL where the account owner grants access. The vendor redirects
/// to `redirect_uri` with a `code` for [`exchange_code`].
pub fn authorize_url(
    source: Source,
    authorize_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> Result<String, AdapterError> {
    let mut params = vec![
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("state", state),
    ];
    if let Some(scopes) = source.oauth_scopes() {
        params.push(("scope", scopes));
    }
    Url::parse_with_params(authorize_endpoint, &params)
        .map(String::from)
        .map_err(|err| AdapterError::MissingCredential(source, format!("authorize endpoint `{authorize_endpoint}`: {err}")))
}

/// Trades an authorization code for the first token pair.
pub async fn exchange_code(
    http: &HttpFetcher,
    source: Source,
    client: &OAuthClient,
    code: &str,
    redirect_uri: &str,
) -> Result<OAuthTokens, AdapterError> {
    let grant = vec![
        ("grant_type".to_string(), "authorization_code".to_string()),
        ("code".to_string(), code.trim().to_string()),
        ("redirect_uri".to_string(), redirect_uri.to_string()),
    ];
    let tokens = request_tokens(http, source, client, grant)
        .await
        .map_err(|reason| AdapterError::AuthExpired(source, format!("authorization code rejected: {reason}")))?;
    info!(%source, refreshable = tokens.refresh_token.is_some(), "authorization code exchanged");
    Ok(tokens)
}

fn unavailable(source: Source, label: &str, err: FetchError) -> AdapterError {
    AdapterError::SourceUnavailable(source, format!("`{label}`: {err}"))
}
