//! Operator-driven credential bootstrap.
//!
//! Syncs never prompt for credentials. When a browser source reports
//! `LoginRequired`, the operator signs in with a real browser, exports its
//! storage state, and hands the file to [`import_session`], which checks it
//! against the source before storing it for later runs.
//!
//! API sources get their first token pair through the OAuth2
//! authorization-code grant: [`authorization_link`] builds the consent URL
//! and [`complete_authorization`] trades the returned code for tokens.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use hsync_core::{OAuthClient, OAuthTokens, SessionState, Source, SourceSecret};
use hsync_storage::{CredentialStore, HttpFetcher};
use thiserror::Error;
use tracing::info;

use crate::api::{authorize_url, exchange_code};
use crate::registry::{build_adapter, SourceSettings};
use crate::AdapterError;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("{0} is an API source; configure its token instead of a browser session")]
    NotBrowserSource(Source),
    #[error("{0} signs in through a browser session; use `hsync login {0}`")]
    NotApiSource(Source),
    #[error("{0} has no authorization endpoint; set {1}")]
    NoAuthorizeEndpoint(Source, String),
    #[error("exported session state is unusable: {0}")]
    InvalidState(String),
    #[error("session was rejected by {vendor}: {0}", vendor = .0.vendor())]
    Rejected(AdapterError),
    #[error("authorization failed: {0}")]
    Authorization(AdapterError),
    #[error("storing the session failed: {0}")]
    Persist(String),
}

/// Steps shown to the operator before an import.
pub fn login_instructions(source: Source) -> String {
    let (url, cookie) = match source {
        Source::Garmin => ("https://connect.garmin.com/modern/", "JWT_FGP"),
        Source::RollaOne => ("https://app.rolla.app/", "rolla_session"),
        Source::Oura | Source::Ultrahuman | Source::Polar | Source::Withings => {
            return format!(
                "{source} is read through its API. Set {0}_ACCESS_TOKEN, or set {0}_CLIENT_ID and {0}_CLIENT_SECRET and run `hsync authorize {source}`.",
                source.env_prefix()
            )
        }
    };
    format!(
        "1. Open {url} in a browser and sign in to {source}.\n\
         2. Export the browser storage state as JSON (for example `playwright open --save-storage=state.json {url}`).\n\
         3. Check the export holds the `{cookie}` cookie.\n\
         4. Run `hsync login {source} --state-file state.json`."
    )
}

/// Validates an exported storage state, proves it works with one probe
/// request, stamps the capture time and persists it.
pub async fn import_session(
    source: Source,
    exported: &str,
    settings: &SourceSettings,
    http: Arc<HttpFetcher>,
    store: &dyn CredentialStore,
    today: NaiveDate,
) -> Result<SessionState, LoginError> {
    if !source.is_browser() {
        return Err(LoginError::NotBrowserSource(source));
    }
    let state: SessionState = serde_json::from_str(exported).map_err(|err| LoginError::InvalidState(err.to_string()))?;
    if state.is_empty() {
        return Err(LoginError::InvalidState("no cookies or local storage entries".into()));
    }

    let adapter = build_adapter(source, Some(SourceSecret::Session(state.clone())), settings, http)
        .map_err(LoginError::Rejected)?;
    let probed = adapter
        .probe(today)
        .await
        .map_err(|failure| LoginError::Rejected(failure.error))?;

    let mut state = probed.refreshed_session.unwrap_or(state);
    state.captured_at = Some(Utc::now());
    store
        .put_session_state(source, &state)
        .await
        .map_err(|err| LoginError::Persist(err.to_string()))?;
    info!(%source, cookies = state.cookies.len(), "browser session stored");
    Ok(state)
}

/// Consent URL for an API source. `endpoint` overrides the vendor default.
pub fn authorization_link(
    source: Source,
    client_id: &str,
    redirect_uri: &str,
    endpoint: Option<&str>,
    state: &str,
) -> Result<String, LoginError> {
    if source.is_browser() {
        return Err(LoginError::NotApiSource(source));
    }
    let endpoint = endpoint
        .or_else(|| source.default_authorize_url())
        .ok_or_else(|| LoginError::NoAuthorizeEndpoint(source, format!("{}_AUTHORIZE_URL", source.env_prefix())))?;
    authorize_url(source, endpoint, client_id, redirect_uri, state).map_err(LoginError::Authorization)
}

/// Exchanges the code the vendor redirected back with and stores the tokens
/// where later syncs read them.
pub async fn complete_authorization(
    source: Source,
    client: &OAuthClient,
    code: &str,
    redirect_uri: &str,
    http: &HttpFetcher,
    store: &dyn CredentialStore,
) -> Result<OAuthTokens, LoginError> {
    if source.is_browser() {
        return Err(LoginError::NotApiSource(source));
    }
    let tokens = exchange_code(http, source, client, code, redirect_uri)
        .await
        .map_err(LoginError::Authorization)?;
    store
        .put_tokens(source, &tokens)
        .await
        .map_err(|err| LoginError::Persist(err.to_string()))?;
    info!(%source, refreshable = tokens.refresh_token.is_some(), "oauth tokens stored");
    Ok(tokens)
}
