//! Credential and session values. Loading and persisting them is the storage
//! crate's job; nothing here performs I/O.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthTokens {
    /// Tokens without a known expiry are treated as live until a 401 says otherwise.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at.is_some_and(|at| at - skew <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    /// Unix seconds; `-1` marks a session cookie.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn root_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

impl Cookie {
    pub fn is_session(&self) -> bool {
        self.expires < 0.0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_session() && self.expires <= now.timestamp() as f64
    }

    /// Domain match as browsers do it: exact host, or a subdomain of a
    /// dot-prefixed cookie domain.
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        if domain.is_empty() {
            return false;
        }
        host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageItem {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<StorageItem>,
}

/// Browser session in the storage-state layout exported by Playwright and
/// Chromium tooling, plus the time it was captured.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.iter().all(|o| o.local_storage.is_empty())
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// True when the named cookie exists and has not expired.
    pub fn is_cookie_live(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.cookie(name).is_some_and(|c| !c.is_expired(now))
    }

    pub fn local_storage(&self, name: &str) -> Option<&str> {
        self.origins
            .iter()
            .flat_map(|o| o.local_storage.iter())
            .find(|item| item.name == name)
            .map(|item| item.value.as_str())
    }

    /// `Cookie` header value for requests to `host`; `None` if nothing applies.
    pub fn cookie_header_for(&self, host: &str, now: DateTime<Utc>) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host) && !c.is_expired(now))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    /// Folds one `Set-Cookie` header into the state. Returns whether anything changed.
    pub fn merge_set_cookie(&mut self, header: &str, default_domain: &str, now: DateTime<Utc>) -> bool {
        let Some(incoming) = parse_set_cookie(header, default_domain, now) else {
            return false;
        };
        match self
            .cookies
            .iter_mut()
            .find(|c| c.name == incoming.name && c.domain.trim_start_matches('.') == incoming.domain.trim_start_matches('.'))
        {
            Some(existing) if *existing == incoming => false,
            Some(existing) => {
                *existing = incoming;
                true
            }
            None => {
                self.cookies.push(incoming);
                true
            }
        }
    }
}

fn parse_set_cookie(header: &str, default_domain: &str, now: DateTime<Utc>) -> Option<Cookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_string(),
        value: value.trim().trim_matches('"').to_string(),
        domain: default_domain.to_string(),
        path: root_path(),
        expires: session_expiry(),
        http_only: false,
        secure: false,
        same_site: None,
    };

    for attr in parts {
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
            None => (attr.trim().to_ascii_lowercase(), ""),
        };
        match key.as_str() {
            "domain" if !val.is_empty() => cookie.domain = val.to_string(),
            "path" if !val.is_empty() => cookie.path = val.to_string(),
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    cookie.expires = (now.timestamp() + secs) as f64;
                }
            }
            "expires" => {
                if let Ok(at) = DateTime::parse_from_rfc2822(val) {
                    cookie.expires = at.timestamp() as f64;
                }
            }
            "httponly" => cookie.http_only = true,
            "secure" => cookie.secure = true,
            "samesite" => cookie.same_site = Some(val.to_string()),
            _ => {}
        }
    }
    Some(cookie)
}

/// What a source authenticates with.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSecret {
    /// Long-lived personal access token.
    Bearer(String),
    OAuth {
        client: OAuthClient,
        tokens: OAuthTokens,
    },
    Session(SessionState),
}

impl SourceSecret {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSecret::Bearer(_) => "bearer",
            SourceSecret::OAuth { .. } => "oauth",
            SourceSecret::Session(_) => "session",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    const STORAGE_STATE: &str = r#"{
        "cookies": [
            {"name": "JWT_FGP", "value": "fgp-1", "domain": ".connect.example.com", "path": "/",
             "expires": 1767225600, "httpOnly": true, "secure": true, "sameSite": "Lax"},
            {"name": "SESSIONID", "value": "abc", "domain": "connect.example.com", "path": "/",
             "expires": -1, "httpOnly": true, "secure": true, "sameSite": "None"},
            {"name": "other", "value": "x", "domain": "elsewhere.example.org", "path": "/",
             "expires": -1, "httpOnly": false, "secure": false}
        ],
        "origins": [
            {"origin": "https://connect.example.com",
             "localStorage": [{"name": "token", "value": "{\"access_token\":\"jwt\"}"}]}
        ]
    }"#;

    #[test]
    fn storage_state_export_parses() {
        let state: SessionState = serde_json::from_str(STORAGE_STATE).unwrap();
        assert_eq!(state.cookies.len(), 3);
        assert!(state.cookie("SESSIONID").unwrap().is_session());
        assert_eq!(state.local_storage("token"), Some("{\"access_token\":\"jwt\"}"));
        assert!(state.captured_at.is_none());
        assert!(!state.is_empty());
    }

    #[test]
    fn cookie_header_only_includes_matching_live_cookies() {
        let state: SessionState = serde_json::from_str(STORAGE_STATE).unwrap();
        let header = state
            .cookie_header_for("connect.example.com", at("2025-06-01T00:00:00Z"))
            .unwrap();
        assert_eq!(header, "JWT_FGP=fgp-1; SESSIONID=abc");

        let after_expiry = state
            .cookie_header_for("connect.example.com", at("2026-06-01T00:00:00Z"))
            .unwrap();
        assert_eq!(after_expiry, "SESSIONID=abc");
        assert!(state.cookie_header_for("unrelated.net", at("2025-06-01T00:00:00Z")).is_none());
    }

    #[test]
    fn cookie_liveness_tracks_expiry() {
        let state: SessionState = serde_json::from_str(STORAGE_STATE).unwrap();
        assert!(state.is_cookie_live("JWT_FGP", at("2025-12-31T00:00:00Z")));
        assert!(!state.is_cookie_live("JWT_FGP", at("2026-01-02T00:00:00Z")));
        assert!(state.is_cookie_live("SESSIONID", at("2030-01-01T00:00:00Z")));
        assert!(!state.is_cookie_live("missing", at("2025-01-01T00:00:00Z")));
    }

    #[test]
    fn set_cookie_replaces_or_appends() {
        let mut state: SessionState = serde_json::from_str(STORAGE_STATE).unwrap();
        let now = at("2025-06-01T00:00:00Z");

        assert!(state.merge_set_cookie("SESSIONID=def; Path=/; HttpOnly; Secure", "connect.example.com", now));
        assert_eq!(state.cookie("SESSIONID").unwrap().value, "def");
        assert_eq!(state.cookies.len(), 3);

        assert!(state.merge_set_cookie("csrf=t1; Max-Age=3600", "connect.example.com", now));
        let csrf = state.cookie("csrf").unwrap();
        assert_eq!(csrf.expires, (now.timestamp() + 3600) as f64);
        assert_eq!(state.cookies.len(), 4);

        assert!(!state.merge_set_cookie("csrf=t1; Max-Age=3600", "connect.example.com", now));
        assert!(!state.merge_set_cookie("garbage", "connect.example.com", now));
    }

    #[test]
    fn oauth_expiry_honors_skew() {
        let tokens = OAuthTokens {
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            expires_at: Some(at("2025-01-01T12:00:00Z")),
        };
        assert!(!tokens.is_expired(at("2025-01-01T11:00:00Z"), Duration::seconds(60)));
        assert!(tokens.is_expired(at("2025-01-01T11:59:30Z"), Duration::seconds(60)));
        let open_ended = OAuthTokens { expires_at: None, ..tokens };
        assert!(!open_ended.is_expired(at("2099-01-01T00:00:00Z"), Duration::zero()));
    }
}
