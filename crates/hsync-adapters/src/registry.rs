use std::collections::BTreeMap;
use std::sync::Arc;

use hsync_core::{SessionState, Source, SourceSecret};
use hsync_storage::HttpFetcher;
use serde::{Deserialize, Serialize};

use crate::api::{ApiAdapter, ApiAuth};
use crate::browser::{BrowserAdapter, HttpSessionDriver};
use crate::normalize::Normalizer;
use crate::sources::{
    GarminNormalizer, GarminPlan, OuraNormalizer, OuraPlan, PolarNormalizer, PolarPlan, RollaOneNormalizer, RollaOnePlan,
    UltrahumanNormalizer, UltrahumanPlan, WithingsNormalizer, WithingsPlan,
};
use crate::{AdapterError, SourceAdapter};

/// Per-source entry of the source registry (`sources.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Largest window fetched in one go; backfills are split into chunks of this size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_window_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            max_window_days: None,
            requests_per_minute: None,
            extras: BTreeMap::new(),
        }
    }
}

impl SourceSettings {
    pub fn window_days(&self, source: Source) -> u32 {
        self.max_window_days.unwrap_or(match source {
            Source::Oura => 30,
            Source::Ultrahuman | Source::Polar | Source::Withings => 14,
            Source::Garmin | Source::RollaOne => 7,
        })
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }
}

fn browser_session(source: Source, secret: Option<SourceSecret>) -> Result<Option<SessionState>, AdapterError> {
    match secret {
        None => Ok(None),
        Some(SourceSecret::Session(state)) => Ok(Some(state)),
        Some(other) => Err(AdapterError::MissingCredential(
            source,
            format!("expected a browser session, got a {} credential", other.kind()),
        )),
    }
}

fn api_auth(source: Source, secret: Option<SourceSecret>) -> Result<ApiAuth, AdapterError> {
    let secret = secret.ok_or_else(|| {
        AdapterError::MissingCredential(
            source,
            format!("set {0}_ACCESS_TOKEN or {0}_CLIENT_ID/_CLIENT_SECRET/_REFRESH_TOKEN", source.env_prefix()),
        )
    })?;
    ApiAuth::from_secret(source, secret)
}

/// Wires the adapter for `source`. A browser source without a session still
/// builds; its first fetch reports `LoginRequired`.
pub fn build_adapter(
    source: Source,
    secret: Option<SourceSecret>,
    settings: &SourceSettings,
    http: Arc<HttpFetcher>,
) -> Result<SourceAdapter, AdapterError> {
    let base_url = settings.base_url.as_deref();
    Ok(match source {
        Source::Oura => SourceAdapter::Api(ApiAdapter::new(
            Arc::new(OuraPlan::new(base_url)),
            api_auth(source, secret)?,
            http,
        )),
        Source::Ultrahuman => {
            let email = settings.extra("user_email").ok_or_else(|| {
                AdapterError::MissingCredential(source, "set ULTRAHUMAN_USER_EMAIL or extras.user_email".into())
            })?;
            SourceAdapter::Api(ApiAdapter::new(
                Arc::new(UltrahumanPlan::new(base_url, email)),
                api_auth(source, secret)?,
                http,
            ))
        }
        Source::Polar => SourceAdapter::Api(ApiAdapter::new(
            Arc::new(PolarPlan::new(base_url)),
            api_auth(source, secret)?,
            http,
        )),
        Source::Withings => SourceAdapter::Api(ApiAdapter::new(
            Arc::new(WithingsPlan::new(base_url)),
            api_auth(source, secret)?,
            http,
        )),
        Source::Garmin => SourceAdapter::Browser(BrowserAdapter::new(
            Arc::new(GarminPlan::new(base_url, settings.extra("api_url"))),
            Arc::new(HttpSessionDriver::new(http, source)),
            browser_session(source, secret)?,
        )),
        Source::RollaOne => SourceAdapter::Browser(BrowserAdapter::new(
            Arc::new(RollaOnePlan::new(base_url)),
            Arc::new(HttpSessionDriver::new(http, source)),
            browser_session(source, secret)?,
        )),
    })
}

pub fn normalizer_for(source: Source) -> Arc<dyn Normalizer> {
    match source {
        Source::Oura => Arc::new(OuraNormalizer),
        Source::Ultrahuman => Arc::new(UltrahumanNormalizer),
        Source::Polar => Arc::new(PolarNormalizer),
        Source::Withings => Arc::new(WithingsNormalizer),
        Source::Garmin => Arc::new(GarminNormalizer),
        Source::RollaOne => Arc::new(RollaOneNormalizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsync_storage::HttpClientConfig;

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    #[test]
    fn settings_parse_with_defaults() {
        let settings: SourceSettings = serde_json::from_str(r#"{"extras": {"user_email": "me@example.com"}}"#).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.window_days(Source::Oura), 30);
        assert_eq!(settings.extra("user_email"), Some("me@example.com"));
        assert_eq!(settings.extra("missing"), None);
    }

    #[test]
    fn every_source_maps_to_its_family() {
        let settings = SourceSettings {
            extras: BTreeMap::from([("user_email".to_string(), "me@example.com".to_string())]),
            ..SourceSettings::default()
        };
        for source in Source::ALL {
            let secret = if source.is_browser() { None } else { Some(SourceSecret::Bearer("t".into())) };
            let adapter = build_adapter(source, secret, &settings, http()).unwrap();
            assert_eq!(adapter.source(), source);
            assert_eq!(adapter.family(), if source.is_browser() { "browser" } else { "api" });
            assert_eq!(normalizer_for(source).source(), source);
        }
    }

    #[test]
    fn api_sources_need_a_credential() {
        let err = build_adapter(Source::Oura, None, &SourceSettings::default(), http()).err().unwrap();
        assert_eq!(err.kind(), "missing_credential");
        assert!(err.to_string().contains("OURA_ACCESS_TOKEN"));

        let err = build_adapter(Source::Ultrahuman, Some(SourceSecret::Bearer("t".into())), &SourceSettings::default(), http())
            .err()
            .unwrap();
        assert!(err.to_string().contains("ULTRAHUMAN_USER_EMAIL"));
    }

    #[test]
    fn browser_sources_reject_api_tokens() {
        let err = build_adapter(Source::Garmin, Some(SourceSecret::Bearer("t".into())), &SourceSettings::default(), http())
            .err()
            .unwrap();
        assert_eq!(err.kind(), "missing_credential");
    }
}
