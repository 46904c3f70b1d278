use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hsync_core::{OAuthClient, OAuthTokens, SessionState, Source, SourceSecret};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{redact, write_atomic};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential configured for {0}")]
    Missing(Source),
    #[error("credential file {path} is unreadable: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("persisting credential for {0}: {1}")]
    Persist(Source, String),
}

/// Where adapters get their secrets from and where refreshed ones go back to.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_secret(&self, source: Source) -> Result<SourceSecret, CredentialError>;

    async fn put_tokens(&self, source: Source, tokens: &OAuthTokens) -> Result<(), CredentialError>;

    async fn put_session_state(&self, source: Source, state: &SessionState) -> Result<(), CredentialError>;
}

/// Secrets from `<SOURCE>_*` environment variables, with refreshed tokens and
/// browser sessions persisted as JSON files under a state directory.
///
/// * `<state>/<source>.json`: browser storage state (override with `<SOURCE>_STORAGE_STATE`).
/// * `<state>/<source>.tokens.json`: the latest OAuth tokens.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    state_dir: PathBuf,
    env: HashMap<String, String>,
}

impl FileCredentialStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self::with_env(state_dir, std::env::vars().collect())
    }

    pub fn with_env(state_dir: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            env,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// `<SOURCE>_<suffix>` from the environment, trimmed; blank counts as unset.
    pub fn var(&self, source: Source, suffix: &str) -> Option<String> {
        self.env
            .get(&format!("{}_{suffix}", source.env_prefix()))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn session_path(&self, source: Source) -> PathBuf {
        self.var(source, "STORAGE_STATE")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state_dir.join(format!("{}.json", source.as_str())))
    }

    pub fn tokens_path(&self, source: Source) -> PathBuf {
        self.state_dir.join(format!("{}.tokens.json", source.as_str()))
    }

    pub fn oauth_client(&self, source: Source) -> Option<OAuthClient> {
        let token_url = self
            .var(source, "TOKEN_URL")
            .or_else(|| source.default_token_url().map(str::to_string))?;
        Some(OAuthClient {
            client_id: self.var(source, "CLIENT_ID")?,
            client_secret: self.var(source, "CLIENT_SECRET")?,
            token_url,
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, CredentialError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CredentialError::Corrupt {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| CredentialError::Corrupt {
                path: path.display().to_string(),
                reason: err.to_string(),
            })
    }

    async fn write_json<T: serde::Serialize>(
        source: Source,
        path: &Path,
        value: &T,
    ) -> Result<(), CredentialError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| CredentialError::Persist(source, err.to_string()))?;
        write_atomic(path, &bytes)
            .await
            .map_err(|err| CredentialError::Persist(source, format!("{err:#}")))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get_secret(&self, source: Source) -> Result<SourceSecret, CredentialError> {
        if source.is_browser() {
            let path = self.session_path(source);
            let state: Option<SessionState> = Self::read_json(&path).await?;
            return match state {
                Some(state) if !state.is_empty() => {
                    debug!(%source, path = %path.display(), cookies = state.cookies.len(), "loaded session state");
                    Ok(SourceSecret::Session(state))
                }
                _ => Err(CredentialError::Missing(source)),
            };
        }

        let persisted: Option<OAuthTokens> = Self::read_json(&self.tokens_path(source)).await?;
        let env_tokens = self.var(source, "REFRESH_TOKEN").map(|refresh| OAuthTokens {
            access_token: self.var(source, "ACCESS_TOKEN").unwrap_or_default(),
            refresh_token: Some(refresh),
            expires_at: None,
        });

        if let (Some(client), Some(tokens)) = (self.oauth_client(source), persisted.or(env_tokens)) {
            debug!(%source, access = %redact(&tokens.access_token), "using oauth tokens");
            return Ok(SourceSecret::OAuth { client, tokens });
        }

        match self.var(source, "ACCESS_TOKEN") {
            Some(token) => {
                debug!(%source, access = %redact(&token), "using bearer token");
                Ok(SourceSecret::Bearer(token))
            }
            None => Err(CredentialError::Missing(source)),
        }
    }

    async fn put_tokens(&self, source: Source, tokens: &OAuthTokens) -> Result<(), CredentialError> {
        Self::write_json(source, &self.tokens_path(source), tokens).await
    }

    async fn put_session_state(&self, source: Source, state: &SessionState) -> Result<(), CredentialError> {
        Self::write_json(source, &self.session_path(source), state).await
    }
}

/// In-process store, used by tests and by callers that inject secrets directly.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<Source, SourceSecret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, source: Source, secret: SourceSecret) {
        self.secrets.lock().await.insert(source, secret);
    }

    pub async fn snapshot(&self, source: Source) -> Option<SourceSecret> {
        self.secrets.lock().await.get(&source).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_secret(&self, source: Source) -> Result<SourceSecret, CredentialError> {
        self.snapshot(source).await.ok_or(CredentialError::Missing(source))
    }

    async fn put_tokens(&self, source: Source, tokens: &OAuthTokens) -> Result<(), CredentialError> {
        let mut secrets = self.secrets.lock().await;
        match secrets.get_mut(&source) {
            Some(SourceSecret::OAuth { tokens: current, .. }) => *current = tokens.clone(),
            _ => {
                secrets.insert(source, SourceSecret::Bearer(tokens.access_token.clone()));
            }
        }
        Ok(())
    }

    async fn put_session_state(&self, source: Source, state: &SessionState) -> Result<(), CredentialError> {
        self.secrets
            .lock()
            .await
            .insert(source, SourceSecret::Session(state.clone()));
        Ok(())
    }
}
