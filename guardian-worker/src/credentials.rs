//! Bearer tokens for the remote API.
//!
//! The interactive first-time authorization is done out of band. This module only
//! reads the cached result of it and keeps the access token fresh.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::CredentialsError;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REFRESH_MARGIN_SECS: i64 = 60;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, CredentialsError>;
}

/// A fixed token, e.g. from the environment.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, CredentialsError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_owned()
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_owned()
}

impl CachedToken {
    /// A token without a known expiry is assumed valid.
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .map(|expiry| expiry - now <= Duration::seconds(REFRESH_MARGIN_SECS))
            .unwrap_or(false)
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
    token_type: Option<String>,
    refresh_token: Option<String>,
}

/// Reads the cached OAuth token and refreshes it shortly before it expires.
pub struct CachedTokenProvider {
    client: Client,
    secrets: ClientSecrets,
    token_path: PathBuf,
    token: Mutex<CachedToken>,
}

impl CachedTokenProvider {
    pub async fn load(
        client: Client,
        secrets_path: impl AsRef<Path>,
        token_path: impl Into<PathBuf>,
    ) -> Result<Self, CredentialsError> {
        let secrets_path = secrets_path.as_ref();
        let token_path = token_path.into();

        let secrets_file: ClientSecretsFile = read_json(secrets_path).await?;
        let secrets = secrets_file
            .installed
            .or(secrets_file.web)
            .ok_or_else(|| CredentialsError::MissingClient(secrets_path.display().to_string()))?;

        if !tokio::fs::try_exists(&token_path).await.unwrap_or(false) {
            return Err(CredentialsError::MissingToken(
                token_path.display().to_string(),
            ));
        }
        let token: CachedToken = read_json(&token_path).await?;

        Ok(Self {
            client,
            secrets,
            token_path,
            token: Mutex::new(token),
        })
    }

    async fn refresh(&self, current: &CachedToken) -> Result<CachedToken, CredentialsError> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or(CredentialsError::NotRefreshable)?;

        let response = self
            .client
            .post(&self.secrets.token_uri)
            .form(&[
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CredentialsError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let refreshed: RefreshResponse = response.json().await?;
        Ok(CachedToken {
            access_token: refreshed.access_token,
            token_type: refreshed
                .token_type
                .unwrap_or_else(|| current.token_type.clone()),
            refresh_token: refreshed
                .refresh_token
                .or_else(|| current.refresh_token.clone()),
            expiry: refreshed
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }

    async fn persist(&self, token: &CachedToken) -> Result<(), CredentialsError> {
        let write_error = |source| CredentialsError::Write {
            path: self.token_path.display().to_string(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(token).map_err(|source| CredentialsError::Parse {
            path: self.token_path.display().to_string(),
            source,
        })?;

        let mut temp = self.token_path.clone().into_os_string();
        temp.push(".tmp");
        tokio::fs::write(&temp, bytes).await.map_err(write_error)?;
        tokio::fs::rename(&temp, &self.token_path)
            .await
            .map_err(write_error)
    }
}

#[async_trait]
impl TokenProvider for CachedTokenProvider {
    async fn access_token(&self) -> Result<String, CredentialsError> {
        let mut token = self.token.lock().await;
        if !token.needs_refresh(Utc::now()) {
            return Ok(token.access_token.clone());
        }

        let refreshed = self.refresh(&token).await?;
        info!(expiry = ?refreshed.expiry, "refreshed access token");
        self.persist(&refreshed).await?;
        *token = refreshed;

        Ok(token.access_token.clone())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CredentialsError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CredentialsError::Read {
            path: path.display().to_string(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| CredentialsError::Parse {
        path: path.display().to_string(),
        source,
    })
}
