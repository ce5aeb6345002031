use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::{AppError, AppResult};

/// Tokens with less than this much lifetime left are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;

const TOKEN_PATH: &str = "/oauth/token";

/// Access/refresh token pair with its absolute expiry time (unix seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

impl Credential {
    /// True once fewer than the safety margin remains before expiry.
    pub fn is_expiring(&self) -> bool {
        self.expires_at - unix_now() < EXPIRY_MARGIN_SECS
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

/// Token persistence strategy, swappable without touching uploader code.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<Credential>;
    fn save(&self, token: &Credential);
}

/// Token storage backed by a JSON file.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<Credential> {
        if !self.path.exists() {
            return None;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(token) => {
                    log::debug!("Loaded tokens from {}", self.path.display());
                    Some(token)
                }
                Err(e) => {
                    log::warn!("Ignoring unreadable token file {}: {}", self.path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read token file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&self, token: &Credential) {
        let write = || -> AppResult<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&self.path, serde_json::to_string(token)?)?;
            Ok(())
        };
        match write() {
            Ok(()) => log::debug!("Saved tokens to {}", self.path.display()),
            Err(e) => log::warn!("Failed to save token file {}: {}", self.path.display(), e),
        }
    }
}

/// Token storage in memory (lost on process exit).
#[derive(Default)]
pub struct InMemoryTokenStore {
    slot: StdMutex<Option<Credential>>,
}

impl TokenStore for InMemoryTokenStore {
    fn load(&self) -> Option<Credential> {
        match self.slot.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }

    fn save(&self, token: &Credential) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(token.clone());
        }
    }
}

/// Capability the pipeline needs from the auth subsystem: a valid bearer
/// token on demand, and an explicit refresh after a 401.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn ensure_valid_token(&self) -> AppResult<String>;
    async fn refresh(&self) -> AppResult<()>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Exchanges the one-time auth code and refreshes tokens against the
/// OAuth endpoint, persisting them through the configured [`TokenStore`].
pub struct StravaAuth {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    auth_code: String,
    store: Box<dyn TokenStore>,
    token: Mutex<Option<Credential>>,
}

impl StravaAuth {
    pub fn new(
        api_base: &str,
        client_id: String,
        client_secret: String,
        auth_code: String,
        store: Box<dyn TokenStore>,
    ) -> Self {
        let token = store.load();
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
            token_url: format!("{api_base}{TOKEN_PATH}"),
            client_id,
            client_secret,
            auth_code,
            store,
            token: Mutex::new(token),
        }
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> AppResult<Credential> {
        let response = self
            .http
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| AppError::auth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::auth(format!(
                "token endpoint returned HTTP {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::auth(format!("malformed token response: {e}")))?;

        Ok(Credential {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: unix_now() + body.expires_in,
        })
    }

    /// Exchange the one-time authorization code for a fresh token pair.
    async fn exchange_code(&self) -> AppResult<Credential> {
        let token = self
            .request_token(&[
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("code", &self.auth_code),
                ("grant_type", "authorization_code"),
            ])
            .await?;
        self.store.save(&token);
        log::info!("Exchanged code for access token, expires_at={}", token.expires_at);
        Ok(token)
    }

    async fn refresh_with(&self, refresh_token: &str) -> AppResult<Credential> {
        let mut token = self
            .request_token(&[
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;
        // Some responses omit the refresh token; keep the one we had.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        self.store.save(&token);
        log::info!("Refreshed access token, new expires_at={}", token.expires_at);
        Ok(token)
    }
}

#[async_trait]
impl CredentialProvider for StravaAuth {
    async fn ensure_valid_token(&self) -> AppResult<String> {
        let mut slot = self.token.lock().await;

        if slot.is_none() {
            *slot = Some(self.exchange_code().await?);
        }

        let expiring = slot.as_ref().map(|t| t.is_expiring()).unwrap_or(true);
        if expiring {
            let refresh_token = slot.as_ref().and_then(|t| t.refresh_token.clone());
            let renewed = match refresh_token {
                Some(rt) => match self.refresh_with(&rt).await {
                    Ok(token) => token,
                    Err(e) => {
                        log::warn!("Token refresh failed ({e}); re-exchanging auth code");
                        self.exchange_code().await?
                    }
                },
                None => self.exchange_code().await?,
            };
            *slot = Some(renewed);
        }

        slot.as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| AppError::auth("failed to obtain token"))
    }

    async fn refresh(&self) -> AppResult<()> {
        let mut slot = self.token.lock().await;
        let refresh_token = slot
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| AppError::auth("no refresh token available"))?;
        *slot = Some(self.refresh_with(&refresh_token).await?);
        Ok(())
    }
}
