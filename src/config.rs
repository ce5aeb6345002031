use std::env;
use std::path::PathBuf;

use crate::errors::{AppError, AppResult};

/// Runtime configuration, sourced from the environment (and `.env` when
/// present). Credentials identify the registered API application; the
/// one-time authorization code is exchanged for tokens on first use.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_code: String,
    /// Folder containing candidate `.fit` files.
    pub fit_folder: PathBuf,
    /// Where OAuth tokens are persisted between runs.
    pub token_file: PathBuf,
    pub api_base: String,
    /// Number of concurrent upload workers.
    pub max_concurrent: usize,
    /// Optional per-file ceiling on rate-limit requeues. `None` keeps the
    /// original unbounded behavior.
    pub max_requeue_per_file: Option<u32>,
    /// After-action report location; `None` disables history recording.
    pub history_file: Option<PathBuf>,
}

const DEFAULT_API_BASE: &str = "https://www.strava.com";
const DEFAULT_MAX_CONCURRENT: usize = 5;

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        let config = Self {
            client_id: require("CLIENT_ID")?,
            client_secret: require("CLIENT_SECRET")?,
            auth_code: require("AUTH_CODE")?,
            fit_folder: PathBuf::from(require("FIT_FOLDER")?),
            token_file: env::var("STRAVA_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".strava_tokens.json")),
            api_base: env::var("STRAVA_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            max_concurrent: match env::var("MAX_CONCURRENT") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| AppError::config("MAX_CONCURRENT must be a number"))?,
                Err(_) => DEFAULT_MAX_CONCURRENT,
            },
            max_requeue_per_file: match env::var("STRAVA_MAX_REQUEUE") {
                Ok(raw) => Some(
                    raw.parse()
                        .map_err(|_| AppError::config("STRAVA_MAX_REQUEUE must be a number"))?,
                ),
                Err(_) => None,
            },
            history_file: Some(PathBuf::from("upload_history.json")),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_concurrent == 0 || self.max_concurrent > 32 {
            return Err(AppError::config("max_concurrent must be between 1 and 32"));
        }

        if self.api_base.is_empty() || !self.api_base.starts_with("http") {
            return Err(AppError::config("api_base must be an http(s) URL"));
        }

        if self.api_base.ends_with('/') {
            return Err(AppError::config("api_base must not end with a slash"));
        }

        Ok(())
    }
}

fn require(name: &str) -> AppResult<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AppError::config(format!(
            "Missing {name}. Set it in the environment or a .env file."
        ))),
    }
}
