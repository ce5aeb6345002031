use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{multipart, Client, StatusCode};
use serde::Deserialize;

use crate::errors::AppResult;

/// Bound on a single upload request; file content is already in memory by
/// the time the request starts.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Server-side record of an upload, as returned by both the upload POST
/// and the status GET.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadStatus {
    pub id: Option<i64>,
    pub status: Option<String>,
    pub activity_id: Option<i64>,
    pub error: Option<String>,
}

impl UploadStatus {
    /// The server is done processing: an activity exists, an error was
    /// reported, or the status text flags a duplicate.
    pub fn is_terminal(&self) -> bool {
        self.activity_id.is_some()
            || self.error.is_some()
            || self.is_duplicate()
    }

    pub fn is_duplicate(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.to_lowercase().contains("duplicate"))
            .unwrap_or(false)
    }
}

/// One API call's outcome: the HTTP status plus everything the pipeline
/// needs from the response before interpreting it.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<UploadStatus>,
}

impl ApiResponse {
    /// Server wait hint in seconds, when a 429 carries one.
    pub fn retry_after(&self) -> Option<f64> {
        self.headers
            .get(reqwest::header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

/// The two network operations the pipeline performs against the uploads
/// API. A trait seam so workers and the poller can run against scripted
/// responses in tests.
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// POST the file content as a new upload.
    async fn upload(&self, token: &str, file_name: &str, content: Vec<u8>)
        -> AppResult<ApiResponse>;

    /// GET the processing status of a previously created upload.
    async fn upload_status(&self, token: &str, upload_id: i64) -> AppResult<ApiResponse>;
}

/// Strava API client over a single shared connection pool.
pub struct StravaApiClient {
    http: Client,
    base: String,
}

impl StravaApiClient {
    pub fn new(api_base: &str) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap(),
            base: api_base.to_string(),
        }
    }
}

#[async_trait]
impl UploadApi for StravaApiClient {
    async fn upload(
        &self,
        token: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> AppResult<ApiResponse> {
        let part = multipart::Part::bytes(content)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new()
            .text("data_type", "fit")
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/api/v3/uploads", self.base))
            .bearer_auth(token)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        // Only created and conflict responses carry an upload record.
        let body = if status == StatusCode::CREATED || status == StatusCode::CONFLICT {
            response.json().await.ok()
        } else {
            None
        };

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn upload_status(&self, token: &str, upload_id: i64) -> AppResult<ApiResponse> {
        let response = self
            .http
            .get(format!("{}/api/v3/uploads/{}", self.base, upload_id))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = if status.is_success() {
            response.json().await.ok()
        } else {
            None
        };

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
