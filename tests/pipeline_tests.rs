use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;

use strava_uploader::api::{ApiResponse, UploadApi, UploadStatus};
use strava_uploader::auth::CredentialProvider;
use strava_uploader::errors::{AppError, AppResult};
use strava_uploader::scan::FAILED_DIR;
use strava_uploader::uploader::poller::PollerConfig;
use strava_uploader::{AppConfig, Uploader};

/// One canned response: HTTP status, headers, optional body.
#[derive(Clone)]
struct Canned {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: Option<UploadStatus>,
}

impl Canned {
    fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    fn retry_after(mut self, seconds: u32) -> Self {
        self.headers.push(("retry-after", seconds.to_string()));
        self
    }

    fn body(mut self, body: UploadStatus) -> Self {
        self.body = Some(body);
        self
    }

    fn into_response(self) -> ApiResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        ApiResponse {
            status: StatusCode::from_u16(self.status).unwrap(),
            headers,
            body: self.body,
        }
    }
}

fn created(id: i64) -> UploadStatus {
    UploadStatus {
        id: Some(id),
        status: Some("Your activity is still being processed.".to_string()),
        activity_id: None,
        error: None,
    }
}

fn with_activity(id: i64, activity_id: i64) -> UploadStatus {
    UploadStatus {
        id: Some(id),
        status: Some("Your activity is ready.".to_string()),
        activity_id: Some(activity_id),
        error: None,
    }
}

/// Scripted stand-in for the uploads API. Responses are consumed per key
/// in order; the last one replays when the script runs dry.
#[derive(Default)]
struct ScriptedApi {
    uploads: Mutex<HashMap<String, VecDeque<Canned>>>,
    statuses: Mutex<HashMap<i64, VecDeque<Canned>>>,
    upload_calls: AtomicUsize,
    status_calls: AtomicUsize,
    on_upload: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl ScriptedApi {
    fn script_upload(&self, file_name: &str, responses: Vec<Canned>) {
        self.uploads
            .lock()
            .unwrap()
            .insert(file_name.to_string(), responses.into());
    }

    fn script_status(&self, upload_id: i64, responses: Vec<Canned>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(upload_id, responses.into());
    }

    fn set_on_upload(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_upload.lock().unwrap() = Some(Box::new(hook));
    }
}

fn take_next(queue: Option<&mut VecDeque<Canned>>) -> Canned {
    match queue {
        Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
        Some(queue) if queue.len() == 1 => queue.front().unwrap().clone(),
        _ => Canned::new(500),
    }
}

#[async_trait]
impl UploadApi for ScriptedApi {
    async fn upload(
        &self,
        _token: &str,
        file_name: &str,
        _content: Vec<u8>,
    ) -> AppResult<ApiResponse> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_upload.lock().unwrap().as_ref() {
            hook(file_name);
        }
        let mut uploads = self.uploads.lock().unwrap();
        Ok(take_next(uploads.get_mut(file_name)).into_response())
    }

    async fn upload_status(&self, _token: &str, upload_id: i64) -> AppResult<ApiResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        Ok(take_next(statuses.get_mut(&upload_id)).into_response())
    }
}

struct StaticAuth;

#[async_trait]
impl CredentialProvider for StaticAuth {
    async fn ensure_valid_token(&self) -> AppResult<String> {
        Ok("test-token".to_string())
    }

    async fn refresh(&self) -> AppResult<()> {
        Ok(())
    }
}

struct FailingAuth;

#[async_trait]
impl CredentialProvider for FailingAuth {
    async fn ensure_valid_token(&self) -> AppResult<String> {
        Err(AppError::auth("refresh impossible"))
    }

    async fn refresh(&self) -> AppResult<()> {
        Err(AppError::auth("refresh impossible"))
    }
}

fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        client_id: "id".to_string(),
        client_secret: "secret".to_string(),
        auth_code: "code".to_string(),
        fit_folder: dir.to_path_buf(),
        token_file: dir.join(".strava_tokens.json"),
        api_base: "http://unused.invalid".to_string(),
        max_concurrent: 2,
        max_requeue_per_file: None,
        history_file: None,
    }
}

fn fast_poller() -> PollerConfig {
    PollerConfig {
        base_interval: Duration::from_millis(20),
        max_interval: Duration::from_millis(50),
        max_duration: Duration::from_secs(60),
    }
}

fn seed_files(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), b"fit-bytes").unwrap();
    }
}

fn uploader_for(config: AppConfig, api: Arc<ScriptedApi>) -> Uploader {
    Uploader::new(config, api, Arc::new(StaticAuth)).with_poller_config(fast_poller())
}

fn quarantine_of(dir: &Path) -> PathBuf {
    dir.join(FAILED_DIR)
}

#[tokio::test]
async fn successful_upload_deletes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(201).body(created(555))]);
    api.script_status(555, vec![Canned::new(200).body(with_activity(555, 999))]);

    let summary = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();

    assert!(!dir.path().join("a.fit").exists());
    assert_eq!(summary.total, 1);
    assert_eq!(summary.success, 1);
    assert_eq!(summary.duplicate, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.retries, 0);
    assert_eq!(summary.processed.len(), 1);
    assert_eq!(summary.processed[0].status, "created");
    assert_eq!(summary.processed[0].upload_id, Some(555));
    assert_eq!(summary.processed[0].activity_id, Some(999));
    assert_eq!(api.upload_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.status_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_at_upload_skips_the_status_poll() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(409).body(created(555))]);

    let summary = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();

    assert!(!dir.path().join("a.fit").exists());
    assert!(!quarantine_of(dir.path()).join("a.fit").exists());
    assert_eq!(summary.duplicate, 1);
    assert_eq!(summary.success, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.processed[0].status, "duplicate");
    assert_eq!(summary.processed[0].upload_id, Some(555));
    assert_eq!(api.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rate_limited_upload_is_requeued_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload(
        "a.fit",
        vec![
            Canned::new(429).retry_after(2),
            Canned::new(201).body(created(7)),
        ],
    );
    api.script_status(7, vec![Canned::new(200).body(with_activity(7, 42))]);

    let started = std::time::Instant::now();
    let summary = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();

    // The Retry-After hint was honored before the second attempt.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(!dir.path().join("a.fit").exists());
    assert!(!quarantine_of(dir.path()).join("a.fit").exists());
    assert_eq!(summary.retries, 1);
    assert_eq!(summary.success, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(api.upload_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn server_rejection_quarantines_the_file() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(400)]);

    let summary = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();

    assert!(!dir.path().join("a.fit").exists());
    assert!(quarantine_of(dir.path()).join("a.fit").exists());
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed[0].status, "failed");
    assert_eq!(summary.processed[0].reason.as_deref(), Some("HTTP 400"));
}

#[tokio::test]
async fn unresolved_status_times_out_into_quarantine() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(201).body(created(9))]);
    // The status script never reaches a terminal answer.
    api.script_status(9, vec![Canned::new(200).body(created(9))]);

    let mut poller = fast_poller();
    poller.max_duration = Duration::from_millis(300);
    let uploader = Uploader::new(test_config(dir.path()), api.clone(), Arc::new(StaticAuth))
        .with_poller_config(poller);
    let summary = uploader.run().await.unwrap();

    assert!(quarantine_of(dir.path()).join("a.fit").exists());
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed[0].reason.as_deref(), Some("timed_out"));
}

#[tokio::test]
async fn poll_rate_limits_still_complete_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(201).body(created(5))]);
    api.script_status(
        5,
        vec![
            Canned::new(429).retry_after(1),
            Canned::new(429).retry_after(1),
            Canned::new(200).body(with_activity(5, 77)),
        ],
    );

    let summary = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.processed.len(), 1);
    assert_eq!(summary.success, 1);
    assert_eq!(api.status_calls.load(Ordering::SeqCst), 3);
    assert!(!dir.path().join("a.fit").exists());
}

#[tokio::test]
async fn second_run_on_a_clean_folder_uploads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(201).body(created(1))]);
    api.script_status(1, vec![Canned::new(200).body(with_activity(1, 2))]);

    let first = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(first.success, 1);

    let second = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(second.total, 0);
    assert_eq!(api.upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn files_removed_mid_run_are_skipped_without_error() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit", "b.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(201).body(created(1))]);
    api.script_status(1, vec![Canned::new(200).body(with_activity(1, 2))]);

    // Simulate an external process grabbing b.fit while a.fit uploads.
    let stolen = dir.path().join("b.fit");
    api.set_on_upload(move |file_name| {
        if file_name == "a.fit" {
            let _ = std::fs::remove_file(&stolen);
        }
    });

    let mut config = test_config(dir.path());
    config.max_concurrent = 1;
    let summary = uploader_for(config, api.clone()).run().await.unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.success, 1);
    assert_eq!(summary.failed, 0);
    assert!(summary
        .processed
        .iter()
        .any(|outcome| outcome.status == "missing" && outcome.file.ends_with("b.fit")));
    assert!(!quarantine_of(dir.path()).join("b.fit").exists());
    assert_eq!(api.upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_file_ends_in_exactly_one_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit", "b.fit", "c.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(201).body(created(1))]);
    api.script_status(1, vec![Canned::new(200).body(with_activity(1, 10))]);
    api.script_upload("b.fit", vec![Canned::new(409).body(created(2))]);
    api.script_upload("c.fit", vec![Canned::new(500)]);

    let summary = uploader_for(test_config(dir.path()), api.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.success, 1);
    assert_eq!(summary.duplicate, 1);
    assert_eq!(summary.failed, 1);

    // No candidates remain, and only the failure sits in quarantine.
    assert!(strava_uploader::scan::scan_candidates(dir.path())
        .unwrap()
        .is_empty());
    assert!(quarantine_of(dir.path()).join("c.fit").exists());
    assert!(!quarantine_of(dir.path()).join("a.fit").exists());
    assert!(!quarantine_of(dir.path()).join("b.fit").exists());
}

#[tokio::test]
async fn requeue_ceiling_surfaces_rate_limit_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload(
        "a.fit",
        vec![
            Canned::new(429).retry_after(1),
            Canned::new(429).retry_after(1),
        ],
    );

    let mut config = test_config(dir.path());
    config.max_requeue_per_file = Some(1);
    let summary = uploader_for(config, api.clone()).run().await.unwrap();

    assert_eq!(summary.retries, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed[0].status, "rate_limit_exhausted");
    assert!(quarantine_of(dir.path()).join("a.fit").exists());
    assert_eq!(api.upload_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn interruption_still_reports_and_leaves_queued_files() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit", "b.fit"]);

    let api = Arc::new(ScriptedApi::default());
    api.script_upload("a.fit", vec![Canned::new(201).body(created(1))]);
    api.script_status(1, vec![Canned::new(200).body(with_activity(1, 2))]);

    let mut config = test_config(dir.path());
    config.max_concurrent = 1;
    let uploader = uploader_for(config, api.clone());

    // Interrupt as soon as the first upload is in flight; the in-flight
    // attempt finishes, the second file is never picked up.
    let cancel = uploader.cancel_token();
    api.set_on_upload(move |file_name| {
        if file_name == "a.fit" {
            cancel.cancel();
        }
    });

    let summary = uploader.run().await.unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.success, 1);
    assert_eq!(summary.failed, 0);
    assert!(!dir.path().join("a.fit").exists());
    assert!(dir.path().join("b.fit").exists());
    assert!(!quarantine_of(dir.path()).join("b.fit").exists());
    assert_eq!(api.upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn credential_failure_aborts_and_leaves_files_in_place() {
    let dir = tempfile::tempdir().unwrap();
    seed_files(dir.path(), &["a.fit"]);

    let api = Arc::new(ScriptedApi::default());
    let uploader = Uploader::new(test_config(dir.path()), api.clone(), Arc::new(FailingAuth))
        .with_poller_config(fast_poller());

    let result = uploader.run().await;
    assert!(matches!(result, Err(AppError::Auth { .. })));

    // The candidate was neither uploaded, deleted, nor quarantined.
    assert!(dir.path().join("a.fit").exists());
    assert!(!quarantine_of(dir.path()).join("a.fit").exists());
    assert_eq!(api.upload_calls.load(Ordering::SeqCst), 0);
}
