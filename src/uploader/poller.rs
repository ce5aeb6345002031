use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::api::UploadApi;
use crate::auth::CredentialProvider;
use crate::limiter::RateLimiter;

use super::job::{Disposition, JobEvent, JobState, UploadJob};

/// Reason string attached when polling never resolves.
pub const TIMED_OUT: &str = "timed_out";

/// Pacing for the status poll loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// First wait after a non-terminal response.
    pub base_interval: Duration,
    /// Cap on the exponential backoff between polls.
    pub max_interval: Duration,
    /// Per-entry bound; entries that never resolve are reported as timed
    /// out rather than polled forever.
    pub max_duration: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            max_duration: Duration::from_secs(10 * 60),
        }
    }
}

/// A worker hands a job here after a 201; the poller owns it until its
/// terminal status is known.
#[derive(Debug)]
pub struct PollRequest {
    pub upload_id: i64,
    pub job: UploadJob,
}

/// Single serialized consumer of status checks: many workers upload
/// concurrently, but only one status request is ever in flight against
/// the rate-limited status endpoint. Exactly one completion event is
/// emitted per request. The consuming loop exits only after the request
/// channel is closed and drained, so shutdown never abandons an upload
/// the server already accepted.
pub struct StatusPoller {
    api: Arc<dyn UploadApi>,
    auth: Arc<dyn CredentialProvider>,
    limiter: Arc<RateLimiter>,
    config: PollerConfig,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl StatusPoller {
    pub fn new(
        api: Arc<dyn UploadApi>,
        auth: Arc<dyn CredentialProvider>,
        limiter: Arc<RateLimiter>,
        config: PollerConfig,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            api,
            auth,
            limiter,
            config,
            events,
        }
    }

    pub async fn run(self, mut requests: mpsc::UnboundedReceiver<PollRequest>) {
        while let Some(request) = requests.recv().await {
            let disposition = self.poll_one(&request).await;
            let mut job = request.job;
            job.state = match disposition {
                Disposition::Success { .. } => JobState::Succeeded,
                Disposition::Duplicate { .. } => JobState::Duplicate,
                _ => JobState::Failed,
            };
            if self
                .events
                .send(JobEvent::Completed { job, disposition })
                .is_err()
            {
                log::error!(
                    "Completion for upload {} had no receiver",
                    request.upload_id
                );
            }
        }
        log::debug!("Status poller drained");
    }

    async fn poll_one(&self, request: &PollRequest) -> Disposition {
        let deadline = Instant::now() + self.config.max_duration;
        let mut backoff = self.config.base_interval;

        loop {
            if Instant::now() >= deadline {
                log::warn!(
                    "Status for upload {} did not resolve within {:?}",
                    request.upload_id,
                    self.config.max_duration
                );
                return Disposition::Failed {
                    reason: TIMED_OUT.to_string(),
                };
            }

            self.limiter.acquire().await;

            let token = match self.auth.ensure_valid_token().await {
                Ok(token) => token,
                Err(e) => {
                    log::error!(
                        "Could not obtain a token while polling upload {}: {}",
                        request.upload_id,
                        e
                    );
                    return Disposition::Failed {
                        reason: TIMED_OUT.to_string(),
                    };
                }
            };

            match self.api.upload_status(&token, request.upload_id).await {
                Ok(response) => {
                    self.limiter.update_from_response(&response.headers).await;

                    if response.status == StatusCode::TOO_MANY_REQUESTS {
                        log::warn!(
                            "Poller rate limited on upload {}, Retry-After: {:?}",
                            request.upload_id,
                            response.retry_after()
                        );
                        self.limiter.force_backoff(response.retry_after()).await;
                        // This entry keeps its position; retry immediately.
                        continue;
                    }

                    match response.body {
                        Some(body) if body.is_terminal() => {
                            return Disposition::from_final_status(body);
                        }
                        Some(_) => {}
                        None => {
                            log::warn!(
                                "Poll for upload {} returned HTTP {} without a usable body",
                                request.upload_id,
                                response.status
                            );
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Poll attempt for upload {} failed: {}", request.upload_id, e);
                }
            }

            sleep(backoff).await;
            backoff = backoff.mul_f64(1.5).min(self.config.max_interval);
        }
    }
}
