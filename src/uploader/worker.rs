use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::UploadApi;
use crate::auth::CredentialProvider;
use crate::errors::AppError;
use crate::limiter::RateLimiter;

use super::job::{Disposition, JobEvent, JobState, UploadJob};
use super::poller::PollRequest;
use super::queue::JobQueue;

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub api: Arc<dyn UploadApi>,
    pub auth: Arc<dyn CredentialProvider>,
    pub limiter: Arc<RateLimiter>,
    pub poll_requests: mpsc::UnboundedSender<PollRequest>,
    pub events: mpsc::UnboundedSender<JobEvent>,
    pub cancel: CancellationToken,
    pub max_requeue: Option<u32>,
    /// First fatal error wins; set only for total credential failure.
    pub fatal: Arc<StdMutex<Option<AppError>>>,
}

impl WorkerContext {
    fn complete(&self, mut job: UploadJob, disposition: Disposition) {
        job.state = match disposition {
            Disposition::Success { .. } => JobState::Succeeded,
            Disposition::Duplicate { .. } => JobState::Duplicate,
            Disposition::Skipped => job.state,
            _ => JobState::Failed,
        };
        if self
            .events
            .send(JobEvent::Completed { job, disposition })
            .is_err()
        {
            log::error!("Job completion had no receiver");
        }
    }

    /// Record a total credential failure and bring the run down. The job
    /// goes back to the queue untouched so its file is left in place.
    async fn abort_run(&self, mut job: UploadJob, error: AppError) {
        log::error!("Credential failure; aborting the run: {error}");
        if let Ok(mut fatal) = self.fatal.lock() {
            fatal.get_or_insert(error);
        }
        job.state = JobState::Pending;
        self.queue.push(job).await;
        self.cancel.cancel();
    }
}

/// Worker loop: drain the shared queue until cancelled.
pub async fn run_worker(ctx: Arc<WorkerContext>, index: usize) {
    loop {
        // biased: once cancelled, never pick up new work.
        let job = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            job = ctx.queue.pop() => job,
        };
        process_job(&ctx, job).await;
        ctx.queue.task_done().await;
    }
    log::debug!("worker-{index} stopped");
}

/// One upload attempt for one job. Every exit path either finalizes the
/// job through the event channel, hands it to the poller, or requeues it.
async fn process_job(ctx: &WorkerContext, mut job: UploadJob) {
    let file_name = job.file_name();

    // Externally removed files are skipped without error.
    if !job.path.exists() {
        log::info!("File disappeared before upload: {file_name}");
        ctx.complete(job, Disposition::Skipped);
        return;
    }

    tokio::select! {
        _ = ctx.limiter.acquire() => {}
        _ = ctx.cancel.cancelled() => {
            // Not processed; the job stays in the queue for the summary.
            ctx.queue.push(job).await;
            return;
        }
    }

    let mut token = match ctx.auth.ensure_valid_token().await {
        Ok(token) => token,
        Err(e) => {
            ctx.abort_run(job, e).await;
            return;
        }
    };

    // Read the whole file up front so no handle stays open across a
    // potentially slow network call.
    let content = match tokio::fs::read(&job.path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::info!("File disappeared before upload: {file_name}");
            ctx.complete(job, Disposition::Skipped);
            return;
        }
        Err(e) => {
            log::error!("Could not read {file_name}: {e}");
            ctx.complete(
                job,
                Disposition::Failed {
                    reason: format!("read failed: {e}"),
                },
            );
            return;
        }
    };

    job.state = JobState::Uploading;
    log::info!("Uploading: {file_name} ({} bytes)", content.len());

    loop {
        let response = match ctx.api.upload(&token, &file_name, content.clone()).await {
            Ok(response) => response,
            Err(e) => {
                // Timeouts and connection resets land here; the file is
                // quarantined rather than resubmitted blind.
                log::error!("Upload failed for {file_name}: {e}");
                ctx.complete(job, Disposition::Failed { reason: e.to_string() });
                return;
            }
        };

        ctx.limiter.update_from_response(&response.headers).await;
        job.last_http_status = Some(response.status.as_u16());
        log::info!("Response for {file_name}: HTTP {}", response.status.as_u16());

        match response.status {
            StatusCode::CREATED => {
                match response.body.as_ref().and_then(|b| b.id) {
                    Some(upload_id) => {
                        job.state = JobState::AwaitingStatus;
                        log::info!("Upload accepted for {file_name} (upload_id={upload_id})");
                        if let Err(send_error) =
                            ctx.poll_requests.send(PollRequest { upload_id, job })
                        {
                            let returned = send_error.0.job;
                            log::error!(
                                "Status poller is gone; finalizing {} without a status check",
                                returned.file_name()
                            );
                            ctx.complete(
                                returned,
                                Disposition::Failed {
                                    reason: "poller unavailable".to_string(),
                                },
                            );
                        }
                    }
                    None => {
                        ctx.complete(
                            job,
                            Disposition::Failed {
                                reason: "201 response missing upload id".to_string(),
                            },
                        );
                    }
                }
                return;
            }
            StatusCode::CONFLICT => {
                log::info!("Duplicate at upload: {file_name}");
                let upload_id = response.body.and_then(|b| b.id);
                ctx.complete(job, Disposition::Duplicate { upload_id });
                return;
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let hint = response.retry_after();
                log::warn!("Rate limit 429 for {file_name} | Retry-After: {hint:?}");

                if let Some(max) = ctx.max_requeue {
                    if job.retries >= max {
                        log::warn!(
                            "{file_name} exhausted its requeue ceiling of {max}; giving up"
                        );
                        ctx.complete(job, Disposition::RateLimitExhausted);
                        return;
                    }
                }

                job.retries += 1;
                let _ = ctx.events.send(JobEvent::Requeued {
                    file: job.path.clone(),
                });

                tokio::select! {
                    _ = ctx.limiter.force_backoff(hint) => {}
                    _ = ctx.cancel.cancelled() => {}
                }

                log::info!(
                    "Re-queueing {file_name} for retry (rate limited, attempt {})",
                    job.retries
                );
                job.state = JobState::Pending;
                ctx.queue.push(job).await;
                return;
            }
            StatusCode::UNAUTHORIZED if !job.auth_retried => {
                job.auth_retried = true;
                log::warn!("Token rejected for {file_name}; refreshing once and retrying");
                if let Err(e) = ctx.auth.refresh().await {
                    ctx.abort_run(job, e).await;
                    return;
                }
                token = match ctx.auth.ensure_valid_token().await {
                    Ok(token) => token,
                    Err(e) => {
                        ctx.abort_run(job, e).await;
                        return;
                    }
                };
                continue;
            }
            status if status.as_u16() >= 400 => {
                log::error!("Upload failed with status {} for {file_name}", status.as_u16());
                ctx.complete(
                    job,
                    Disposition::Failed {
                        reason: format!("HTTP {}", status.as_u16()),
                    },
                );
                return;
            }
            status => {
                log::error!("Unexpected status {} for {file_name}", status.as_u16());
                ctx.complete(
                    job,
                    Disposition::Failed {
                        reason: format!("unexpected HTTP {}", status.as_u16()),
                    },
                );
                return;
            }
        }
    }
}
