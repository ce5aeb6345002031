// Upload pipeline: a bounded worker pool drains the candidate queue, a
// single serialized poller resolves post-upload processing status, and a
// finalizer applies every terminal disposition to disk and the summary.

pub mod job;
pub mod poller;
pub mod queue;
pub mod report;
pub mod worker;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::UploadApi;
use crate::auth::CredentialProvider;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::limiter::RateLimiter;
use crate::scan;

use job::UploadJob;
use poller::{PollerConfig, StatusPoller};
use queue::JobQueue;
use report::RunSummary;
use worker::{run_worker, WorkerContext};

pub use job::{Disposition, JobEvent, JobState};
pub use poller::PollRequest;
pub use report::FileOutcome;

/// Orchestrates one batch run: seeds the queue, runs the pool and poller
/// to completion, and emits the after-action report. Interruption via the
/// cancel token stops new work while in-flight attempts finish and the
/// poller drains, so the partial summary is still emitted.
pub struct Uploader {
    config: AppConfig,
    api: Arc<dyn UploadApi>,
    auth: Arc<dyn CredentialProvider>,
    limiter: Arc<RateLimiter>,
    poller_config: PollerConfig,
    cancel: CancellationToken,
}

impl Uploader {
    pub fn new(
        config: AppConfig,
        api: Arc<dyn UploadApi>,
        auth: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            api,
            auth,
            limiter: Arc::new(RateLimiter::new()),
            poller_config: PollerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    /// Token that interrupts the run from outside (e.g. Ctrl-C).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> AppResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let folder = self.config.fit_folder.clone();

        scan::setup_folders(&folder)?;
        let candidates = scan::scan_candidates(&folder)?;

        if candidates.is_empty() {
            println!("No new FIT files to upload.");
            log::info!("No FIT files found in {}", folder.display());
            return Ok(RunSummary::new(run_id, 0));
        }

        println!("Found {} FIT files to upload.", candidates.len());
        log::info!(
            "Starting upload session {run_id}: {} files queued",
            candidates.len()
        );

        let queue = Arc::new(JobQueue::new());
        for path in &candidates {
            queue.push(UploadJob::new(path.clone())).await;
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let fatal = Arc::new(StdMutex::new(None::<AppError>));

        let finalizer = tokio::spawn(report::collect_outcomes(
            event_rx,
            folder.clone(),
            candidates.len(),
            run_id,
        ));

        let poller = StatusPoller::new(
            self.api.clone(),
            self.auth.clone(),
            self.limiter.clone(),
            self.poller_config.clone(),
            event_tx.clone(),
        );
        let poller_task = tokio::spawn(poller.run(poll_rx));

        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            api: self.api.clone(),
            auth: self.auth.clone(),
            limiter: self.limiter.clone(),
            poll_requests: poll_tx,
            events: event_tx.clone(),
            cancel: self.cancel.clone(),
            max_requeue: self.config.max_requeue_per_file,
            fatal: fatal.clone(),
        });

        let pool_size = self.config.max_concurrent.min(candidates.len()).max(1);
        let workers: Vec<_> = (0..pool_size)
            .map(|index| tokio::spawn(run_worker(ctx.clone(), index)))
            .collect();

        tokio::select! {
            _ = queue.join() => {}
            _ = self.cancel.cancelled() => {
                log::warn!("Run interrupted; draining in-flight work before reporting");
            }
        }

        // Stop the pool; in-flight attempts finish on their own.
        self.cancel.cancel();
        for handle in workers {
            let _ = handle.await;
        }

        // Dropping the last poll sender lets the poller drain and exit;
        // entries already accepted by the server are never abandoned.
        drop(ctx);
        let _ = poller_task.await;

        drop(event_tx);
        let summary = match finalizer.await {
            Ok(summary) => summary,
            Err(e) => {
                log::error!("Finalizer task failed: {e}");
                RunSummary::new(run_id, candidates.len())
            }
        };

        let usage = self.limiter.usage().await;
        log::info!(
            "API usage after run: {}/{} in window, {}/{} today",
            usage.window_used,
            usage.window_limit,
            usage.daily_used,
            usage.daily_limit
        );

        report::print_summary(&summary);
        if let Some(history) = &self.config.history_file {
            if let Err(e) = report::append_history(history, &summary) {
                log::error!("Failed to write after-action report: {e}");
            } else {
                println!("After-action report appended to: {}", history.display());
            }
        }

        let fatal_error = fatal.lock().ok().and_then(|mut slot| slot.take());
        match fatal_error {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }
}
