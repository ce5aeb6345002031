use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::AppResult;
use crate::scan::FAILED_DIR;

use super::job::{file_name_of, Disposition, JobEvent, UploadJob};

/// Aggregate outcome of one run plus its per-file records. Append-only;
/// built incrementally as jobs finalize.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total: usize,
    pub success: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub retries: usize,
    pub processed: Vec<FileOutcome>,
}

#[derive(Debug, Serialize)]
pub struct FileOutcome {
    pub file: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, total: usize) -> Self {
        Self {
            run_id,
            total,
            success: 0,
            duplicate: 0,
            failed: 0,
            retries: 0,
            processed: Vec::new(),
        }
    }

    fn record(
        &mut self,
        job: &UploadJob,
        status: &str,
        upload_id: Option<i64>,
        activity_id: Option<i64>,
        reason: Option<String>,
    ) {
        self.processed.push(FileOutcome {
            file: job.path.display().to_string(),
            status: status.to_string(),
            upload_id,
            activity_id,
            reason,
        });
    }
}

/// Consume job events until every sender is gone, applying each terminal
/// disposition to the file system and the summary. This is the only place
/// files are deleted or quarantined.
pub async fn collect_outcomes(
    mut events: mpsc::UnboundedReceiver<JobEvent>,
    working_dir: PathBuf,
    total: usize,
    run_id: Uuid,
) -> RunSummary {
    let mut summary = RunSummary::new(run_id, total);

    while let Some(event) = events.recv().await {
        match event {
            JobEvent::Requeued { file } => {
                log::debug!("Retry recorded for {}", file_name_of(&file));
                summary.retries += 1;
            }
            JobEvent::Completed { job, disposition } => {
                apply_disposition(&mut summary, &working_dir, job, disposition).await;
            }
        }
    }

    summary
}

async fn apply_disposition(
    summary: &mut RunSummary,
    working_dir: &Path,
    job: UploadJob,
    disposition: Disposition,
) {
    let file_name = job.file_name();
    match disposition {
        Disposition::Success {
            upload_id,
            activity_id,
        } => {
            log::info!(
                "Upload successful: {file_name} -> activity_id={activity_id}, upload_id={upload_id:?}"
            );
            remove_quietly(&job.path).await;
            summary.success += 1;
            summary.record(&job, "created", upload_id, Some(activity_id), None);
        }
        Disposition::Duplicate { upload_id } => {
            log::info!("Duplicate detected: {file_name} (upload_id={upload_id:?})");
            remove_quietly(&job.path).await;
            summary.duplicate += 1;
            summary.record(&job, "duplicate", upload_id, None, None);
        }
        Disposition::Failed { reason } => {
            match job.last_http_status {
                Some(code) => {
                    log::info!("Upload failed: {file_name} | HTTP {code} | Status: {reason}")
                }
                None => log::info!("Upload failed: {file_name} | Status: {reason}"),
            }
            move_to_failed(working_dir, &job.path).await;
            summary.failed += 1;
            summary.record(&job, "failed", None, None, Some(reason));
        }
        Disposition::RateLimitExhausted => {
            log::warn!("Giving up on {file_name} after repeated rate limiting");
            move_to_failed(working_dir, &job.path).await;
            summary.failed += 1;
            summary.record(&job, "rate_limit_exhausted", None, None, None);
        }
        Disposition::Skipped => {
            summary.record(&job, "missing", None, None, None);
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::debug!("Could not delete {}: {}", path.display(), e),
    }
}

/// Move a terminally failed file into the quarantine folder. Tolerates
/// files that vanished in the meantime.
async fn move_to_failed(working_dir: &Path, path: &Path) {
    let failed_dir = working_dir.join(FAILED_DIR);
    if let Err(e) = tokio::fs::create_dir_all(&failed_dir).await {
        log::warn!("Could not create {}: {}", failed_dir.display(), e);
        return;
    }
    let dest = failed_dir.join(file_name_of(path));
    match tokio::fs::rename(path, &dest).await {
        Ok(()) => log::debug!("Moved failed file to {}", dest.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::debug!("Could not move {} to quarantine: {}", path.display(), e),
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!("\n--- Upload Report ---");
    println!("  Total files to process: {}", summary.total);
    println!("  Successfully uploaded: {}", summary.success);
    println!("  Duplicates (already on Strava): {}", summary.duplicate);
    println!("  Failed uploads: {}", summary.failed);
    if summary.retries > 0 {
        println!("  Files re-queued due to rate limits: {}", summary.retries);
    }
    println!("---------------------\n");
}

/// Append this run to the history file, starting a fresh array when the
/// file is missing or unreadable. Never fatal.
pub fn append_history(path: &Path, summary: &RunSummary) -> AppResult<()> {
    let mut history: Vec<serde_json::Value> = match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    };

    history.push(serde_json::json!({
        "run_id": summary.run_id,
        "timestamp": Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        "summary": {
            "total": summary.total,
            "success": summary.success,
            "duplicate": summary.duplicate,
            "failed": summary.failed,
            "retries": summary.retries,
        },
        "processed": summary.processed,
    }));

    std::fs::write(path, serde_json::to_string_pretty(&history)?)?;
    Ok(())
}
