use std::path::{Path, PathBuf};

use crate::api::UploadStatus;

/// Lifecycle of one candidate file as it moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Uploading,
    AwaitingStatus,
    Succeeded,
    Duplicate,
    Failed,
}

/// One candidate file. Owned by a single worker at a time; requeueing
/// hands ownership back to the pool, a 201 hands it to the poller.
#[derive(Debug)]
pub struct UploadJob {
    pub path: PathBuf,
    pub state: JobState,
    /// Times this job went back to the queue after a 429.
    pub retries: u32,
    pub last_http_status: Option<u16>,
    /// Whether the single 401 refresh-and-retry has been spent.
    pub auth_retried: bool,
}

impl UploadJob {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: JobState::Pending,
            retries: 0,
            last_http_status: None,
            auth_retried: false,
        }
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/// Terminal fate of a job. The finalizer turns this into the matching
/// file disposition: delete, quarantine, or leave alone.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Activity created; the local file is deleted.
    Success {
        upload_id: Option<i64>,
        activity_id: i64,
    },
    /// Already on the server; the local file is deleted.
    Duplicate { upload_id: Option<i64> },
    /// Terminal failure; the file moves to quarantine.
    Failed { reason: String },
    /// Requeue ceiling reached under sustained rate pressure; quarantined.
    RateLimitExhausted,
    /// File vanished before upload; nothing to do.
    Skipped,
}

impl Disposition {
    /// Classify a terminal status body from the server.
    pub fn from_final_status(status: UploadStatus) -> Self {
        if let Some(activity_id) = status.activity_id {
            Disposition::Success {
                upload_id: status.id,
                activity_id,
            }
        } else if status.is_duplicate() {
            Disposition::Duplicate { upload_id: status.id }
        } else {
            let reason = status
                .error
                .or(status.status)
                .unwrap_or_else(|| "unknown".to_string());
            Disposition::Failed { reason }
        }
    }
}

/// Events the workers and poller emit toward the finalizer, which owns
/// all file dispositions and the run summary.
#[derive(Debug)]
pub enum JobEvent {
    /// A job reached a terminal state.
    Completed {
        job: UploadJob,
        disposition: Disposition,
    },
    /// A rate-limited job went back to the queue.
    Requeued { file: PathBuf },
}
