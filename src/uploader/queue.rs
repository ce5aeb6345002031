use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use super::job::UploadJob;

struct QueueState {
    jobs: VecDeque<UploadJob>,
    /// Jobs pushed but not yet marked done; includes jobs currently held
    /// by a worker or parked with the status poller's upload stage done.
    outstanding: usize,
}

/// FIFO work queue with outstanding-work accounting. Requeued jobs join
/// the tail and compete fairly with untried ones; `join` resolves only
/// once every pushed job (requeues included) has been marked done.
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                outstanding: 0,
            }),
            available: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub async fn push(&self, job: UploadJob) {
        {
            let mut state = self.state.lock().await;
            state.jobs.push_back(job);
            state.outstanding += 1;
        }
        self.available.notify_one();
    }

    /// Wait for and take the next job.
    pub async fn pop(&self) -> UploadJob {
        loop {
            let notified = self.available.notified();
            if let Some(job) = self.state.lock().await.jobs.pop_front() {
                return job;
            }
            notified.await;
        }
    }

    /// Mark one previously popped job as finished with.
    pub async fn task_done(&self) {
        let drained = {
            let mut state = self.state.lock().await;
            state.outstanding = state.outstanding.saturating_sub(1);
            state.outstanding == 0
        };
        if drained {
            self.idle.notify_waiters();
        }
    }

    /// Wait until every pushed job has been marked done.
    pub async fn join(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().await.outstanding == 0 {
                return;
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}
