//! Commit-status reporting.

use crate::cache::BoundedCache;
use async_trait::async_trait;
use gantry_core::job::RunJob;
use gantry_core::ports::{CommitState, CommitStatus, CommitStatusSink, Store};
use gantry_core::run::Run;
use gantry_core::{Error, Result, RunId, Status};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Publishes one commit status per job of a run, skipping statuses whose
/// content was already sent.
pub struct CommitStatusReporter {
    sink: Arc<dyn CommitStatusSink>,
    sent: Mutex<BoundedCache<String, ()>>,
}

impl CommitStatusReporter {
    pub fn new(sink: Arc<dyn CommitStatusSink>, capacity: usize) -> Self {
        Self {
            sink,
            sent: Mutex::new(BoundedCache::new(capacity)),
        }
    }

    /// Report the current state of every job of `run`. Delivery failures are
    /// logged and do not fail the caller.
    pub async fn report(&self, run: &Run, jobs: &[RunJob]) {
        for job in jobs {
            let status = commit_status(run, job);
            let key = content_hash(&status);
            if self.sent.lock().await.contains(&key) {
                continue;
            }

            match self.sink.publish(&status).await {
                Ok(()) => self.sent.lock().await.insert(key, ()),
                Err(e) => warn!(
                    run_id = %run.id,
                    job_id = %job.id,
                    error = %e,
                    "Failed to publish commit status"
                ),
            }
        }
    }

    /// Load `run_id` with its jobs in a fresh transaction and report them.
    pub async fn report_run(&self, store: &dyn Store, run_id: RunId) {
        if let Err(e) = self.try_report_run(store, run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to load run for commit status");
        }
    }

    async fn try_report_run(&self, store: &dyn Store, run_id: RunId) -> Result<()> {
        let mut tx = store.begin().await?;
        let run = tx
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        let jobs = tx.list_jobs(run_id).await?;
        drop(tx);

        self.report(&run, &jobs).await;
        Ok(())
    }
}

/// Commit status for one job.
pub fn commit_status(run: &Run, job: &RunJob) -> CommitStatus {
    CommitStatus {
        repo_id: run.repo_id,
        commit_sha: run.commit_sha.clone(),
        context: format!("{} / {} ({})", run.workflow_id, job.name, run.event),
        state: commit_state(job.status),
        description: describe(job.status).to_string(),
    }
}

pub fn commit_state(status: Status) -> CommitState {
    match status {
        Status::Success | Status::Skipped => CommitState::Success,
        Status::Failure => CommitState::Failure,
        Status::Cancelled => CommitState::Error,
        Status::Waiting | Status::Blocked | Status::Running => CommitState::Pending,
        Status::Unknown => CommitState::Warning,
    }
}

fn describe(status: Status) -> &'static str {
    match status {
        Status::Success => "Successful",
        Status::Skipped => "Has been skipped",
        Status::Failure => "Failing after running",
        Status::Cancelled => "Has been cancelled",
        Status::Waiting => "Waiting to run",
        Status::Blocked => "Blocked by required conditions",
        Status::Running => "In progress",
        Status::Unknown => "Unknown status",
    }
}

fn content_hash(status: &CommitStatus) -> String {
    let mut hasher = Sha256::new();
    hasher.update(status.repo_id.get().to_be_bytes());
    hasher.update(status.commit_sha.as_bytes());
    hasher.update([0]);
    hasher.update(status.context.as_bytes());
    hasher.update([0]);
    hasher.update(format!("{:?}", status.state).as_bytes());
    hex::encode(hasher.finalize())
}

/// Sink that writes commit statuses to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl CommitStatusSink for TracingSink {
    async fn publish(&self, status: &CommitStatus) -> Result<()> {
        info!(
            repo_id = %status.repo_id,
            commit = %status.commit_sha,
            context = %status.context,
            state = ?status.state,
            "Commit status"
        );
        debug!(description = %status.description, "Commit status description");
        Ok(())
    }
}
