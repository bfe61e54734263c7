//! Reruns of finished jobs.

use crate::graph::NeedsGraph;
use crate::runs::{load_run, update_run_job, RunService};
use gantry_core::job::{JobColumn, JobGuard, RunJob};
use gantry_core::ports::Transaction;
use gantry_core::run::RunColumn;
use gantry_core::{Error, JobId, Result, RunId, Status};
use std::collections::BTreeSet;
use tracing::{debug, info};

impl RunService {
    /// Rerun every job of a finished run, or, with `job_id`, that job and
    /// every job needing it directly or transitively.
    pub async fn rerun(&self, run_id: RunId, job_id: Option<JobId>) -> Result<()> {
        let mut tx = self.store().begin().await?;
        let mut run = load_run(tx.as_mut(), run_id).await?;
        let jobs = tx.list_jobs(run_id).await?;

        let targets: Vec<(RunJob, bool)> = match job_id {
            None => jobs
                .into_iter()
                .map(|job| {
                    let blocked = !job.needs.is_empty();
                    (job, blocked)
                })
                .collect(),
            Some(id) => {
                let target = jobs
                    .iter()
                    .find(|j| j.id == id)
                    .ok_or_else(|| Error::JobNotFound(id.to_string()))?
                    .job_id
                    .clone();
                let mut selected: BTreeSet<String> =
                    NeedsGraph::from_jobs(&jobs).dependents(&target);
                selected.insert(target.clone());
                jobs.into_iter()
                    .filter(|j| selected.contains(&j.job_id))
                    .map(|job| {
                        let blocked = job.job_id != target;
                        (job, blocked)
                    })
                    .collect()
            }
        };

        if run.status.is_done() {
            run.started = None;
            run.stopped = None;
            tx.update_run(&run, &[RunColumn::Started, RunColumn::Stopped])
                .await?;
        }

        let mut rerun = 0;
        for (job, blocked) in targets {
            if rerun_job(tx.as_mut(), job, blocked).await? {
                rerun += 1;
            }
        }
        tx.commit().await?;

        info!(run_id = %run_id, jobs = rerun, "Run rerun");
        self.notify([run_id]).await;
        Ok(())
    }
}

/// Reset one finished job for another attempt. Returns whether the job was
/// reset; a job that is not done or changed concurrently is left alone.
async fn rerun_job(tx: &mut dyn Transaction, mut job: RunJob, blocked: bool) -> Result<bool> {
    if !job.status.is_done() {
        return Ok(false);
    }

    let previous = job.status;
    job.task_id = None;
    job.status = if blocked {
        Status::Blocked
    } else {
        Status::Waiting
    };
    job.started = None;
    job.stopped = None;

    let affected = update_run_job(
        tx,
        &job,
        &[
            JobColumn::TaskId,
            JobColumn::Status,
            JobColumn::Started,
            JobColumn::Stopped,
        ],
        JobGuard::Status(previous),
    )
    .await?;
    if affected == 0 {
        debug!(job_id = %job.id, "Job changed before rerun");
    }
    Ok(affected > 0)
}
