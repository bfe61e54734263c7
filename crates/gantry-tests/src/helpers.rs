//! Store helpers for driving runs from tests.

use chrono::Utc;
use gantry_core::job::{JobColumn, JobGuard, RunJob};
use gantry_core::ports::Store;
use gantry_core::task::{TaskColumn, TaskOutput};
use gantry_core::{JobId, RunId, Status};
use gantry_scheduler::runs::update_run_job;

/// Jobs of `run_id` in insertion order.
pub async fn jobs_of(store: &dyn Store, run_id: RunId) -> anyhow::Result<Vec<RunJob>> {
    let mut tx = store.begin().await?;
    Ok(tx.list_jobs(run_id).await?)
}

/// The job of `run_id` named `name`.
pub async fn job_named(store: &dyn Store, run_id: RunId, name: &str) -> anyhow::Result<RunJob> {
    jobs_of(store, run_id)
        .await?
        .into_iter()
        .find(|j| j.name == name)
        .ok_or_else(|| anyhow::anyhow!("run {run_id} has no job {name}"))
}

/// Finish a dispatched job the way a runner report would: record outputs on
/// its task, then move the task and the job to `status`.
pub async fn finish_job(
    store: &dyn Store,
    job_id: JobId,
    status: Status,
    outputs: &[(&str, &str)],
) -> anyhow::Result<()> {
    let mut tx = store.begin().await?;
    let mut job = tx
        .get_job(job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;
    let task_id = job
        .task_id
        .ok_or_else(|| anyhow::anyhow!("job {job_id} has no task"))?;
    let mut task = tx
        .get_task(task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

    let outputs: Vec<TaskOutput> = outputs
        .iter()
        .map(|(key, value)| TaskOutput {
            task_id,
            key: key.to_string(),
            value: value.to_string(),
        })
        .collect();
    tx.insert_task_outputs(&outputs).await?;

    let now = Utc::now();
    task.status = status;
    task.stopped = Some(now);
    tx.update_task(&task, &[TaskColumn::Status, TaskColumn::Stopped])
        .await?;

    job.status = status;
    job.stopped = Some(now);
    update_run_job(
        tx.as_mut(),
        &job,
        &[JobColumn::Status, JobColumn::Stopped],
        JobGuard::None,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}
