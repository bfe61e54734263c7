//! Results of needed jobs and the settling of reusable workflow calls.

use crate::token::IssuedToken;
use chrono::Utc;
use gantry_core::job::{JobColumn, RunJob};
use gantry_core::ports::Transaction;
use gantry_core::status::aggregate;
use gantry_core::task::{Task, TaskOutput};
use gantry_core::{Result, Status};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// What a dependent job sees of one job in its `needs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskNeed {
    /// Aggregate status of every row sharing the job id.
    pub result: Status,
    pub outputs: HashMap<String, String>,
}

/// Result and outputs of every job named in `job.needs`, keyed by
/// workflow-local job id.
///
/// Outputs of rows sharing a job id are merged, keeping the first non-empty
/// value per key in row order. Rows without a task, or not done yet, add
/// no outputs.
pub async fn find_task_needs(
    tx: &mut dyn Transaction,
    job: &RunJob,
) -> Result<HashMap<String, TaskNeed>> {
    if job.needs.is_empty() {
        return Ok(HashMap::new());
    }

    let mut rows: BTreeMap<String, Vec<RunJob>> = BTreeMap::new();
    for sibling in tx.list_jobs(job.run_id).await? {
        if job.needs.contains(&sibling.job_id) {
            rows.entry(sibling.job_id.clone()).or_default().push(sibling);
        }
    }

    let mut needs = HashMap::with_capacity(rows.len());
    for (job_id, siblings) in rows {
        let mut outputs: HashMap<String, String> = HashMap::new();
        for sibling in &siblings {
            let Some(task_id) = sibling.task_id else {
                continue;
            };
            if !sibling.status.is_done() {
                continue;
            }
            for output in tx.list_task_outputs(task_id).await? {
                let slot = outputs.entry(output.key).or_default();
                if slot.is_empty() {
                    *slot = output.value;
                }
            }
        }
        let result = aggregate(siblings.iter().map(|s| s.status));
        needs.insert(job_id, TaskNeed { result, outputs });
    }
    Ok(needs)
}

/// Finish a reusable workflow call whose inner jobs are done, without
/// dispatching it.
///
/// Bumps the attempt and records a placeholder task in `job.status`
/// carrying the call's evaluated outputs, so jobs needing the call read
/// them like any other job's. Returns the job columns to persist besides
/// the status; none when `job` is not an outer job.
pub async fn complete_outer_job(
    tx: &mut dyn Transaction,
    job: &mut RunJob,
) -> Result<Vec<JobColumn>> {
    if !job.is_workflow_call_outer_job()? {
        return Ok(Vec::new());
    }

    let expressions = job
        .decode_workflow_payload()?
        .job()
        .map(|(_, spec)| spec.outputs.clone())
        .unwrap_or_default();
    let needs = find_task_needs(tx, job).await?;
    let outputs = evaluate_outputs(&expressions, &needs);

    let now = Utc::now();
    job.attempt += 1;
    let mut task = Task {
        job_id: job.id,
        attempt: job.attempt,
        status: job.status,
        repo_id: job.repo_id,
        owner_id: job.owner_id,
        commit_sha: job.commit_sha.clone(),
        is_fork_pull_request: job.is_fork_pull_request,
        started: Some(now),
        stopped: Some(now),
        ..Default::default()
    };
    IssuedToken::generate().apply(&mut task);
    tx.insert_task(&mut task).await?;

    let rows: Vec<TaskOutput> = outputs
        .into_iter()
        .map(|(key, value)| TaskOutput {
            task_id: task.id,
            key,
            value,
        })
        .collect();
    if !rows.is_empty() {
        tx.insert_task_outputs(&rows).await?;
    }
    job.task_id = Some(task.id);

    info!(
        run_id = %job.run_id,
        job_id = %job.id,
        task_id = %task.id,
        status = %job.status,
        outputs = rows.len(),
        "Workflow call completed"
    );
    Ok(vec![JobColumn::TaskId, JobColumn::Attempt])
}

/// Substitute `${{ needs.<job>.outputs.<key> }}` and
/// `${{ needs.<job>.result }}` in each output expression. References to
/// unknown jobs or keys evaluate to an empty string; other expressions are
/// kept as written.
fn evaluate_outputs(
    expressions: &BTreeMap<String, String>,
    needs: &HashMap<String, TaskNeed>,
) -> BTreeMap<String, String> {
    expressions
        .iter()
        .map(|(key, expression)| (key.clone(), interpolate(expression, needs)))
        .collect()
}

fn interpolate(text: &str, needs: &HashMap<String, TaskNeed>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let Some(len) = rest[start..].find(CLOSE) else {
            break;
        };
        let end = start + len + CLOSE.len();
        out.push_str(&rest[..start]);

        let expression = rest[start + OPEN.len()..start + len].trim();
        let parts: Vec<&str> = expression.split('.').collect();
        match parts.as_slice() {
            ["needs", job, "outputs", key] => {
                let value = needs.get(*job).and_then(|n| n.outputs.get(*key));
                out.push_str(value.map(String::as_str).unwrap_or_default());
            }
            ["needs", job, "result"] => {
                out.push_str(needs.get(*job).map(|n| n.result.as_str()).unwrap_or_default());
            }
            _ => out.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}
