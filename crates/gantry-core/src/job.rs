//! Jobs of a run.

use crate::ids::{JobId, OwnerId, RepoId, RunId, TaskId};
use crate::status::Status;
use crate::workflow::{IncompleteMatrix, IncompleteNeeds, SingleWorkflow};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// One node of a run's dependency graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunJob {
    pub id: JobId,
    pub run_id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub commit_sha: String,
    pub is_fork_pull_request: bool,
    pub name: String,
    pub attempt: i64,
    /// Stored single-job workflow fragment.
    pub workflow_payload: Vec<u8>,
    /// Workflow-local identifier. Expanded siblings and reruns share it, so
    /// it does not identify a row.
    pub job_id: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    /// Unset until a task is created for the current attempt.
    pub task_id: Option<TaskId>,
    pub status: Status,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    #[serde(skip)]
    decoded: OnceLock<SingleWorkflow>,
}

/// Columns of a job that can be updated selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobColumn {
    Status,
    Attempt,
    TaskId,
    Started,
    Stopped,
}

impl JobColumn {
    pub const ALL: [JobColumn; 5] = [
        JobColumn::Status,
        JobColumn::Attempt,
        JobColumn::TaskId,
        JobColumn::Started,
        JobColumn::Stopped,
    ];
}

/// Precondition attached to a job update; the update affects no row when
/// it does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobGuard {
    None,
    /// The stored status equals the given one.
    Status(Status),
    /// No task is assigned yet.
    Unassigned,
}

impl JobGuard {
    pub fn admits(&self, stored: &RunJob) -> bool {
        match self {
            JobGuard::None => true,
            JobGuard::Status(status) => stored.status == *status,
            JobGuard::Unassigned => stored.task_id.is_none(),
        }
    }
}

impl RunJob {
    /// Decode the stored fragment, reusing the cached value when present.
    pub fn decode_workflow_payload(&self) -> Result<&SingleWorkflow> {
        if let Some(workflow) = self.decoded.get() {
            return Ok(workflow);
        }
        let workflow = SingleWorkflow::from_yaml(&self.workflow_payload)?;
        Ok(self.decoded.get_or_init(|| workflow))
    }

    /// Drop the cached decoded fragment. Must be called after changing
    /// `workflow_payload`.
    pub fn clear_cached_workflow_payload(&mut self) {
        self.decoded = OnceLock::new();
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }

    /// Whether the matrix still depends on unavailable outputs.
    pub fn has_incomplete_matrix(&self) -> Result<(bool, Option<&IncompleteNeeds>)> {
        let workflow = self.decode_workflow_payload()?;
        Ok((
            workflow.incomplete_matrix,
            workflow.incomplete_matrix_needs.as_ref(),
        ))
    }

    /// Whether `runs-on` still depends on unavailable values.
    pub fn has_incomplete_runs_on(
        &self,
    ) -> Result<(bool, Option<&IncompleteNeeds>, Option<&IncompleteMatrix>)> {
        let workflow = self.decode_workflow_payload()?;
        Ok((
            workflow.incomplete_runs_on,
            workflow.incomplete_runs_on_needs.as_ref(),
            workflow.incomplete_runs_on_matrix.as_ref(),
        ))
    }

    /// Whether `with` still depends on unavailable values.
    pub fn has_incomplete_with(
        &self,
    ) -> Result<(bool, Option<&IncompleteNeeds>, Option<&IncompleteMatrix>)> {
        let workflow = self.decode_workflow_payload()?;
        Ok((
            workflow.incomplete_with,
            workflow.incomplete_with_needs.as_ref(),
            workflow.incomplete_with_matrix.as_ref(),
        ))
    }

    /// Whether the job declares an `if` condition.
    pub fn has_if_condition(&self) -> Result<bool> {
        let workflow = self.decode_workflow_payload()?;
        Ok(workflow
            .job()
            .is_some_and(|(_, job)| !job.if_condition.trim().is_empty()))
    }

    /// Whether the job stands for a reusable workflow call and is settled
    /// from its inner jobs instead of running.
    pub fn is_workflow_call_outer_job(&self) -> Result<bool> {
        Ok(self.decode_workflow_payload()?.is_workflow_call_outer())
    }

    /// Whether the job was expanded from a reusable workflow call.
    pub fn is_workflow_call_inner_job(&self) -> Result<bool> {
        let workflow = self.decode_workflow_payload()?;
        Ok(workflow
            .job()
            .and_then(|(_, job)| job.workflow_call.as_ref())
            .is_some_and(|call| !call.parent.is_empty()))
    }

    /// Whether a runner with `labels` can execute this job: every required
    /// label must be present. A job without requirements only runs on a
    /// runner without labels.
    pub fn runs_on(&self, labels: &[String]) -> bool {
        if self.runs_on.is_empty() {
            return labels.is_empty();
        }
        let offered: HashSet<&str> = labels.iter().map(String::as_str).collect();
        self.runs_on.iter().all(|label| offered.contains(label.as_str()))
    }
}
