//! Workflow runs and their trigger context.

use crate::ids::{OwnerId, PullRequestId, RepoId, RunId, UserId};
use crate::preexec::PreExecutionError;
use crate::status::Status;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One triggered execution of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    /// Monotonic per-repository index, assigned on insert.
    pub index: i64,
    pub title: String,
    /// Workflow file name, for example `ci.yml`.
    pub workflow_id: String,
    pub trigger_user_id: UserId,
    pub git_ref: String,
    pub commit_sha: String,
    pub event: TriggerEvent,
    pub is_fork_pull_request: bool,
    pub pull_request_id: Option<PullRequestId>,
    pub pull_request_poster_id: Option<UserId>,
    pub need_approval: bool,
    pub approved_by: Option<UserId>,
    pub concurrency_group: String,
    pub concurrency_type: ConcurrencyType,
    pub status: Status,
    pub pre_execution_error: Option<PreExecutionError>,
    /// Unset until the aggregate status first becomes `Running`.
    pub started: Option<DateTime<Utc>>,
    /// Unset until the aggregate status first becomes done.
    pub stopped: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Run {
    /// Derive the group used when the workflow does not declare one.
    pub fn default_concurrency_group(&self) -> String {
        format!(
            "{}_{}_{}__auto",
            self.git_ref, self.workflow_id, self.event
        )
        .to_lowercase()
    }

    /// Set an explicit concurrency group; group names are case-insensitive.
    pub fn set_concurrency_group(&mut self, group: &str) {
        self.concurrency_group = group.to_lowercase();
    }

    pub fn set_default_concurrency_group(&mut self) {
        self.concurrency_group = self.default_concurrency_group();
    }
}

/// Columns of a run that can be updated selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunColumn {
    Status,
    Started,
    Stopped,
    PreExecutionError,
    Approval,
}

/// Filter for run lookups. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub repo_id: Option<RepoId>,
    pub concurrency_group: Option<String>,
    pub pull_request_id: Option<PullRequestId>,
    pub pull_request_poster_id: Option<UserId>,
    pub need_approval: Option<bool>,
    pub statuses: Vec<Status>,
}

impl RunFilter {
    pub fn repo(repo_id: RepoId) -> Self {
        Self {
            repo_id: Some(repo_id),
            ..Default::default()
        }
    }

    pub fn not_done(mut self) -> Self {
        self.statuses = Status::NOT_DONE.to_vec();
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.repo_id.is_none_or(|id| run.repo_id == id)
            && self
                .concurrency_group
                .as_ref()
                .is_none_or(|group| &run.concurrency_group == group)
            && self
                .pull_request_id
                .is_none_or(|id| run.pull_request_id == Some(id))
            && self
                .pull_request_poster_id
                .is_none_or(|id| run.pull_request_poster_id == Some(id))
            && self.need_approval.is_none_or(|flag| run.need_approval == flag)
            && (self.statuses.is_empty() || self.statuses.contains(&run.status))
    }
}

/// How runs sharing a concurrency group interact.
///
/// The discriminants are persisted and must not change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyType {
    /// Runs of the group execute side by side.
    #[default]
    Unlimited = 0,
    /// A new run waits for older runs of the group to finish.
    QueueBehind = 1,
    /// A new run cancels the unfinished runs of the group.
    CancelInProgress = 2,
}

impl ConcurrencyType {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn from_i16(code: i16) -> Self {
        match code {
            1 => ConcurrencyType::QueueBehind,
            2 => ConcurrencyType::CancelInProgress,
            _ => ConcurrencyType::Unlimited,
        }
    }
}

/// Event that triggered a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    #[default]
    Push,
    Create,
    Delete,
    Fork,
    PullRequest,
    PullRequestSync,
    PullRequestTarget,
    PullRequestComment,
    PullRequestReviewApproved,
    PullRequestReviewRejected,
    PullRequestReviewComment,
    IssueComment,
    Issues,
    Release,
    Schedule,
    WorkflowDispatch,
    Other(String),
}

impl TriggerEvent {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerEvent::Push => "push",
            TriggerEvent::Create => "create",
            TriggerEvent::Delete => "delete",
            TriggerEvent::Fork => "fork",
            TriggerEvent::PullRequest => "pull_request",
            TriggerEvent::PullRequestSync => "pull_request_sync",
            TriggerEvent::PullRequestTarget => "pull_request_target",
            TriggerEvent::PullRequestComment => "pull_request_comment",
            TriggerEvent::PullRequestReviewApproved => "pull_request_review_approved",
            TriggerEvent::PullRequestReviewRejected => "pull_request_review_rejected",
            TriggerEvent::PullRequestReviewComment => "pull_request_review_comment",
            TriggerEvent::IssueComment => "issue_comment",
            TriggerEvent::Issues => "issues",
            TriggerEvent::Release => "release",
            TriggerEvent::Schedule => "schedule",
            TriggerEvent::WorkflowDispatch => "workflow_dispatch",
            TriggerEvent::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "push" => TriggerEvent::Push,
            "create" => TriggerEvent::Create,
            "delete" => TriggerEvent::Delete,
            "fork" => TriggerEvent::Fork,
            "pull_request" => TriggerEvent::PullRequest,
            "pull_request_sync" => TriggerEvent::PullRequestSync,
            "pull_request_target" => TriggerEvent::PullRequestTarget,
            "pull_request_comment" => TriggerEvent::PullRequestComment,
            "pull_request_review_approved" => TriggerEvent::PullRequestReviewApproved,
            "pull_request_review_rejected" => TriggerEvent::PullRequestReviewRejected,
            "pull_request_review_comment" => TriggerEvent::PullRequestReviewComment,
            "issue_comment" => TriggerEvent::IssueComment,
            "issues" => TriggerEvent::Issues,
            "release" => TriggerEvent::Release,
            "schedule" => TriggerEvent::Schedule,
            "workflow_dispatch" => TriggerEvent::WorkflowDispatch,
            other => TriggerEvent::Other(other.to_string()),
        }
    }

    /// Events whose workflows are always read from the default branch, even
    /// when they relate to a pull request.
    pub fn is_default_branch_workflow(&self) -> bool {
        matches!(
            self,
            TriggerEvent::Create
                | TriggerEvent::Delete
                | TriggerEvent::Fork
                | TriggerEvent::PullRequestComment
                | TriggerEvent::PullRequestReviewApproved
                | TriggerEvent::PullRequestReviewRejected
                | TriggerEvent::PullRequestReviewComment
                | TriggerEvent::IssueComment
                | TriggerEvent::Issues
                | TriggerEvent::Release
                | TriggerEvent::Schedule
        )
    }

    /// Events that cancel in-progress runs of their group when the workflow
    /// does not say otherwise.
    pub fn cancels_in_progress_by_default(&self) -> bool {
        matches!(self, TriggerEvent::Push | TriggerEvent::PullRequestSync)
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
