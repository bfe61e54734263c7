//! Tasks, their steps and the runners that claim them.

use crate::ids::{JobId, OwnerId, RepoId, RunnerId, TaskId};
use crate::status::Status;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One execution attempt of a job by a runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Equals the job's attempt counter when the task was created.
    pub attempt: i64,
    pub runner_id: RunnerId,
    pub status: Status,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub commit_sha: String,
    pub is_fork_pull_request: bool,

    /// Plaintext token, only populated on the value returned at creation.
    #[serde(skip)]
    pub token: Option<String>,
    pub token_hash: String,
    pub token_salt: String,
    pub token_last_eight: String,

    pub log_filename: String,
    pub log_in_storage: bool,
    pub log_length: i64,
    pub log_size: i64,
    pub log_expired: bool,

    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Columns of a task that can be updated selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskColumn {
    Status,
    Stopped,
    LogFilename,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskStep {
    pub task_id: TaskId,
    pub repo_id: RepoId,
    pub index: i64,
    pub name: String,
    pub status: Status,
}

/// A key/value output reported by a finished task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub key: String,
    pub value: String,
}

/// Which jobs a runner may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunnerScope {
    Repository(RepoId),
    Owner(OwnerId),
    Global,
}

impl RunnerScope {
    pub fn covers(&self, repo_id: RepoId, owner_id: OwnerId) -> bool {
        match self {
            RunnerScope::Repository(id) => *id == repo_id,
            RunnerScope::Owner(id) => *id == owner_id,
            RunnerScope::Global => true,
        }
    }
}

/// A runner asking for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub scope: RunnerScope,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_covers() {
        let repo = RepoId::new(1);
        let owner = OwnerId::new(2);
        assert!(RunnerScope::Global.covers(repo, owner));
        assert!(RunnerScope::Repository(repo).covers(repo, owner));
        assert!(!RunnerScope::Repository(RepoId::new(9)).covers(repo, owner));
        assert!(RunnerScope::Owner(owner).covers(repo, owner));
        assert!(!RunnerScope::Owner(OwnerId::new(9)).covers(repo, owner));
    }
}
