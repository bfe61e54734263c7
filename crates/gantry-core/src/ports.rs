//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration services and
//! external adapters: persistence, workflow parsing, permissions and
//! notification delivery.

use crate::ids::*;
use crate::job::{JobColumn, JobGuard, RunJob};
use crate::run::{Run, RunColumn, RunFilter};
use crate::task::{RunnerScope, Task, TaskColumn, TaskOutput, TaskStep};
use crate::trust::{Actor, TrustGrant};
use crate::workflow::{ParseOptions, SingleWorkflow};
use crate::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Transactional store for runs, jobs and tasks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a transaction. Dropping it without [`Transaction::commit`]
    /// discards every change made through it.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Operations available inside one store transaction.
///
/// Update and delete operations report the number of affected rows; a
/// guarded update that affects zero rows is an expected outcome, not an
/// error.
#[async_trait]
pub trait Transaction: Send {
    // Runs

    async fn get_run(&mut self, id: RunId) -> Result<Option<Run>>;

    /// Insert a run, assigning its id and next per-repository index.
    async fn insert_run(&mut self, run: &mut Run) -> Result<RunId>;

    async fn update_run(&mut self, run: &Run, columns: &[RunColumn]) -> Result<u64>;

    /// Runs matching `filter`, ordered by id.
    async fn find_runs(&mut self, filter: &RunFilter) -> Result<Vec<Run>>;

    // Jobs

    async fn get_job(&mut self, id: JobId) -> Result<Option<RunJob>>;

    /// Jobs of a run, ordered by id.
    async fn list_jobs(&mut self, run_id: RunId) -> Result<Vec<RunJob>>;

    /// Insert a job, assigning its id.
    async fn insert_job(&mut self, job: &mut RunJob) -> Result<JobId>;

    async fn update_job(
        &mut self,
        job: &RunJob,
        columns: &[JobColumn],
        guard: JobGuard,
    ) -> Result<u64>;

    async fn delete_job(&mut self, id: JobId) -> Result<u64>;

    /// `Waiting` jobs without a task in runs covered by `scope`, oldest
    /// update first then by id. With `queue_behind` set, jobs of runs held
    /// back by their concurrency group are left out.
    async fn list_available_jobs(
        &mut self,
        scope: RunnerScope,
        queue_behind: bool,
    ) -> Result<Vec<RunJob>>;

    // Tasks

    async fn get_task(&mut self, id: TaskId) -> Result<Option<Task>>;

    /// Insert a task, assigning its id.
    async fn insert_task(&mut self, task: &mut Task) -> Result<TaskId>;

    async fn update_task(&mut self, task: &Task, columns: &[TaskColumn]) -> Result<u64>;

    /// Running tasks whose token ends with `last_eight`.
    async fn find_running_tasks_by_token_suffix(&mut self, last_eight: &str) -> Result<Vec<Task>>;

    async fn insert_task_steps(&mut self, steps: &[TaskStep]) -> Result<()>;

    /// Record outputs reported by a task. A key already stored for the same
    /// task is kept.
    async fn insert_task_outputs(&mut self, outputs: &[TaskOutput]) -> Result<()>;

    /// Outputs of a task, in insertion order.
    async fn list_task_outputs(&mut self, task_id: TaskId) -> Result<Vec<TaskOutput>>;

    // Trust grants

    async fn get_trust_grant(&mut self, user_id: UserId, repo_id: RepoId)
    -> Result<Option<TrustGrant>>;

    /// Insert or replace the grant for its (user, repository) pair.
    async fn upsert_trust_grant(&mut self, grant: &TrustGrant) -> Result<()>;

    async fn delete_trust_grant(&mut self, user_id: UserId, repo_id: RepoId) -> Result<u64>;

    /// Make every change durable.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Re-parses stored workflow fragments.
pub trait WorkflowParser: Send + Sync {
    /// Parse `payload` into single-job workflows, substituting the values in
    /// `options`. Parts that still cannot be evaluated are reported through
    /// the incomplete flags of the returned workflows.
    fn parse(&self, payload: &[u8], options: &ParseOptions) -> Result<Vec<SingleWorkflow>>;
}

/// Repository permission lookups.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Whether `actor` has write access to the CI capability of `repo_id`.
    async fn can_write_actions(&self, repo_id: RepoId, actor: &Actor) -> Result<bool>;

    /// Resolve a user, `None` when the account no longer exists.
    async fn get_user(&self, user_id: UserId) -> Result<Option<Actor>>;
}

/// State published for a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
    Warning,
}

/// A commit status entry for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommitStatus {
    pub repo_id: RepoId,
    pub commit_sha: String,
    pub context: String,
    pub state: CommitState,
    pub description: String,
}

/// Delivers commit statuses to the forge.
#[async_trait]
pub trait CommitStatusSink: Send + Sync {
    async fn publish(&self, status: &CommitStatus) -> Result<()>;
}
