//! In-process store.
//!
//! Transactions are serialized: `begin` waits for the previous transaction
//! to finish and works on a copy of the state that `commit` writes back.
//! A task must not hold two transactions at once.

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::concurrency;
use gantry_core::ids::*;
use gantry_core::job::{JobColumn, JobGuard, RunJob};
use gantry_core::ports::{Store, Transaction};
use gantry_core::run::{Run, RunColumn, RunFilter};
use gantry_core::task::{RunnerScope, Task, TaskColumn, TaskOutput, TaskStep};
use gantry_core::trust::TrustGrant;
use gantry_core::{Error, Result, Status};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Everything the memory store holds.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub runs: BTreeMap<RunId, Run>,
    pub jobs: BTreeMap<JobId, RunJob>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub task_steps: Vec<TaskStep>,
    pub task_outputs: Vec<TaskOutput>,
    pub trust_grants: HashMap<(UserId, RepoId), TrustGrant>,
    sequence: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }

    /// Jobs of a run, ordered by id.
    pub fn jobs_of(&self, run_id: RunId) -> Vec<&RunJob> {
        self.jobs.values().filter(|j| j.run_id == run_id).collect()
    }

    pub fn job_named(&self, run_id: RunId, name: &str) -> Option<&RunJob> {
        self.jobs
            .values()
            .find(|j| j.run_id == run_id && j.name == name)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let committed = self.state.clone().lock_owned().await;
        let working = committed.clone();
        Ok(Box::new(MemoryTransaction { committed, working }))
    }
}

struct MemoryTransaction {
    committed: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_run(&mut self, id: RunId) -> Result<Option<Run>> {
        Ok(self.working.runs.get(&id).cloned())
    }

    async fn insert_run(&mut self, run: &mut Run) -> Result<RunId> {
        let state = &mut self.working;
        run.id = RunId::new(state.next_id());
        if run.index == 0 {
            run.index = state
                .runs
                .values()
                .filter(|r| r.repo_id == run.repo_id)
                .map(|r| r.index)
                .max()
                .unwrap_or(0)
                + 1;
        }
        let now = Utc::now();
        run.created = now;
        run.updated = now;
        state.runs.insert(run.id, run.clone());
        Ok(run.id)
    }

    async fn update_run(&mut self, run: &Run, columns: &[RunColumn]) -> Result<u64> {
        let Some(stored) = self.working.runs.get_mut(&run.id) else {
            return Ok(0);
        };
        for column in columns {
            match column {
                RunColumn::Status => stored.status = run.status,
                RunColumn::Started => stored.started = run.started,
                RunColumn::Stopped => stored.stopped = run.stopped,
                RunColumn::PreExecutionError => {
                    stored.pre_execution_error = run.pre_execution_error.clone()
                }
                RunColumn::Approval => {
                    stored.need_approval = run.need_approval;
                    stored.approved_by = run.approved_by;
                }
            }
        }
        stored.updated = Utc::now();
        Ok(1)
    }

    async fn find_runs(&mut self, filter: &RunFilter) -> Result<Vec<Run>> {
        Ok(self
            .working
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_job(&mut self, id: JobId) -> Result<Option<RunJob>> {
        Ok(self.working.jobs.get(&id).cloned())
    }

    async fn list_jobs(&mut self, run_id: RunId) -> Result<Vec<RunJob>> {
        Ok(self.working.jobs_of(run_id).into_iter().cloned().collect())
    }

    async fn insert_job(&mut self, job: &mut RunJob) -> Result<JobId> {
        job.id = JobId::new(self.working.next_id());
        let now = Utc::now();
        job.created = now;
        job.updated = now;
        self.working.jobs.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn update_job(
        &mut self,
        job: &RunJob,
        columns: &[JobColumn],
        guard: JobGuard,
    ) -> Result<u64> {
        let Some(stored) = self.working.jobs.get_mut(&job.id) else {
            return Ok(0);
        };
        if !guard.admits(stored) {
            return Ok(0);
        }
        for column in columns {
            match column {
                JobColumn::Status => stored.status = job.status,
                JobColumn::Attempt => stored.attempt = job.attempt,
                JobColumn::TaskId => stored.task_id = job.task_id,
                JobColumn::Started => stored.started = job.started,
                JobColumn::Stopped => stored.stopped = job.stopped,
            }
        }
        stored.updated = Utc::now();
        Ok(1)
    }

    async fn delete_job(&mut self, id: JobId) -> Result<u64> {
        Ok(self.working.jobs.remove(&id).map_or(0, |_| 1))
    }

    async fn list_available_jobs(
        &mut self,
        scope: RunnerScope,
        queue_behind: bool,
    ) -> Result<Vec<RunJob>> {
        let state = &self.working;
        let mut jobs: Vec<RunJob> = state
            .jobs
            .values()
            .filter(|j| j.status == Status::Waiting && j.task_id.is_none())
            .filter(|j| scope.covers(j.repo_id, j.owner_id))
            .filter(|j| {
                !queue_behind
                    || state
                        .runs
                        .get(&j.run_id)
                        .is_none_or(|run| concurrency::is_admitted(run, state.runs.values()))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.updated.cmp(&b.updated).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn get_task(&mut self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.working.tasks.get(&id).cloned())
    }

    async fn insert_task(&mut self, task: &mut Task) -> Result<TaskId> {
        let duplicate = self
            .working
            .tasks
            .values()
            .any(|t| t.job_id == task.job_id && t.attempt == task.attempt);
        if duplicate {
            return Err(Error::Conflict(format!(
                "task for {} attempt {} already exists",
                task.job_id, task.attempt
            )));
        }

        task.id = TaskId::new(self.working.next_id());
        let now = Utc::now();
        task.created = now;
        task.updated = now;
        let mut stored = task.clone();
        stored.token = None;
        self.working.tasks.insert(task.id, stored);
        Ok(task.id)
    }

    async fn update_task(&mut self, task: &Task, columns: &[TaskColumn]) -> Result<u64> {
        let Some(stored) = self.working.tasks.get_mut(&task.id) else {
            return Ok(0);
        };
        for column in columns {
            match column {
                TaskColumn::Status => stored.status = task.status,
                TaskColumn::Stopped => stored.stopped = task.stopped,
                TaskColumn::LogFilename => stored.log_filename = task.log_filename.clone(),
            }
        }
        stored.updated = Utc::now();
        Ok(1)
    }

    async fn find_running_tasks_by_token_suffix(&mut self, last_eight: &str) -> Result<Vec<Task>> {
        Ok(self
            .working
            .tasks
            .values()
            .filter(|t| t.status == Status::Running && t.token_last_eight == last_eight)
            .cloned()
            .collect())
    }

    async fn insert_task_steps(&mut self, steps: &[TaskStep]) -> Result<()> {
        self.working.task_steps.extend_from_slice(steps);
        Ok(())
    }

    async fn insert_task_outputs(&mut self, outputs: &[TaskOutput]) -> Result<()> {
        for output in outputs {
            let exists = self
                .working
                .task_outputs
                .iter()
                .any(|o| o.task_id == output.task_id && o.key == output.key);
            if !exists {
                self.working.task_outputs.push(output.clone());
            }
        }
        Ok(())
    }

    async fn list_task_outputs(&mut self, task_id: TaskId) -> Result<Vec<TaskOutput>> {
        Ok(self
            .working
            .task_outputs
            .iter()
            .filter(|o| o.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_trust_grant(
        &mut self,
        user_id: UserId,
        repo_id: RepoId,
    ) -> Result<Option<TrustGrant>> {
        Ok(self.working.trust_grants.get(&(user_id, repo_id)).cloned())
    }

    async fn upsert_trust_grant(&mut self, grant: &TrustGrant) -> Result<()> {
        self.working
            .trust_grants
            .insert((grant.user_id, grant.repo_id), grant.clone());
        Ok(())
    }

    async fn delete_trust_grant(&mut self, user_id: UserId, repo_id: RepoId) -> Result<u64> {
        Ok(self
            .working
            .trust_grants
            .remove(&(user_id, repo_id))
            .map_or(0, |_| 1))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            mut committed,
            working,
        } = *self;
        *committed = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::run::ConcurrencyType;
    use pretty_assertions::assert_eq;

    fn run(repo: i64, group: &str, status: Status) -> Run {
        Run {
            repo_id: RepoId::new(repo),
            owner_id: OwnerId::new(1),
            workflow_id: "ci.yml".into(),
            concurrency_group: group.into(),
            concurrency_type: ConcurrencyType::QueueBehind,
            status,
            ..Default::default()
        }
    }

    fn job(run: &Run, name: &str, status: Status) -> RunJob {
        let mut job = RunJob::default();
        job.run_id = run.id;
        job.repo_id = run.repo_id;
        job.owner_id = run.owner_id;
        job.name = name.into();
        job.job_id = name.into();
        job.status = status;
        job
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_changes() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_run(&mut run(1, "", Status::Waiting)).await.unwrap();
        drop(tx);

        assert!(store.snapshot().await.runs.is_empty());
    }

    #[tokio::test]
    async fn test_run_index_is_per_repository() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let mut a = run(1, "", Status::Waiting);
        let mut b = run(1, "", Status::Waiting);
        let mut c = run(2, "", Status::Waiting);
        tx.insert_run(&mut a).await.unwrap();
        tx.insert_run(&mut b).await.unwrap();
        tx.insert_run(&mut c).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!((a.index, b.index, c.index), (1, 2, 1));
    }

    #[tokio::test]
    async fn test_guarded_job_update() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let mut r = run(1, "", Status::Waiting);
        tx.insert_run(&mut r).await.unwrap();
        let mut j = job(&r, "build", Status::Waiting);
        tx.insert_job(&mut j).await.unwrap();

        j.status = Status::Cancelled;
        let affected = tx
            .update_job(&j, &[JobColumn::Status], JobGuard::Status(Status::Running))
            .await
            .unwrap();
        assert_eq!(affected, 0);

        j.task_id = Some(TaskId::new(99));
        let affected = tx
            .update_job(&j, &[JobColumn::TaskId], JobGuard::Unassigned)
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let affected = tx
            .update_job(&j, &[JobColumn::TaskId], JobGuard::Unassigned)
            .await
            .unwrap();
        assert_eq!(affected, 0);

        let stored = tx.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Waiting);
        assert_eq!(stored.task_id, Some(TaskId::new(99)));
    }

    #[tokio::test]
    async fn test_available_jobs_respect_queue_behind() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let mut older = run(1, "deploy", Status::Waiting);
        let mut newer = run(1, "deploy", Status::Waiting);
        tx.insert_run(&mut older).await.unwrap();
        tx.insert_run(&mut newer).await.unwrap();
        let mut first = job(&older, "a", Status::Waiting);
        let mut second = job(&newer, "b", Status::Waiting);
        tx.insert_job(&mut first).await.unwrap();
        tx.insert_job(&mut second).await.unwrap();

        let names = |jobs: Vec<RunJob>| jobs.into_iter().map(|j| j.name).collect::<Vec<_>>();

        let queued = tx
            .list_available_jobs(RunnerScope::Global, true)
            .await
            .unwrap();
        assert_eq!(names(queued), vec!["a"]);

        let all = tx
            .list_available_jobs(RunnerScope::Global, false)
            .await
            .unwrap();
        assert_eq!(names(all), vec!["a", "b"]);

        let other_repo = tx
            .list_available_jobs(RunnerScope::Repository(RepoId::new(2)), false)
            .await
            .unwrap();
        assert!(other_repo.is_empty());
    }

    #[tokio::test]
    async fn test_second_task_for_same_attempt_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let mut task = Task {
            job_id: JobId::new(7),
            attempt: 1,
            ..Default::default()
        };
        tx.insert_task(&mut task).await.unwrap();

        let mut again = Task {
            job_id: JobId::new(7),
            attempt: 1,
            ..Default::default()
        };
        let err = tx.insert_task(&mut again).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_task_outputs_keep_first_value() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let output = |value: &str| TaskOutput {
            task_id: TaskId::new(1),
            key: "version".into(),
            value: value.into(),
        };

        tx.insert_task_outputs(&[output("1.0")]).await.unwrap();
        tx.insert_task_outputs(&[output("2.0")]).await.unwrap();

        let outputs = tx.list_task_outputs(TaskId::new(1)).await.unwrap();
        assert_eq!(outputs, vec![output("1.0")]);
    }
}
