//! PostgreSQL implementation of the store transaction.

use crate::repositories::{db_err, job, run, task, trust};
use async_trait::async_trait;
use gantry_core::ids::*;
use gantry_core::job::{JobColumn, JobGuard, RunJob};
use gantry_core::ports::Transaction;
use gantry_core::run::{Run, RunColumn, RunFilter};
use gantry_core::task::{RunnerScope, Task, TaskColumn, TaskOutput, TaskStep};
use gantry_core::trust::TrustGrant;
use gantry_core::Result;
use sqlx::Postgres;

/// An open PostgreSQL transaction. Dropping it rolls back.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get_run(&mut self, id: RunId) -> Result<Option<Run>> {
        run::get(&mut *self.tx, id).await
    }

    async fn insert_run(&mut self, r: &mut Run) -> Result<RunId> {
        run::insert(&mut *self.tx, r).await
    }

    async fn update_run(&mut self, r: &Run, columns: &[RunColumn]) -> Result<u64> {
        run::update(&mut *self.tx, r, columns).await
    }

    async fn find_runs(&mut self, filter: &RunFilter) -> Result<Vec<Run>> {
        run::find(&mut *self.tx, filter).await
    }

    async fn get_job(&mut self, id: JobId) -> Result<Option<RunJob>> {
        job::get(&mut *self.tx, id).await
    }

    async fn list_jobs(&mut self, run_id: RunId) -> Result<Vec<RunJob>> {
        job::list_by_run(&mut *self.tx, run_id).await
    }

    async fn insert_job(&mut self, j: &mut RunJob) -> Result<JobId> {
        job::insert(&mut *self.tx, j).await
    }

    async fn update_job(
        &mut self,
        j: &RunJob,
        columns: &[JobColumn],
        guard: JobGuard,
    ) -> Result<u64> {
        job::update(&mut *self.tx, j, columns, guard).await
    }

    async fn delete_job(&mut self, id: JobId) -> Result<u64> {
        job::delete(&mut *self.tx, id).await
    }

    async fn list_available_jobs(
        &mut self,
        scope: RunnerScope,
        queue_behind: bool,
    ) -> Result<Vec<RunJob>> {
        job::list_available(&mut *self.tx, scope, queue_behind).await
    }

    async fn get_task(&mut self, id: TaskId) -> Result<Option<Task>> {
        task::get(&mut *self.tx, id).await
    }

    async fn insert_task(&mut self, t: &mut Task) -> Result<TaskId> {
        task::insert(&mut *self.tx, t).await
    }

    async fn update_task(&mut self, t: &Task, columns: &[TaskColumn]) -> Result<u64> {
        task::update(&mut *self.tx, t, columns).await
    }

    async fn find_running_tasks_by_token_suffix(&mut self, last_eight: &str) -> Result<Vec<Task>> {
        task::find_running_by_token_suffix(&mut *self.tx, last_eight).await
    }

    async fn insert_task_steps(&mut self, steps: &[TaskStep]) -> Result<()> {
        task::insert_steps(&mut *self.tx, steps).await
    }

    async fn insert_task_outputs(&mut self, outputs: &[TaskOutput]) -> Result<()> {
        task::insert_outputs(&mut *self.tx, outputs).await
    }

    async fn list_task_outputs(&mut self, task_id: TaskId) -> Result<Vec<TaskOutput>> {
        task::list_outputs(&mut *self.tx, task_id).await
    }

    async fn get_trust_grant(
        &mut self,
        user_id: UserId,
        repo_id: RepoId,
    ) -> Result<Option<TrustGrant>> {
        trust::get(&mut *self.tx, user_id, repo_id).await
    }

    async fn upsert_trust_grant(&mut self, grant: &TrustGrant) -> Result<()> {
        trust::upsert(&mut *self.tx, grant).await
    }

    async fn delete_trust_grant(&mut self, user_id: UserId, repo_id: RepoId) -> Result<u64> {
        trust::delete(&mut *self.tx, user_id, repo_id).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }
}
