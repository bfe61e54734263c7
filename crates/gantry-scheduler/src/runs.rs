//! Run lifecycle: creation, status aggregation, cancellation and approval.
//!
//! The free functions operate inside a caller-owned transaction so that the
//! emitter, dispatcher and trust gate can compose them atomically.
//! [`RunService`] wraps them in their own transaction and reports commit
//! statuses once the transaction is committed.

use crate::concurrency::{
    cancel_previous_with_concurrency_group, configure_run_concurrency, ConcurrencySpec,
};
use crate::graph::NeedsGraph;
use crate::notify::CommitStatusReporter;
use chrono::Utc;
use gantry_core::job::{JobColumn, JobGuard, RunJob};
use gantry_core::ports::{Store, Transaction, WorkflowParser};
use gantry_core::preexec::{PreExecutionError, PreExecutionErrorCode};
use gantry_core::run::{ConcurrencyType, Run, RunColumn};
use gantry_core::status::aggregate;
use gantry_core::task::TaskColumn;
use gantry_core::workflow::{ParseOptions, SingleWorkflow};
use gantry_core::{Error, Result, RunId, Status, TaskId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) async fn load_run(tx: &mut dyn Transaction, run_id: RunId) -> Result<Run> {
    tx.get_run(run_id)
        .await?
        .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
}

/// Update a job and, when its status changed, recompute the status of its
/// run. Returns the number of job rows affected.
pub async fn update_run_job(
    tx: &mut dyn Transaction,
    job: &RunJob,
    columns: &[JobColumn],
    guard: JobGuard,
) -> Result<u64> {
    let affected = tx.update_job(job, columns, guard).await?;
    if affected == 0 || !columns.contains(&JobColumn::Status) {
        return Ok(affected);
    }
    refresh_run_status(tx, job.run_id).await?;
    Ok(affected)
}

/// Aggregate the statuses of a run's jobs into the run, setting the start
/// and stop times the first time the run is running or done.
pub async fn refresh_run_status(tx: &mut dyn Transaction, run_id: RunId) -> Result<Run> {
    let mut run = load_run(tx, run_id).await?;
    let jobs = tx.list_jobs(run_id).await?;

    let status = if jobs.is_empty() {
        // a matrix may expand to nothing
        Status::Skipped
    } else {
        aggregate(jobs.iter().map(|j| j.status))
    };
    if status == Status::Unknown {
        let statuses: Vec<Status> = jobs.iter().map(|j| j.status).collect();
        error!(run_id = %run_id, ?statuses, "Run aggregated to unknown status");
    }

    let now = Utc::now();
    run.status = status;
    if status.is_running() && run.started.is_none() {
        run.started = Some(now);
    }
    if status.is_done() && run.stopped.is_none() {
        run.stopped = Some(now);
    }
    tx.update_run(&run, &[RunColumn::Status, RunColumn::Started, RunColumn::Stopped])
        .await?;
    Ok(run)
}

/// Move a task and its job to `status`. Stopping a finished task is a
/// no-op.
pub async fn stop_task(tx: &mut dyn Transaction, task_id: TaskId, status: Status) -> Result<()> {
    let mut task = tx
        .get_task(task_id)
        .await?
        .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
    if task.status.is_done() {
        return Ok(());
    }

    let now = Utc::now();
    task.status = status;
    task.stopped = Some(now);
    tx.update_task(&task, &[TaskColumn::Status, TaskColumn::Stopped])
        .await?;

    let mut job = tx
        .get_job(task.job_id)
        .await?
        .ok_or_else(|| Error::JobNotFound(task.job_id.to_string()))?;
    job.status = status;
    job.stopped = Some(now);
    update_run_job(tx, &job, &[JobColumn::Status, JobColumn::Stopped], JobGuard::None).await?;
    Ok(())
}

/// Move every unfinished job of `run` to `status` and clear its approval
/// requirement. `run` is reloaded afterwards.
pub async fn kill_run(tx: &mut dyn Transaction, run: &mut Run, status: Status) -> Result<()> {
    for mut job in tx.list_jobs(run.id).await? {
        if job.status.is_done() {
            continue;
        }

        match job.task_id {
            None => {
                job.status = status;
                job.stopped = Some(Utc::now());
                let affected = update_run_job(
                    tx,
                    &job,
                    &[JobColumn::Status, JobColumn::Stopped],
                    JobGuard::Unassigned,
                )
                .await?;
                if affected > 0 {
                    continue;
                }
                // a task was assigned in the meantime
                let current = tx
                    .get_job(job.id)
                    .await?
                    .ok_or_else(|| Error::JobNotFound(job.id.to_string()))?;
                if let Some(task_id) = current.task_id {
                    stop_task(tx, task_id, status).await?;
                }
            }
            Some(task_id) => stop_task(tx, task_id, status).await?,
        }
    }

    *run = load_run(tx, run.id).await?;
    if run.need_approval {
        run.need_approval = false;
        tx.update_run(run, &[RunColumn::Approval]).await?;
    }
    Ok(())
}

/// Release the jobs of a run that were held for approval. Jobs with `needs`
/// stay blocked until the jobs they need finish.
pub async fn approve_run(tx: &mut dyn Transaction, run: &mut Run, doer: UserId) -> Result<()> {
    for mut job in tx.list_jobs(run.id).await? {
        if !job.needs.is_empty() || !job.status.is_blocked() {
            continue;
        }
        job.status = Status::Waiting;
        update_run_job(
            tx,
            &job,
            &[JobColumn::Status],
            JobGuard::Status(Status::Blocked),
        )
        .await?;
    }

    *run = load_run(tx, run.id).await?;
    run.need_approval = false;
    run.approved_by = Some(doer);
    tx.update_run(run, &[RunColumn::Approval]).await?;
    Ok(())
}

/// Record `err` on the run and fail it. A run keeps the first error
/// recorded on it.
pub async fn fail_run_pre_execution_error(
    tx: &mut dyn Transaction,
    run: &mut Run,
    err: PreExecutionError,
) -> Result<()> {
    if run.pre_execution_error.is_some() {
        return Ok(());
    }
    warn!(
        run_id = %run.id,
        code = err.code,
        args = ?err.args,
        "Run failed before execution"
    );

    run.status = Status::Failure;
    run.pre_execution_error = Some(err);
    if run.stopped.is_none() {
        run.stopped = Some(Utc::now());
    }
    tx.update_run(
        run,
        &[
            RunColumn::Status,
            RunColumn::PreExecutionError,
            RunColumn::Stopped,
        ],
    )
    .await?;

    kill_run(tx, run, Status::Failure).await
}

/// Reject job graphs that can never make progress. Returns `false` after
/// failing the run.
pub async fn consistency_check(
    tx: &mut dyn Transaction,
    run: &mut Run,
    jobs: &[RunJob],
) -> Result<bool> {
    for job in jobs {
        let (incomplete_matrix, matrix_needs) = job.has_incomplete_matrix()?;
        if incomplete_matrix
            && let Some(needs) = matrix_needs
            && !job.needs.contains(&needs.job)
        {
            let err = PreExecutionError::new(
                PreExecutionErrorCode::IncompleteMatrixMissingJob,
                [
                    job.job_id.clone(),
                    needs.job.clone(),
                    job.needs.join(", "),
                ],
            );
            fail_run_pre_execution_error(tx, run, err).await?;
            return Ok(false);
        }

        let (incomplete_runs_on, _, dimension) = job.has_incomplete_runs_on()?;
        if incomplete_runs_on
            && !incomplete_matrix
            && let Some(dimension) = dimension
        {
            let err = PreExecutionError::new(
                PreExecutionErrorCode::IncompleteRunsOnMissingMatrixDimension,
                [job.job_id.clone(), dimension.dimension.clone()],
            );
            fail_run_pre_execution_error(tx, run, err).await?;
            return Ok(false);
        }
    }

    if let Some(cycle) = NeedsGraph::from_jobs(jobs).cycle() {
        let err = PreExecutionError::new(PreExecutionErrorCode::NeedsCycle, [cycle.join(", ")]);
        fail_run_pre_execution_error(tx, run, err).await?;
        return Ok(false);
    }
    Ok(true)
}

/// Job row carrying the run-level fields of `run`.
pub(crate) fn job_template(run: &Run) -> RunJob {
    let mut job = RunJob::default();
    job.run_id = run.id;
    job.repo_id = run.repo_id;
    job.owner_id = run.owner_id;
    job.commit_sha = run.commit_sha.clone();
    job.is_fork_pull_request = run.is_fork_pull_request;
    job
}

/// New job row for a single-job fragment, copying run-level fields from
/// `template`.
pub(crate) fn job_from_fragment(
    template: &RunJob,
    workflow: &SingleWorkflow,
    status: Status,
) -> Result<RunJob> {
    let (job_id, spec) = workflow
        .job()
        .ok_or_else(|| Error::Parse("workflow fragment has no job".into()))?;

    let mut job = RunJob::default();
    job.run_id = template.run_id;
    job.repo_id = template.repo_id;
    job.owner_id = template.owner_id;
    job.commit_sha = template.commit_sha.clone();
    job.is_fork_pull_request = template.is_fork_pull_request;
    job.name = if spec.name.is_empty() {
        job_id.to_string()
    } else {
        spec.name.clone()
    };
    job.job_id = job_id.to_string();
    job.needs = spec.needs.clone();
    job.runs_on = spec.runs_on.clone();
    job.workflow_payload = workflow.to_yaml()?;
    job.status = status;
    Ok(job)
}

/// Insert one job per fragment. Jobs wait for approval or for their needs
/// as blocked, as does every workflow call; repeated names get a numeric
/// suffix.
pub async fn insert_run_jobs(
    tx: &mut dyn Transaction,
    run: &Run,
    workflows: &[SingleWorkflow],
) -> Result<Vec<RunJob>> {
    let template = job_template(run);
    let mut names = HashSet::new();
    let mut jobs = Vec::with_capacity(workflows.len());

    for workflow in workflows {
        let mut job = job_from_fragment(&template, workflow, Status::Waiting)?;
        if run.need_approval || !job.needs.is_empty() || workflow.is_workflow_call_outer() {
            job.status = Status::Blocked;
        }
        if !names.insert(job.name.clone()) {
            let base = job.name.clone();
            let mut suffix = 1;
            while !names.insert(format!("{base}-{suffix}")) {
                suffix += 1;
            }
            job.name = format!("{base}-{suffix}");
        }

        tx.insert_job(&mut job).await?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Run lifecycle operations, each in its own transaction.
pub struct RunService {
    store: Arc<dyn Store>,
    parser: Arc<dyn WorkflowParser>,
    reporter: Arc<CommitStatusReporter>,
}

impl RunService {
    pub fn new(
        store: Arc<dyn Store>,
        parser: Arc<dyn WorkflowParser>,
        reporter: Arc<CommitStatusReporter>,
    ) -> Self {
        Self {
            store,
            parser,
            reporter,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn parser(&self) -> &Arc<dyn WorkflowParser> {
        &self.parser
    }

    /// Report commit statuses for `run_ids`.
    pub async fn notify<I>(&self, run_ids: I)
    where
        I: IntoIterator<Item = RunId>,
    {
        for run_id in run_ids {
            self.reporter.report_run(self.store.as_ref(), run_id).await;
        }
    }

    /// Insert `run` with one job per job of `workflow`.
    ///
    /// `run.need_approval` must already reflect the trust decision. A
    /// workflow that cannot be parsed still creates the run, failed with a
    /// pre-execution error.
    pub async fn create_run(
        &self,
        mut run: Run,
        workflow: &[u8],
        concurrency: Option<&ConcurrencySpec>,
    ) -> Result<Run> {
        let options = ParseOptions::default().support_incomplete_runs_on();
        let parsed = match self.parser.parse(workflow, &options) {
            Ok(parsed) => Ok(parsed),
            Err(Error::Parse(msg)) => Err(msg),
            Err(e) => return Err(e),
        };

        configure_run_concurrency(&mut run, concurrency);
        run.status = if run.need_approval {
            Status::Blocked
        } else {
            Status::Waiting
        };
        run.pre_execution_error = None;
        run.started = None;
        run.stopped = None;

        let mut tx = self.store.begin().await?;
        let mut cancelled = Vec::new();
        if run.concurrency_type == ConcurrencyType::CancelInProgress {
            cancelled = cancel_previous_with_concurrency_group(tx.as_mut(), &run).await?;
        }
        tx.insert_run(&mut run).await?;

        match parsed {
            Ok(workflows) => {
                let jobs = insert_run_jobs(tx.as_mut(), &run, &workflows).await?;
                if consistency_check(tx.as_mut(), &mut run, &jobs).await? {
                    run = refresh_run_status(tx.as_mut(), run.id).await?;
                }
                info!(
                    run_id = %run.id,
                    repo_id = %run.repo_id,
                    index = run.index,
                    jobs = jobs.len(),
                    group = %run.concurrency_group,
                    "Run created"
                );
            }
            Err(msg) => {
                let err = PreExecutionError::new(PreExecutionErrorCode::JobParsingError, [msg]);
                fail_run_pre_execution_error(tx.as_mut(), &mut run, err).await?;
            }
        }
        tx.commit().await?;

        self.notify(cancelled.into_iter().chain([run.id])).await;
        Ok(run)
    }

    /// Move every unfinished job of the run to `status`.
    pub async fn kill_run(&self, run_id: RunId, status: Status) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut run = load_run(tx.as_mut(), run_id).await?;
        kill_run(tx.as_mut(), &mut run, status).await?;
        tx.commit().await?;

        debug!(run_id = %run_id, %status, "Run killed");
        self.notify([run_id]).await;
        Ok(())
    }

    pub async fn cancel_run(&self, run_id: RunId) -> Result<()> {
        self.kill_run(run_id, Status::Cancelled).await
    }

    pub async fn approve_run(&self, run_id: RunId, doer: UserId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut run = load_run(tx.as_mut(), run_id).await?;
        approve_run(tx.as_mut(), &mut run, doer).await?;
        tx.commit().await?;

        info!(run_id = %run_id, approved_by = %doer, "Run approved");
        self.notify([run_id]).await;
        Ok(())
    }

    pub async fn fail_run_pre_execution_error(
        &self,
        run_id: RunId,
        err: PreExecutionError,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut run = load_run(tx.as_mut(), run_id).await?;
        fail_run_pre_execution_error(tx.as_mut(), &mut run, err).await?;
        tx.commit().await?;

        self.notify([run_id]).await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::TracingSink;
    use crate::parser::MatrixParser;
    use gantry_core::preexec::EnglishCatalog;
    use gantry_core::run::TriggerEvent;
    use gantry_core::task::Task;
    use gantry_core::RepoId;
    use gantry_db::MemoryStore;
    use pretty_assertions::assert_eq;

    pub(crate) fn service(store: &MemoryStore) -> RunService {
        RunService::new(
            Arc::new(store.clone()),
            Arc::new(MatrixParser::new()),
            Arc::new(CommitStatusReporter::new(Arc::new(TracingSink), 64)),
        )
    }

    pub(crate) fn new_run(repo: i64) -> Run {
        Run {
            repo_id: RepoId::new(repo),
            workflow_id: "ci.yml".into(),
            git_ref: "refs/heads/main".into(),
            commit_sha: "0123abcd".into(),
            event: TriggerEvent::WorkflowDispatch,
            ..Default::default()
        }
    }

    pub(crate) const PIPELINE: &str = r#"
name: ci
jobs:
  build:
    runs-on: linux
    steps:
      - run: make
  test:
    needs: build
    runs-on: linux
  deploy:
    needs: [test]
    runs-on: linux
"#;

    #[tokio::test]
    async fn test_create_run_inserts_jobs() {
        let store = MemoryStore::new();
        let run = service(&store)
            .create_run(new_run(1), PIPELINE.as_bytes(), None)
            .await
            .unwrap();

        let state = store.snapshot().await;
        let jobs = state.jobs_of(run.id);
        let summary: Vec<(&str, Status)> =
            jobs.iter().map(|j| (j.name.as_str(), j.status)).collect();
        assert_eq!(
            summary,
            vec![
                ("build", Status::Waiting),
                ("deploy", Status::Blocked),
                ("test", Status::Blocked),
            ]
        );
        assert_eq!(state.runs[&run.id].status, Status::Waiting);
        assert_eq!(state.runs[&run.id].index, 1);
        assert!(state.runs[&run.id].started.is_none());
    }

    #[tokio::test]
    async fn test_create_run_needing_approval_blocks_every_job() {
        let store = MemoryStore::new();
        let mut run = new_run(1);
        run.need_approval = true;
        let run = service(&store)
            .create_run(run, PIPELINE.as_bytes(), None)
            .await
            .unwrap();

        let state = store.snapshot().await;
        assert!(state.jobs_of(run.id).iter().all(|j| j.status == Status::Blocked));
        assert_eq!(state.runs[&run.id].status, Status::Blocked);
    }

    #[tokio::test]
    async fn test_duplicate_job_names_get_suffix() {
        let payload = r#"
jobs:
  a:
    name: check
  b:
    name: check
  c:
    name: check
"#;
        let store = MemoryStore::new();
        let run = service(&store)
            .create_run(new_run(1), payload.as_bytes(), None)
            .await
            .unwrap();

        let state = store.snapshot().await;
        let names: Vec<&str> = state.jobs_of(run.id).iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["check", "check-1", "check-2"]);
    }

    #[tokio::test]
    async fn test_unparsable_workflow_fails_run() {
        let store = MemoryStore::new();
        let run = service(&store)
            .create_run(new_run(1), b"jobs: [", None)
            .await
            .unwrap();

        assert_eq!(run.status, Status::Failure);
        let err = run.pre_execution_error.unwrap();
        assert_eq!(err.code(), Some(PreExecutionErrorCode::JobParsingError));
        assert!(err.render(&EnglishCatalog).starts_with("Unable to parse jobs in workflow"));
    }

    #[tokio::test]
    async fn test_needs_cycle_fails_run() {
        let payload = r#"
jobs:
  a:
    needs: b
  b:
    needs: a
  c: {}
"#;
        let store = MemoryStore::new();
        let run = service(&store)
            .create_run(new_run(1), payload.as_bytes(), None)
            .await
            .unwrap();

        let state = store.snapshot().await;
        let stored = &state.runs[&run.id];
        assert_eq!(stored.status, Status::Failure);
        assert_eq!(
            stored.pre_execution_error,
            Some(PreExecutionError::new(PreExecutionErrorCode::NeedsCycle, ["a, b"]))
        );
        assert!(state.jobs_of(run.id).iter().all(|j| j.status == Status::Failure));
        assert!(stored.stopped.is_some());
    }

    #[tokio::test]
    async fn test_matrix_needing_undeclared_job_fails_run() {
        let payload = r#"
jobs:
  setup:
    runs-on: linux
  build:
    runs-on: linux
    strategy:
      matrix:
        target: ${{ fromJSON(needs.setup.outputs.targets) }}
"#;
        let store = MemoryStore::new();
        let run = service(&store)
            .create_run(new_run(1), payload.as_bytes(), None)
            .await
            .unwrap();

        let err = store.snapshot().await.runs[&run.id]
            .pre_execution_error
            .clone()
            .unwrap();
        assert_eq!(err.code(), Some(PreExecutionErrorCode::IncompleteMatrixMissingJob));
        assert_eq!(err.args, vec!["build", "setup", ""]);
    }

    #[tokio::test]
    async fn test_runs_on_missing_dimension_fails_run() {
        let payload = r#"
jobs:
  build:
    runs-on: ${{ matrix.platform }}
    strategy:
      matrix:
        os: [linux]
"#;
        let store = MemoryStore::new();
        let run = service(&store)
            .create_run(new_run(1), payload.as_bytes(), None)
            .await
            .unwrap();

        let err = store.snapshot().await.runs[&run.id]
            .pre_execution_error
            .clone()
            .unwrap();
        assert_eq!(
            err,
            PreExecutionError::new(
                PreExecutionErrorCode::IncompleteRunsOnMissingMatrixDimension,
                ["build", "platform"]
            )
        );
    }

    #[tokio::test]
    async fn test_cancel_in_progress_cancels_previous_run() {
        let store = MemoryStore::new();
        let runs = service(&store);
        let mut first = new_run(1);
        first.event = TriggerEvent::Push;
        let first = runs.create_run(first, PIPELINE.as_bytes(), None).await.unwrap();

        let mut second = new_run(1);
        second.event = TriggerEvent::Push;
        let second = runs.create_run(second, PIPELINE.as_bytes(), None).await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.runs[&first.id].status, Status::Cancelled);
        assert_eq!(state.runs[&second.id].status, Status::Waiting);
        assert_eq!(
            state.runs[&second.id].concurrency_type,
            ConcurrencyType::CancelInProgress
        );
    }

    #[tokio::test]
    async fn test_kill_run_stops_assigned_task() {
        let store = MemoryStore::new();
        let runs = service(&store);
        let run = runs.create_run(new_run(1), PIPELINE.as_bytes(), None).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let mut build = tx.list_jobs(run.id).await.unwrap().remove(0);
            let mut task = Task {
                job_id: build.id,
                attempt: 1,
                status: Status::Running,
                ..Default::default()
            };
            tx.insert_task(&mut task).await.unwrap();
            build.task_id = Some(task.id);
            build.status = Status::Running;
            update_run_job(
                tx.as_mut(),
                &build,
                &[JobColumn::Status, JobColumn::TaskId],
                JobGuard::Unassigned,
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        runs.cancel_run(run.id).await.unwrap();

        let state = store.snapshot().await;
        assert!(state.jobs_of(run.id).iter().all(|j| j.status == Status::Cancelled));
        let task = state.tasks.values().next().unwrap();
        assert_eq!(task.status, Status::Cancelled);
        assert!(task.stopped.is_some());
        let stored = &state.runs[&run.id];
        assert_eq!(stored.status, Status::Cancelled);
        assert!(stored.started.is_some());
        assert!(stored.stopped.is_some());
    }

    #[tokio::test]
    async fn test_approve_run_releases_jobs_without_needs() {
        let store = MemoryStore::new();
        let runs = service(&store);
        let mut run = new_run(1);
        run.need_approval = true;
        let run = runs.create_run(run, PIPELINE.as_bytes(), None).await.unwrap();

        runs.approve_run(run.id, UserId::new(9)).await.unwrap();

        let state = store.snapshot().await;
        let build = state.job_named(run.id, "build").unwrap();
        let test = state.job_named(run.id, "test").unwrap();
        assert_eq!(build.status, Status::Waiting);
        assert_eq!(test.status, Status::Blocked);
        let stored = &state.runs[&run.id];
        assert!(!stored.need_approval);
        assert_eq!(stored.approved_by, Some(UserId::new(9)));
        assert_eq!(stored.status, Status::Waiting);
    }

    #[tokio::test]
    async fn test_first_pre_execution_error_wins() {
        let store = MemoryStore::new();
        let runs = service(&store);
        let run = runs.create_run(new_run(1), PIPELINE.as_bytes(), None).await.unwrap();

        let first = PreExecutionError::new(PreExecutionErrorCode::EventDetectionError, ["bad on:"]);
        let second = PreExecutionError::new(PreExecutionErrorCode::JobParsingError, ["later"]);
        runs.fail_run_pre_execution_error(run.id, first.clone())
            .await
            .unwrap();
        runs.fail_run_pre_execution_error(run.id, second).await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.runs[&run.id].pre_execution_error, Some(first));
        assert_eq!(state.runs[&run.id].status, Status::Failure);
    }
}
