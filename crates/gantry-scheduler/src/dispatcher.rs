//! Assignment of waiting jobs to runners.

use crate::cache::BoundedCache;
use crate::config::{LogCompression, SchedulerConfig};
use crate::notify::CommitStatusReporter;
use crate::runs::update_run_job;
use crate::token::{self, IssuedToken};
use chrono::Utc;
use gantry_core::job::{JobColumn, JobGuard, RunJob};
use gantry_core::ports::Store;
use gantry_core::task::{Runner, Task, TaskColumn, TaskStep};
use gantry_core::{Error, RepoId, Result, Status, TaskId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Longest stored step name, in bytes.
pub const MAX_STEP_NAME_LEN: usize = 255;

/// A job claimed by a runner, with the task created for it.
#[derive(Debug, Clone)]
pub struct AssignedTask {
    /// Carries the plaintext token.
    pub task: Task,
    pub job: RunJob,
    pub steps: Vec<TaskStep>,
}

/// Hands out waiting jobs to runners and authenticates runners by task
/// token.
pub struct TaskDispatcher {
    store: Arc<dyn Store>,
    reporter: Arc<CommitStatusReporter>,
    config: SchedulerConfig,
    tokens: Mutex<BoundedCache<String, TaskId>>,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        reporter: Arc<CommitStatusReporter>,
        config: SchedulerConfig,
    ) -> Self {
        let tokens = Mutex::new(BoundedCache::new(config.token_cache_size));
        Self {
            store,
            reporter,
            config,
            tokens,
        }
    }

    /// Claim at most one waiting job the runner can execute.
    ///
    /// Returns `None` when no job matches, or when another dispatcher
    /// claimed the selected job first.
    pub async fn create_task_for_runner(&self, runner: &Runner) -> Result<Option<AssignedTask>> {
        let mut tx = self.store.begin().await?;

        let available = tx
            .list_available_jobs(runner.scope, self.config.concurrency_group_queue_enabled)
            .await?;
        let Some(mut job) = available.into_iter().find(|j| j.runs_on(&runner.labels)) else {
            return Ok(None);
        };

        let now = Utc::now();
        job.attempt += 1;
        job.started = Some(now);
        job.status = Status::Running;

        let mut task = Task {
            job_id: job.id,
            attempt: job.attempt,
            runner_id: runner.id,
            status: Status::Running,
            repo_id: job.repo_id,
            owner_id: job.owner_id,
            commit_sha: job.commit_sha.clone(),
            is_fork_pull_request: job.is_fork_pull_request,
            started: Some(now),
            ..Default::default()
        };
        IssuedToken::generate().apply(&mut task);

        let workflow = job.decode_workflow_payload()?;
        if workflow.jobs.len() != 1 {
            return Err(Error::Parse(format!(
                "job {} payload holds {} jobs",
                job.id,
                workflow.jobs.len()
            )));
        }
        let step_names: Vec<String> = workflow
            .job()
            .map(|(_, spec)| spec.steps.iter().map(|s| s.label()).collect())
            .unwrap_or_default();

        match tx.insert_task(&mut task).await {
            Ok(_) => {}
            Err(Error::Conflict(msg)) => {
                debug!(job_id = %job.id, runner_id = %runner.id, %msg, "Lost dispatch race");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        task.log_filename = log_filename(job.repo_id, task.id, self.config.log_compression);
        tx.update_task(&task, &[TaskColumn::LogFilename]).await?;

        let steps: Vec<TaskStep> = step_names
            .iter()
            .enumerate()
            .map(|(index, name)| TaskStep {
                task_id: task.id,
                repo_id: task.repo_id,
                index: index as i64,
                name: truncate_utf8(name, MAX_STEP_NAME_LEN).to_string(),
                status: Status::Waiting,
            })
            .collect();
        if !steps.is_empty() {
            tx.insert_task_steps(&steps).await?;
        }

        job.task_id = Some(task.id);
        let affected =
            update_run_job(tx.as_mut(), &job, &JobColumn::ALL, JobGuard::Unassigned).await?;
        if affected == 0 {
            debug!(job_id = %job.id, runner_id = %runner.id, "Lost dispatch race");
            return Ok(None);
        }
        tx.commit().await?;

        info!(
            runner_id = %runner.id,
            job_id = %job.id,
            task_id = %task.id,
            attempt = task.attempt,
            "Task assigned"
        );
        self.reporter.report_run(self.store.as_ref(), job.run_id).await;

        Ok(Some(AssignedTask { task, job, steps }))
    }

    /// The running task a runner authenticates with `token`.
    pub async fn running_task_by_token(&self, token: &str) -> Result<Task> {
        if !token::is_well_formed(token) {
            return Err(Error::InvalidToken("malformed task token".into()));
        }

        let cached = self.tokens.lock().await.get(&token.to_string());
        if let Some(task_id) = cached {
            let mut tx = self.store.begin().await?;
            match tx.get_task(task_id).await? {
                Some(task) if task.status.is_running() => return Ok(task),
                _ => {
                    self.tokens.lock().await.remove(&token.to_string());
                }
            }
        }

        let mut tx = self.store.begin().await?;
        let candidates = tx
            .find_running_tasks_by_token_suffix(token::last_eight(token))
            .await?;
        drop(tx);

        let task = candidates
            .into_iter()
            .find(|t| token::verify(token, t))
            .ok_or_else(|| Error::TaskNotFound("no running task for token".into()))?;
        self.tokens.lock().await.insert(token.to_string(), task.id);
        Ok(task)
    }
}

/// Storage path of a task log.
pub fn log_filename(repo_id: RepoId, task_id: TaskId, compression: LogCompression) -> String {
    let mut name = format!(
        "{}/{:02x}/{}.log",
        repo_id.get(),
        task_id.get() % 256,
        task_id.get()
    );
    if compression.is_zstd() {
        name.push_str(".zst");
    }
    name
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a
/// character.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencySpec;
    use crate::notify::TracingSink;
    use crate::runs::tests::{new_run, service};
    use async_trait::async_trait;
    use gantry_core::ports::Transaction;
    use gantry_core::run::{ConcurrencyType, Run, RunColumn, RunFilter};
    use gantry_core::task::{RunnerScope, TaskOutput};
    use gantry_core::trust::TrustGrant;
    use gantry_core::{JobId, RunId, RunnerId, UserId};
    use gantry_db::MemoryStore;
    use pretty_assertions::assert_eq;

    fn dispatcher(store: &MemoryStore, config: SchedulerConfig) -> TaskDispatcher {
        TaskDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(CommitStatusReporter::new(Arc::new(TracingSink), 64)),
            config,
        )
    }

    fn runner(labels: &[&str]) -> Runner {
        Runner {
            id: RunnerId::new(7),
            name: "runner-7".into(),
            scope: RunnerScope::Global,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    const SINGLE: &str = r#"
jobs:
  build:
    runs-on: [linux, x64]
    steps:
      - name: checkout
        uses: actions/checkout@v4
      - run: cargo build
"#;

    async fn create(store: &MemoryStore, run: Run) -> Run {
        service(store).create_run(run, SINGLE.as_bytes(), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_assigns_matching_job() {
        let store = MemoryStore::new();
        let run = create(&store, new_run(3)).await;
        let dispatcher = dispatcher(&store, SchedulerConfig::default());

        let assigned = dispatcher
            .create_task_for_runner(&runner(&["x64", "linux", "gpu"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(assigned.job.status, Status::Running);
        assert_eq!(assigned.job.attempt, 1);
        assert_eq!(assigned.task.attempt, 1);
        assert_eq!(assigned.task.runner_id, RunnerId::new(7));
        let token = assigned.task.token.clone().unwrap();
        assert!(token::is_well_formed(&token));
        assert_eq!(
            assigned.task.log_filename,
            format!("3/{:02x}/{}.log.zst", assigned.task.id.get() % 256, assigned.task.id.get())
        );
        let steps: Vec<&str> = assigned.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(steps, vec!["checkout", "cargo build"]);

        let state = store.snapshot().await;
        let stored = &state.jobs[&assigned.job.id];
        assert_eq!(stored.task_id, Some(assigned.task.id));
        assert_eq!(state.runs[&run.id].status, Status::Running);
        assert!(state.runs[&run.id].started.is_some());
        assert!(state.tasks[&assigned.task.id].token.is_none());
        assert_eq!(state.task_steps.len(), 2);

        let authenticated = dispatcher.running_task_by_token(&token).await.unwrap();
        assert_eq!(authenticated.id, assigned.task.id);
        let cached = dispatcher.running_task_by_token(&token).await.unwrap();
        assert_eq!(cached.id, assigned.task.id);
    }

    #[tokio::test]
    async fn test_label_subset_required() {
        let store = MemoryStore::new();
        create(&store, new_run(3)).await;
        let dispatcher = dispatcher(&store, SchedulerConfig::default());

        assert!(dispatcher.create_task_for_runner(&runner(&["linux"])).await.unwrap().is_none());
        assert!(dispatcher.create_task_for_runner(&runner(&[])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_is_claimed_once() {
        let store = MemoryStore::new();
        create(&store, new_run(3)).await;
        let first = dispatcher(&store, SchedulerConfig::default());
        let second = dispatcher(&store, SchedulerConfig::default());
        let labels = runner(&["linux", "x64"]);

        let (a, b) = tokio::join!(
            first.create_task_for_runner(&labels),
            second.create_task_for_runner(&labels)
        );
        let claimed = [a.unwrap(), b.unwrap()];
        assert_eq!(claimed.iter().filter(|c| c.is_some()).count(), 1);
    }

    /// Which write of a dispatch another dispatcher wins.
    #[derive(Debug, Clone, Copy)]
    enum Race {
        /// A task for the same attempt already exists.
        TaskInsert,
        /// The job got a task between listing and claiming it.
        JobClaim,
    }

    /// Store whose transactions lose `race` and delegate everything else to
    /// a [`MemoryStore`].
    struct RacingStore {
        inner: MemoryStore,
        race: Race,
    }

    #[async_trait]
    impl Store for RacingStore {
        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            Ok(Box::new(RacingTransaction {
                inner: self.inner.begin().await?,
                race: self.race,
            }))
        }
    }

    struct RacingTransaction {
        inner: Box<dyn Transaction>,
        race: Race,
    }

    #[async_trait]
    impl Transaction for RacingTransaction {
        async fn get_run(&mut self, id: RunId) -> Result<Option<Run>> {
            self.inner.get_run(id).await
        }

        async fn insert_run(&mut self, run: &mut Run) -> Result<RunId> {
            self.inner.insert_run(run).await
        }

        async fn update_run(&mut self, run: &Run, columns: &[RunColumn]) -> Result<u64> {
            self.inner.update_run(run, columns).await
        }

        async fn find_runs(&mut self, filter: &RunFilter) -> Result<Vec<Run>> {
            self.inner.find_runs(filter).await
        }

        async fn get_job(&mut self, id: JobId) -> Result<Option<RunJob>> {
            self.inner.get_job(id).await
        }

        async fn list_jobs(&mut self, run_id: RunId) -> Result<Vec<RunJob>> {
            self.inner.list_jobs(run_id).await
        }

        async fn insert_job(&mut self, job: &mut RunJob) -> Result<JobId> {
            self.inner.insert_job(job).await
        }

        async fn update_job(
            &mut self,
            job: &RunJob,
            columns: &[JobColumn],
            guard: JobGuard,
        ) -> Result<u64> {
            if matches!(self.race, Race::JobClaim) && guard == JobGuard::Unassigned {
                return Ok(0);
            }
            self.inner.update_job(job, columns, guard).await
        }

        async fn delete_job(&mut self, id: JobId) -> Result<u64> {
            self.inner.delete_job(id).await
        }

        async fn list_available_jobs(
            &mut self,
            scope: RunnerScope,
            queue_behind: bool,
        ) -> Result<Vec<RunJob>> {
            self.inner.list_available_jobs(scope, queue_behind).await
        }

        async fn get_task(&mut self, id: TaskId) -> Result<Option<Task>> {
            self.inner.get_task(id).await
        }

        async fn insert_task(&mut self, task: &mut Task) -> Result<TaskId> {
            if matches!(self.race, Race::TaskInsert) {
                return Err(Error::Conflict(format!(
                    "task for {} attempt {} already exists",
                    task.job_id, task.attempt
                )));
            }
            self.inner.insert_task(task).await
        }

        async fn update_task(&mut self, task: &Task, columns: &[TaskColumn]) -> Result<u64> {
            self.inner.update_task(task, columns).await
        }

        async fn find_running_tasks_by_token_suffix(
            &mut self,
            last_eight: &str,
        ) -> Result<Vec<Task>> {
            self.inner.find_running_tasks_by_token_suffix(last_eight).await
        }

        async fn insert_task_steps(&mut self, steps: &[TaskStep]) -> Result<()> {
            self.inner.insert_task_steps(steps).await
        }

        async fn insert_task_outputs(&mut self, outputs: &[TaskOutput]) -> Result<()> {
            self.inner.insert_task_outputs(outputs).await
        }

        async fn list_task_outputs(&mut self, task_id: TaskId) -> Result<Vec<TaskOutput>> {
            self.inner.list_task_outputs(task_id).await
        }

        async fn get_trust_grant(
            &mut self,
            user_id: UserId,
            repo_id: RepoId,
        ) -> Result<Option<TrustGrant>> {
            self.inner.get_trust_grant(user_id, repo_id).await
        }

        async fn upsert_trust_grant(&mut self, grant: &TrustGrant) -> Result<()> {
            self.inner.upsert_trust_grant(grant).await
        }

        async fn delete_trust_grant(&mut self, user_id: UserId, repo_id: RepoId) -> Result<u64> {
            self.inner.delete_trust_grant(user_id, repo_id).await
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit().await
        }
    }

    async fn assert_lost_race(race: Race) {
        let store = MemoryStore::new();
        let run = create(&store, new_run(3)).await;
        let racing = TaskDispatcher::new(
            Arc::new(RacingStore {
                inner: store.clone(),
                race,
            }),
            Arc::new(CommitStatusReporter::new(Arc::new(TracingSink), 64)),
            SchedulerConfig::default(),
        );

        let assigned = racing
            .create_task_for_runner(&runner(&["linux", "x64"]))
            .await
            .unwrap();
        assert!(assigned.is_none());

        let state = store.snapshot().await;
        assert!(state.tasks.is_empty());
        assert!(state.task_steps.is_empty());
        let job = state.job_named(run.id, "build").unwrap();
        assert_eq!(job.status, Status::Waiting);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.task_id, None);
        assert_eq!(state.runs[&run.id].status, Status::Waiting);
    }

    #[tokio::test]
    async fn test_conflicting_task_insert_is_lost_race() {
        assert_lost_race(Race::TaskInsert).await;
    }

    #[tokio::test]
    async fn test_claimed_job_is_lost_race() {
        assert_lost_race(Race::JobClaim).await;
    }

    async fn finish(store: &MemoryStore, job: &RunJob) {
        let mut tx = store.begin().await.unwrap();
        let mut job = tx.get_job(job.id).await.unwrap().unwrap();
        job.status = Status::Success;
        job.stopped = Some(Utc::now());
        update_run_job(
            tx.as_mut(),
            &job,
            &[JobColumn::Status, JobColumn::Stopped],
            JobGuard::None,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    fn queued(repo: i64) -> (Run, ConcurrencySpec) {
        let spec = ConcurrencySpec {
            group: Some("deploy".into()),
            cancel_in_progress: Some(false),
        };
        (new_run(repo), spec)
    }

    #[tokio::test]
    async fn test_queue_behind_holds_newer_run() {
        let store = MemoryStore::new();
        let runs = service(&store);
        let (older, spec) = queued(3);
        let older = runs.create_run(older, SINGLE.as_bytes(), Some(&spec)).await.unwrap();
        let (newer, spec) = queued(3);
        let newer = runs.create_run(newer, SINGLE.as_bytes(), Some(&spec)).await.unwrap();
        assert_eq!(newer.concurrency_type, ConcurrencyType::QueueBehind);

        let dispatcher = dispatcher(&store, SchedulerConfig::default());
        let labels = runner(&["linux", "x64"]);

        let first = dispatcher.create_task_for_runner(&labels).await.unwrap().unwrap();
        assert_eq!(first.job.run_id, older.id);
        assert!(dispatcher.create_task_for_runner(&labels).await.unwrap().is_none());

        finish(&store, &first.job).await;
        let second = dispatcher.create_task_for_runner(&labels).await.unwrap().unwrap();
        assert_eq!(second.job.run_id, newer.id);
    }

    #[tokio::test]
    async fn test_disabled_queue_runs_group_side_by_side() {
        let store = MemoryStore::new();
        let runs = service(&store);
        for _ in 0..2 {
            let (run, spec) = queued(3);
            runs.create_run(run, SINGLE.as_bytes(), Some(&spec)).await.unwrap();
        }

        let config = SchedulerConfig {
            concurrency_group_queue_enabled: false,
            ..Default::default()
        };
        let dispatcher = dispatcher(&store, config);
        let labels = runner(&["linux", "x64"]);
        assert!(dispatcher.create_task_for_runner(&labels).await.unwrap().is_some());
        assert!(dispatcher.create_task_for_runner(&labels).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_finished_task_token_is_rejected() {
        let store = MemoryStore::new();
        create(&store, new_run(3)).await;
        let dispatcher = dispatcher(&store, SchedulerConfig::default());
        let assigned = dispatcher
            .create_task_for_runner(&runner(&["linux", "x64"]))
            .await
            .unwrap()
            .unwrap();
        let token = assigned.task.token.clone().unwrap();
        dispatcher.running_task_by_token(&token).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            crate::runs::stop_task(tx.as_mut(), assigned.task.id, Status::Success)
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let err = dispatcher.running_task_by_token(&token).await.unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_tokens() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher(&store, SchedulerConfig::default());

        let err = dispatcher.running_task_by_token("short").await.unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));

        let err = dispatcher
            .running_task_by_token(&"0".repeat(40))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[test]
    fn test_log_filename() {
        assert_eq!(
            log_filename(RepoId::new(12), TaskId::new(300), LogCompression::None),
            "12/2c/300.log"
        );
        assert_eq!(
            log_filename(RepoId::new(1), TaskId::new(5), LogCompression::Zstd),
            "1/05/5.log.zst"
        );
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate_utf8("abc", 5), "abc");
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("héllo", 3), "hé");
        let long = "x".repeat(300);
        assert_eq!(truncate_utf8(&long, MAX_STEP_NAME_LEN).len(), 255);
    }
}
