//! Reconciliation of runs after job status changes.

use crate::config::SchedulerConfig;
use crate::expander::{Expansion, MatrixExpander};
use crate::notify::CommitStatusReporter;
use crate::queue::RunQueue;
use crate::resolver::JobStatusResolver;
use crate::runs::{load_run, update_run_job};
use crate::workflow_call::complete_outer_job;
use gantry_core::job::{JobColumn, JobGuard};
use gantry_core::ports::{Store, WorkflowParser};
use gantry_core::run::RunFilter;
use gantry_core::{Error, Result, RunId, Status};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Moves blocked jobs forward once the jobs they need have finished.
///
/// Runs are reconciled by a pool of workers fed by a deduplicating queue,
/// so one run is never reconciled by two workers at once.
pub struct JobEmitter {
    store: Arc<dyn Store>,
    parser: Arc<dyn WorkflowParser>,
    reporter: Arc<CommitStatusReporter>,
    config: SchedulerConfig,
    queue: Arc<RunQueue>,
}

impl JobEmitter {
    pub fn new(
        store: Arc<dyn Store>,
        parser: Arc<dyn WorkflowParser>,
        reporter: Arc<CommitStatusReporter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            parser,
            reporter,
            config,
            queue: Arc::new(RunQueue::new()),
        }
    }

    /// Queue a run for reconciliation.
    pub async fn push(&self, run_id: RunId) {
        if self.queue.push(run_id).await {
            debug!(run_id = %run_id, "Run queued for reconcile");
        }
    }

    /// Queue every unfinished run. The queue lives in memory, so this is
    /// called at startup to pick up work left over from a previous process.
    pub async fn enqueue_unfinished(&self) -> Result<usize> {
        let runs = {
            let mut tx = self.store.begin().await?;
            tx.find_runs(&RunFilter::default().not_done()).await?
        };
        for run in &runs {
            self.queue.push(run.id).await;
        }
        info!(runs = runs.len(), "Queued unfinished runs");
        Ok(runs.len())
    }

    /// Reconcile one run: resolve its blocked jobs, expand the ones that
    /// became runnable, complete settled workflow calls and persist the new
    /// statuses, all in one transaction. Returns the number of jobs that
    /// changed.
    pub async fn check_jobs_of_run(&self, run_id: RunId) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        let mut run = load_run(tx.as_mut(), run_id).await?;
        let jobs = tx.list_jobs(run_id).await?;
        let updates = JobStatusResolver::new(&jobs).resolve()?;

        let expander = MatrixExpander::new(self.parser.as_ref());
        let mut transitions = 0;
        let mut requeue = false;
        for mut job in jobs {
            let Some(&status) = updates.get(&job.id) else {
                continue;
            };

            if status == Status::Waiting {
                match expander.expand(tx.as_mut(), &mut run, &job).await? {
                    Expansion::Unchanged => {}
                    Expansion::Expanded(inserted) => {
                        // dependents of a job expanded to nothing, and
                        // expanded calls, resolve on the next pass
                        requeue |= inserted == 0 || job.is_workflow_call_outer_job()?;
                        transitions += 1;
                        continue;
                    }
                    Expansion::Failed => {
                        transitions += 1;
                        break;
                    }
                }
            }

            job.status = status;
            let mut columns = vec![JobColumn::Status];
            if matches!(status, Status::Success | Status::Failure) {
                columns.extend(complete_outer_job(tx.as_mut(), &mut job).await?);
            }
            let affected = update_run_job(
                tx.as_mut(),
                &job,
                &columns,
                JobGuard::Status(Status::Blocked),
            )
            .await?;
            if affected == 0 {
                if columns.len() > 1 {
                    return Err(Error::Conflict(format!(
                        "workflow call job {} changed during reconcile",
                        job.id
                    )));
                }
                debug!(run_id = %run_id, job_id = %job.id, "Job changed during reconcile");
            } else {
                transitions += 1;
            }
        }
        tx.commit().await?;

        if transitions > 0 {
            info!(run_id = %run_id, transitions, "Run reconciled");
        }
        if requeue {
            self.push(run_id).await;
        }
        self.reporter.report_run(self.store.as_ref(), run_id).await;
        Ok(transitions)
    }

    /// Reconcile every queued run on the calling task until the queue is
    /// empty. Stops at the first failure.
    pub async fn drain(&self) -> Result<usize> {
        let mut reconciled = 0;
        while let Some(run_id) = self.queue.try_pop().await {
            let result = self.check_jobs_of_run(run_id).await;
            self.queue.release(run_id).await;
            result?;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Start the reconcile workers. They stop once `shutdown` turns true.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let workers = self.config.emitter_workers.max(1);
        info!(workers, "Starting job emitter");
        (0..workers)
            .map(|worker| {
                let emitter = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { emitter.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Emitter worker started");
        while !*shutdown.borrow() {
            let run_id = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                run_id = self.queue.pop() => run_id,
            };

            let result = self.check_jobs_of_run(run_id).await;
            self.queue.release(run_id).await;
            if let Err(e) = result {
                self.handle_failure(run_id, e);
            }
        }
        debug!(worker, "Emitter worker stopped");
    }

    fn handle_failure(&self, run_id: RunId, err: Error) {
        if matches!(err, Error::Contract(_) | Error::RunNotFound(_)) {
            error!(run_id = %run_id, error = %err, "Reconcile failed");
            return;
        }

        let backoff = self.config.retry_backoff();
        warn!(
            run_id = %run_id,
            error = %err,
            retry_in_ms = backoff.as_millis() as u64,
            "Reconcile failed, retrying"
        );
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            queue.push(run_id).await;
        });
    }
}
