//! Replacement of incomplete jobs once the jobs they need have finished.

use crate::runs::{fail_run_pre_execution_error, job_from_fragment, refresh_run_status};
use crate::workflow_call::find_task_needs;
use gantry_core::job::RunJob;
use gantry_core::ports::{Transaction, WorkflowParser};
use gantry_core::preexec::{PreExecutionError, PreExecutionErrorCode};
use gantry_core::run::Run;
use gantry_core::workflow::{IncompleteMatrix, IncompleteNeeds, JobOutputs, ParseOptions, SingleWorkflow};
use gantry_core::{Error, Result, Status};
use tracing::info;

/// What happened to a job handed to [`MatrixExpander::expand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// The job was complete and is left as is.
    Unchanged,
    /// The job was replaced by this many concrete jobs.
    Expanded(usize),
    /// The job can never be completed; the run was failed.
    Failed,
}

impl Expansion {
    /// Whether the job row was consumed and must not be updated further.
    pub fn is_consumed(&self) -> bool {
        *self != Expansion::Unchanged
    }
}

/// Re-evaluates jobs flagged incomplete with the outputs of the jobs they
/// need.
pub struct MatrixExpander<'a> {
    parser: &'a dyn WorkflowParser,
}

impl<'a> MatrixExpander<'a> {
    pub fn new(parser: &'a dyn WorkflowParser) -> Self {
        Self { parser }
    }

    /// Replace `job` by the concrete jobs its fragment now evaluates to.
    ///
    /// Every job named in `needs` must be done. The original row is deleted
    /// in the same transaction the replacements are inserted in.
    pub async fn expand(
        &self,
        tx: &mut dyn Transaction,
        run: &mut Run,
        job: &RunJob,
    ) -> Result<Expansion> {
        let (incomplete_matrix, _) = job.has_incomplete_matrix()?;
        let (incomplete_runs_on, _, _) = job.has_incomplete_runs_on()?;
        let (incomplete_with, _, _) = job.has_incomplete_with()?;
        if !incomplete_matrix && !incomplete_runs_on && !incomplete_with {
            return Ok(Expansion::Unchanged);
        }

        let outputs = self.needed_outputs(tx, job).await?;
        let options = ParseOptions::default()
            .with_job_outputs(outputs)
            .with_workflow_needs(job.needs.clone())
            .support_incomplete_runs_on();

        let workflows = match self.parser.parse(&job.workflow_payload, &options) {
            Ok(workflows) => workflows,
            Err(e) => {
                let err =
                    PreExecutionError::new(PreExecutionErrorCode::JobParsingError, [e.to_string()]);
                fail_run_pre_execution_error(tx, run, err).await?;
                return Ok(Expansion::Failed);
            }
        };

        for workflow in &workflows {
            if let Some((job_id, _)) = workflow.job()
                && job_id == job.job_id
                && workflow.is_incomplete()
            {
                let err = persistent_incomplete_error(job, workflow);
                fail_run_pre_execution_error(tx, run, err).await?;
                return Ok(Expansion::Failed);
            }
        }

        for workflow in &workflows {
            // a completed call still settles from its inner jobs
            let status = if workflow.is_workflow_call_outer() {
                Status::Blocked
            } else {
                Status::Waiting
            };
            let mut expanded = job_from_fragment(job, workflow, status)?;
            tx.insert_job(&mut expanded).await?;
        }
        let deleted = tx.delete_job(job.id).await?;
        if deleted != 1 {
            return Err(Error::Conflict(format!(
                "expected to delete job {}, deleted {deleted} rows",
                job.id
            )));
        }
        *run = refresh_run_status(tx, run.id).await?;

        info!(
            run_id = %run.id,
            job_id = %job.id,
            job = %job.job_id,
            inserted = workflows.len(),
            "Expanded incomplete job"
        );
        Ok(Expansion::Expanded(workflows.len()))
    }

    /// Outputs of every job in `needs`, which must all be done.
    async fn needed_outputs(&self, tx: &mut dyn Transaction, job: &RunJob) -> Result<JobOutputs> {
        let needs = find_task_needs(tx, job).await?;
        if let Some((name, need)) = needs.iter().find(|(_, need)| !need.result.is_done()) {
            return Err(Error::Contract(format!(
                "job {} needs {name} which is {}",
                job.id, need.result
            )));
        }
        Ok(needs
            .into_iter()
            .map(|(name, need)| (name, need.outputs))
            .collect())
    }
}

/// The most specific error for a job that is still incomplete after every
/// job it needs has finished.
fn persistent_incomplete_error(job: &RunJob, workflow: &SingleWorkflow) -> PreExecutionError {
    use PreExecutionErrorCode as Code;

    if workflow.incomplete_matrix {
        return match &workflow.incomplete_matrix_needs {
            Some(needs) => needs_error(
                job,
                needs,
                Code::IncompleteMatrixMissingJob,
                Code::IncompleteMatrixMissingOutput,
            ),
            None => PreExecutionError::new(
                Code::IncompleteMatrixUnknownCause,
                [job.job_id.clone()],
            ),
        };
    }

    if workflow.incomplete_runs_on {
        return cause_error(
            job,
            workflow.incomplete_runs_on_matrix.as_ref(),
            workflow.incomplete_runs_on_needs.as_ref(),
            [
                Code::IncompleteRunsOnMissingMatrixDimension,
                Code::IncompleteRunsOnMissingJob,
                Code::IncompleteRunsOnMissingOutput,
                Code::IncompleteRunsOnUnknownCause,
            ],
        );
    }

    cause_error(
        job,
        workflow.incomplete_with_matrix.as_ref(),
        workflow.incomplete_with_needs.as_ref(),
        [
            Code::IncompleteWithMissingMatrixDimension,
            Code::IncompleteWithMissingJob,
            Code::IncompleteWithMissingOutput,
            Code::IncompleteWithUnknownCause,
        ],
    )
}

/// `codes` holds the missing-dimension, missing-job, missing-output and
/// unknown-cause codes, in that order.
fn cause_error(
    job: &RunJob,
    matrix: Option<&IncompleteMatrix>,
    needs: Option<&IncompleteNeeds>,
    codes: [PreExecutionErrorCode; 4],
) -> PreExecutionError {
    let [missing_dimension, missing_job, missing_output, unknown] = codes;
    if let Some(matrix) = matrix {
        return PreExecutionError::new(
            missing_dimension,
            [job.job_id.clone(), matrix.dimension.clone()],
        );
    }
    match needs {
        Some(needs) => needs_error(job, needs, missing_job, missing_output),
        None => PreExecutionError::new(unknown, [job.job_id.clone()]),
    }
}

fn needs_error(
    job: &RunJob,
    needs: &IncompleteNeeds,
    missing_job: PreExecutionErrorCode,
    missing_output: PreExecutionErrorCode,
) -> PreExecutionError {
    if needs.output.is_empty() {
        PreExecutionError::new(
            missing_job,
            [job.job_id.clone(), needs.job.clone(), job.needs.join(", ")],
        )
    } else {
        PreExecutionError::new(
            missing_output,
            [job.job_id.clone(), needs.job.clone(), needs.output.clone()],
        )
    }
}
