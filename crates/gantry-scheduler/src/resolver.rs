//! Status propagation along `needs`.

use gantry_core::ids::JobId;
use gantry_core::job::RunJob;
use gantry_core::{Result, Status};
use std::collections::{BTreeMap, HashMap};

/// Computes which blocked jobs of one run can move on, given the statuses of
/// the jobs they need.
///
/// A `needs` entry names a workflow-local job id, which every expanded
/// sibling and rerun of that job shares, so a job waits for all rows
/// carrying the id. Jobs caught in a `needs` cycle never resolve.
pub struct JobStatusResolver<'a> {
    statuses: BTreeMap<JobId, Status>,
    needs: HashMap<JobId, Vec<JobId>>,
    jobs: HashMap<JobId, &'a RunJob>,
}

impl<'a> JobStatusResolver<'a> {
    pub fn new(jobs: &'a [RunJob]) -> Self {
        let mut by_job_id: HashMap<&str, Vec<JobId>> = HashMap::new();
        for job in jobs {
            by_job_id.entry(job.job_id.as_str()).or_default().push(job.id);
        }

        let mut needs = HashMap::with_capacity(jobs.len());
        for job in jobs {
            let rows: Vec<JobId> = job
                .needs
                .iter()
                .filter_map(|need| by_job_id.get(need.as_str()))
                .flatten()
                .copied()
                .collect();
            needs.insert(job.id, rows);
        }

        Self {
            statuses: jobs.iter().map(|j| (j.id, j.status)).collect(),
            needs,
            jobs: jobs.iter().map(|j| (j.id, j)).collect(),
        }
    }

    /// New statuses keyed by job row, empty when nothing changes.
    ///
    /// Runs at most one pass per job, so a chain of blocked jobs resolves in
    /// a single call; stops early once a pass changes nothing.
    pub fn resolve(mut self) -> Result<BTreeMap<JobId, Status>> {
        let mut resolved = BTreeMap::new();
        for _ in 0..self.statuses.len() {
            let updated = self.step()?;
            if updated.is_empty() {
                break;
            }
            for (id, status) in updated {
                resolved.insert(id, status);
                self.statuses.insert(id, status);
            }
        }
        Ok(resolved)
    }

    fn step(&self) -> Result<BTreeMap<JobId, Status>> {
        let mut updated = BTreeMap::new();
        for (&id, status) in &self.statuses {
            if !status.is_blocked() {
                continue;
            }

            let mut all_done = true;
            let mut all_succeeded = true;
            for need in self.needs.get(&id).into_iter().flatten() {
                let need_status = self.statuses.get(need).copied().unwrap_or_default();
                all_done &= need_status.is_done();
                all_succeeded &= !need_status.is_unsuccessful();
            }
            if !all_done {
                continue;
            }

            let next = if let Some(job) = self.jobs.get(&id)
                && job.is_workflow_call_outer_job()?
            {
                settle_outer_job(job, all_succeeded)?
            } else if all_succeeded || self.has_if_condition(id)? {
                // the runner evaluates the condition
                Status::Waiting
            } else {
                Status::Skipped
            };
            updated.insert(id, next);
        }
        Ok(updated)
    }

    fn has_if_condition(&self, id: JobId) -> Result<bool> {
        match self.jobs.get(&id) {
            Some(job) => job.has_if_condition(),
            None => Ok(false),
        }
    }
}

/// Status of a reusable workflow call once its inner jobs are done. A call
/// whose own definition still depends on outputs goes back through
/// expansion first.
fn settle_outer_job(job: &RunJob, all_succeeded: bool) -> Result<Status> {
    if !all_succeeded {
        return Ok(Status::Failure);
    }
    let (incomplete_matrix, _) = job.has_incomplete_matrix()?;
    let (incomplete_with, _, _) = job.has_incomplete_with()?;
    Ok(if incomplete_matrix || incomplete_with {
        Status::Waiting
    } else {
        Status::Success
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn job(id: i64, job_id: &str, needs: &[&str], status: Status) -> RunJob {
        let mut job = RunJob::default();
        job.id = JobId::new(id);
        job.job_id = job_id.into();
        job.needs = needs.iter().map(|n| n.to_string()).collect();
        job.status = status;
        job.workflow_payload = format!("jobs:\n  {job_id}:\n    runs-on: linux\n").into_bytes();
        job
    }

    fn with_if(mut job: RunJob, condition: &str) -> RunJob {
        job.workflow_payload =
            format!("jobs:\n  {}:\n    if: {condition}\n", job.job_id).into_bytes();
        job
    }

    fn outer(mut job: RunJob, extra: &str) -> RunJob {
        job.workflow_payload = format!(
            "jobs:\n  {0}:\n    workflow-call:\n      id: {0}\n{extra}",
            job.job_id
        )
        .into_bytes();
        job
    }

    fn resolve(jobs: &[RunJob]) -> BTreeMap<JobId, Status> {
        JobStatusResolver::new(jobs).resolve().unwrap()
    }

    #[test]
    fn test_failed_need_skips_job_without_condition() {
        let jobs = vec![
            job(1, "a", &[], Status::Failure),
            job(2, "b", &["a"], Status::Blocked),
        ];
        assert_eq!(resolve(&jobs), BTreeMap::from([(JobId::new(2), Status::Skipped)]));
    }

    #[test]
    fn test_failed_need_leaves_conditional_job_to_runner() {
        let jobs = vec![
            job(1, "a", &[], Status::Failure),
            with_if(job(2, "b", &["a"], Status::Blocked), "always()"),
        ];
        assert_eq!(resolve(&jobs), BTreeMap::from([(JobId::new(2), Status::Waiting)]));
    }

    #[test]
    fn test_cancelled_need_counts_as_unsuccessful() {
        let jobs = vec![
            job(1, "a", &[], Status::Cancelled),
            job(2, "b", &["a"], Status::Blocked),
        ];
        assert_eq!(resolve(&jobs), BTreeMap::from([(JobId::new(2), Status::Skipped)]));
    }

    #[test]
    fn test_chain_resolves_in_one_call() {
        let jobs = vec![
            job(1, "a", &[], Status::Failure),
            job(2, "b", &["a"], Status::Blocked),
            job(3, "c", &["b"], Status::Blocked),
            with_if(job(4, "d", &["c"], Status::Blocked), "failure()"),
        ];
        assert_eq!(
            resolve(&jobs),
            BTreeMap::from([
                (JobId::new(2), Status::Skipped),
                (JobId::new(3), Status::Skipped),
                (JobId::new(4), Status::Waiting),
            ])
        );
    }

    #[test]
    fn test_waits_for_every_row_sharing_a_job_id() {
        let mut jobs = vec![
            job(1, "build", &[], Status::Success),
            job(2, "build", &[], Status::Running),
            job(3, "test", &["build"], Status::Blocked),
        ];
        assert!(resolve(&jobs).is_empty());

        jobs[1].status = Status::Success;
        assert_eq!(resolve(&jobs), BTreeMap::from([(JobId::new(3), Status::Waiting)]));
    }

    #[test]
    fn test_unfinished_need_keeps_job_blocked() {
        let jobs = vec![
            job(1, "a", &[], Status::Waiting),
            job(2, "b", &["a"], Status::Blocked),
        ];
        assert!(resolve(&jobs).is_empty());
    }

    #[test]
    fn test_cycle_never_resolves() {
        let jobs = vec![
            job(1, "a", &[], Status::Success),
            job(2, "b", &["a", "c"], Status::Blocked),
            job(3, "c", &["b"], Status::Blocked),
        ];
        assert!(resolve(&jobs).is_empty());
        assert!(resolve(&jobs).is_empty());
    }

    #[test]
    fn test_fixed_point_has_no_resolvable_blocked_job() {
        let mut jobs = vec![
            job(1, "a", &[], Status::Success),
            job(2, "b", &["a"], Status::Blocked),
            job(3, "c", &["a", "b"], Status::Blocked),
            job(4, "d", &["c"], Status::Blocked),
        ];
        let first = resolve(&jobs);
        assert_eq!(
            first,
            BTreeMap::from([(JobId::new(2), Status::Waiting)])
        );

        for job in &mut jobs {
            if let Some(status) = first.get(&job.id) {
                job.status = *status;
            }
        }
        assert!(resolve(&jobs).is_empty());
    }

    #[test]
    fn test_outer_job_settles_from_inner_jobs() {
        let jobs = vec![
            job(1, "call-build", &[], Status::Success),
            job(2, "call-test", &[], Status::Skipped),
            outer(job(3, "call", &["call-build", "call-test"], Status::Blocked), ""),
        ];
        assert_eq!(resolve(&jobs), BTreeMap::from([(JobId::new(3), Status::Failure)]));

        let jobs = vec![
            job(1, "call-build", &[], Status::Success),
            outer(job(3, "call", &["call-build"], Status::Blocked), ""),
            job(4, "deploy", &["call"], Status::Blocked),
        ];
        assert_eq!(
            resolve(&jobs),
            BTreeMap::from([
                (JobId::new(3), Status::Success),
                (JobId::new(4), Status::Waiting),
            ])
        );
    }

    #[test]
    fn test_failed_outer_job_ignores_if_condition() {
        let jobs = vec![
            job(1, "call-build", &[], Status::Failure),
            outer(
                job(2, "call", &["call-build"], Status::Blocked),
                "    if: always()\n",
            ),
        ];
        assert_eq!(resolve(&jobs), BTreeMap::from([(JobId::new(2), Status::Failure)]));
    }

    #[test]
    fn test_incomplete_outer_job_waits_for_expansion() {
        let jobs = vec![
            job(1, "setup", &[], Status::Success),
            outer(
                job(2, "call", &["setup"], Status::Blocked),
                "incomplete_with: true\nincomplete_with_needs:\n  job: setup\n",
            ),
        ];
        assert_eq!(resolve(&jobs), BTreeMap::from([(JobId::new(2), Status::Waiting)]));
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let mut broken = job(2, "b", &["a"], Status::Blocked);
        broken.workflow_payload = b"jobs: [".to_vec();
        let jobs = vec![job(1, "a", &[], Status::Failure), broken];

        assert!(JobStatusResolver::new(&jobs).resolve().is_err());
    }
}
