//! Queries on the `run_jobs` table.

use super::db_err;
use gantry_core::ids::{JobId, OwnerId, RepoId, RunId, TaskId};
use gantry_core::job::{JobColumn, JobGuard, RunJob};
use gantry_core::run::ConcurrencyType;
use gantry_core::task::RunnerScope;
use gantry_core::{Result, Status};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};

const COLUMNS: &str = "j.id, j.run_id, j.repo_id, j.owner_id, j.commit_sha, \
     j.is_fork_pull_request, j.name, j.attempt, j.workflow_payload, j.job_id, j.needs, \
     j.runs_on, j.task_id, j.status, j.started, j.stopped, j.created, j.updated";

fn row_to_job(r: &PgRow) -> RunJob {
    let task_id: i64 = r.get("task_id");

    let mut job = RunJob::default();
    job.id = JobId::new(r.get("id"));
    job.run_id = RunId::new(r.get("run_id"));
    job.repo_id = RepoId::new(r.get("repo_id"));
    job.owner_id = OwnerId::new(r.get("owner_id"));
    job.commit_sha = r.get("commit_sha");
    job.is_fork_pull_request = r.get("is_fork_pull_request");
    job.name = r.get("name");
    job.attempt = r.get("attempt");
    job.workflow_payload = r.get("workflow_payload");
    job.job_id = r.get("job_id");
    job.needs = r.get("needs");
    job.runs_on = r.get("runs_on");
    job.task_id = (task_id != 0).then(|| TaskId::new(task_id));
    job.status = Status::from_i16(r.get("status"));
    job.started = r.get("started");
    job.stopped = r.get("stopped");
    job.created = r.get("created");
    job.updated = r.get("updated");
    job
}

fn task_id_column(job: &RunJob) -> i64 {
    job.task_id.map_or(0, |id| id.get())
}

pub async fn get(conn: &mut PgConnection, id: JobId) -> Result<Option<RunJob>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM run_jobs j WHERE j.id = $1"))
        .bind(id.get())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;

    Ok(row.as_ref().map(row_to_job))
}

pub async fn list_by_run(conn: &mut PgConnection, run_id: RunId) -> Result<Vec<RunJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM run_jobs j WHERE j.run_id = $1 ORDER BY j.id"
    ))
    .bind(run_id.get())
    .fetch_all(conn)
    .await
    .map_err(db_err)?;

    Ok(rows.iter().map(row_to_job).collect())
}

pub async fn insert(conn: &mut PgConnection, job: &mut RunJob) -> Result<JobId> {
    let row = sqlx::query(
        r#"INSERT INTO run_jobs (run_id, repo_id, owner_id, commit_sha, is_fork_pull_request,
               name, attempt, workflow_payload, job_id, needs, runs_on, task_id, status,
               started, stopped)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
           RETURNING id, created, updated"#,
    )
    .bind(job.run_id.get())
    .bind(job.repo_id.get())
    .bind(job.owner_id.get())
    .bind(&job.commit_sha)
    .bind(job.is_fork_pull_request)
    .bind(&job.name)
    .bind(job.attempt)
    .bind(&job.workflow_payload)
    .bind(&job.job_id)
    .bind(&job.needs)
    .bind(&job.runs_on)
    .bind(task_id_column(job))
    .bind(job.status.as_i16())
    .bind(job.started)
    .bind(job.stopped)
    .fetch_one(conn)
    .await
    .map_err(db_err)?;

    job.id = JobId::new(row.get("id"));
    job.created = row.get("created");
    job.updated = row.get("updated");
    Ok(job.id)
}

pub async fn update(
    conn: &mut PgConnection,
    job: &RunJob,
    columns: &[JobColumn],
    guard: JobGuard,
) -> Result<u64> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE run_jobs SET updated = NOW()");
    for column in columns {
        match column {
            JobColumn::Status => {
                qb.push(", status = ").push_bind(job.status.as_i16());
            }
            JobColumn::Attempt => {
                qb.push(", attempt = ").push_bind(job.attempt);
            }
            JobColumn::TaskId => {
                qb.push(", task_id = ").push_bind(task_id_column(job));
            }
            JobColumn::Started => {
                qb.push(", started = ").push_bind(job.started);
            }
            JobColumn::Stopped => {
                qb.push(", stopped = ").push_bind(job.stopped);
            }
        }
    }
    qb.push(" WHERE id = ").push_bind(job.id.get());
    match guard {
        JobGuard::None => {}
        JobGuard::Status(status) => {
            qb.push(" AND status = ").push_bind(status.as_i16());
        }
        JobGuard::Unassigned => {
            qb.push(" AND task_id = 0");
        }
    }

    let result = qb.build().execute(conn).await.map_err(db_err)?;
    Ok(result.rows_affected())
}

pub async fn delete(conn: &mut PgConnection, id: JobId) -> Result<u64> {
    let result = sqlx::query("DELETE FROM run_jobs WHERE id = $1")
        .bind(id.get())
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(result.rows_affected())
}

/// Waiting, unassigned jobs visible to a runner of `scope`.
///
/// With `queue_behind` set, a job is left out when its run is a queue-behind
/// run and another run of the same repository and concurrency group is
/// running, or is unfinished with a lower index.
pub async fn list_available(
    conn: &mut PgConnection,
    scope: RunnerScope,
    queue_behind: bool,
) -> Result<Vec<RunJob>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT {COLUMNS} FROM run_jobs j JOIN runs r ON r.id = j.run_id WHERE j.task_id = 0 AND j.status = "
    ));
    qb.push_bind(Status::Waiting.as_i16());

    match scope {
        RunnerScope::Repository(repo_id) => {
            qb.push(" AND j.repo_id = ").push_bind(repo_id.get());
        }
        RunnerScope::Owner(owner_id) => {
            qb.push(" AND j.owner_id = ").push_bind(owner_id.get());
        }
        RunnerScope::Global => {}
    }

    if queue_behind {
        let not_done: Vec<i16> = Status::NOT_DONE.iter().map(Status::as_i16).collect();
        qb.push(" AND NOT (r.concurrency_group <> '' AND r.concurrency_type = ")
            .push_bind(ConcurrencyType::QueueBehind.as_i16())
            .push(
                " AND EXISTS (SELECT 1 FROM runs o WHERE o.id <> r.id \
                 AND o.repo_id = r.repo_id AND o.concurrency_group = r.concurrency_group \
                 AND (o.status = ",
            )
            .push_bind(Status::Running.as_i16())
            .push(" OR (o.run_index < r.run_index AND o.status = ANY(")
            .push_bind(not_done)
            .push(")))))");
    }

    qb.push(" ORDER BY j.updated, j.id");

    let rows = qb.build().fetch_all(conn).await.map_err(db_err)?;
    Ok(rows.iter().map(row_to_job).collect())
}
