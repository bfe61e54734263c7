//! Queries on the `tasks`, `task_steps` and `task_outputs` tables.

use super::db_err;
use gantry_core::ids::{JobId, OwnerId, RepoId, RunnerId, TaskId};
use gantry_core::task::{Task, TaskColumn, TaskOutput, TaskStep};
use gantry_core::{Result, Status};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};

const COLUMNS: &str = "id, job_id, attempt, runner_id, status, repo_id, owner_id, commit_sha, \
     is_fork_pull_request, token_hash, token_salt, token_last_eight, log_filename, \
     log_in_storage, log_length, log_size, log_expired, started, stopped, created, updated";

fn row_to_task(r: &PgRow) -> Task {
    Task {
        id: TaskId::new(r.get("id")),
        job_id: JobId::new(r.get("job_id")),
        attempt: r.get("attempt"),
        runner_id: RunnerId::new(r.get("runner_id")),
        status: Status::from_i16(r.get("status")),
        repo_id: RepoId::new(r.get("repo_id")),
        owner_id: OwnerId::new(r.get("owner_id")),
        commit_sha: r.get("commit_sha"),
        is_fork_pull_request: r.get("is_fork_pull_request"),
        token: None,
        token_hash: r.get("token_hash"),
        token_salt: r.get("token_salt"),
        token_last_eight: r.get("token_last_eight"),
        log_filename: r.get("log_filename"),
        log_in_storage: r.get("log_in_storage"),
        log_length: r.get("log_length"),
        log_size: r.get("log_size"),
        log_expired: r.get("log_expired"),
        started: r.get("started"),
        stopped: r.get("stopped"),
        created: r.get("created"),
        updated: r.get("updated"),
    }
}

pub async fn get(conn: &mut PgConnection, id: TaskId) -> Result<Option<Task>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tasks WHERE id = $1"))
        .bind(id.get())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;

    Ok(row.as_ref().map(row_to_task))
}

/// Insert `task`. A second task for the same job attempt is rejected with
/// [`gantry_core::Error::Conflict`].
pub async fn insert(conn: &mut PgConnection, task: &mut Task) -> Result<TaskId> {
    let row = sqlx::query(
        r#"INSERT INTO tasks (job_id, attempt, runner_id, status, repo_id, owner_id, commit_sha,
               is_fork_pull_request, token_hash, token_salt, token_last_eight, log_filename,
               log_in_storage, log_length, log_size, log_expired, started, stopped)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
           RETURNING id, created, updated"#,
    )
    .bind(task.job_id.get())
    .bind(task.attempt)
    .bind(task.runner_id.get())
    .bind(task.status.as_i16())
    .bind(task.repo_id.get())
    .bind(task.owner_id.get())
    .bind(&task.commit_sha)
    .bind(task.is_fork_pull_request)
    .bind(&task.token_hash)
    .bind(&task.token_salt)
    .bind(&task.token_last_eight)
    .bind(&task.log_filename)
    .bind(task.log_in_storage)
    .bind(task.log_length)
    .bind(task.log_size)
    .bind(task.log_expired)
    .bind(task.started)
    .bind(task.stopped)
    .fetch_one(conn)
    .await
    .map_err(db_err)?;

    task.id = TaskId::new(row.get("id"));
    task.created = row.get("created");
    task.updated = row.get("updated");
    Ok(task.id)
}

pub async fn update(conn: &mut PgConnection, task: &Task, columns: &[TaskColumn]) -> Result<u64> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE tasks SET updated = NOW()");
    for column in columns {
        match column {
            TaskColumn::Status => {
                qb.push(", status = ").push_bind(task.status.as_i16());
            }
            TaskColumn::Stopped => {
                qb.push(", stopped = ").push_bind(task.stopped);
            }
            TaskColumn::LogFilename => {
                qb.push(", log_filename = ").push_bind(task.log_filename.clone());
            }
        }
    }
    qb.push(" WHERE id = ").push_bind(task.id.get());

    let result = qb.build().execute(conn).await.map_err(db_err)?;
    Ok(result.rows_affected())
}

pub async fn find_running_by_token_suffix(
    conn: &mut PgConnection,
    last_eight: &str,
) -> Result<Vec<Task>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM tasks WHERE token_last_eight = $1 AND status = $2 ORDER BY id"
    ))
    .bind(last_eight)
    .bind(Status::Running.as_i16())
    .fetch_all(conn)
    .await
    .map_err(db_err)?;

    Ok(rows.iter().map(row_to_task).collect())
}

pub async fn insert_steps(conn: &mut PgConnection, steps: &[TaskStep]) -> Result<()> {
    if steps.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO task_steps (task_id, repo_id, step_index, name, status) ",
    );
    qb.push_values(steps, |mut b, step| {
        b.push_bind(step.task_id.get())
            .push_bind(step.repo_id.get())
            .push_bind(step.index)
            .push_bind(step.name.clone())
            .push_bind(step.status.as_i16());
    });

    qb.build().execute(conn).await.map_err(db_err)?;
    Ok(())
}

pub async fn insert_outputs(conn: &mut PgConnection, outputs: &[TaskOutput]) -> Result<()> {
    if outputs.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO task_outputs (task_id, output_key, output_value) ",
    );
    qb.push_values(outputs, |mut b, output| {
        b.push_bind(output.task_id.get())
            .push_bind(output.key.clone())
            .push_bind(output.value.clone());
    });
    qb.push(" ON CONFLICT (task_id, output_key) DO NOTHING");

    qb.build().execute(conn).await.map_err(db_err)?;
    Ok(())
}

pub async fn list_outputs(conn: &mut PgConnection, task_id: TaskId) -> Result<Vec<TaskOutput>> {
    let rows = sqlx::query(
        "SELECT task_id, output_key, output_value FROM task_outputs WHERE task_id = $1 ORDER BY id",
    )
    .bind(task_id.get())
    .fetch_all(conn)
    .await
    .map_err(db_err)?;

    Ok(rows
        .iter()
        .map(|r| TaskOutput {
            task_id: TaskId::new(r.get("task_id")),
            key: r.get("output_key"),
            value: r.get("output_value"),
        })
        .collect())
}
