//! Queries on the `runs` table.

use super::db_err;
use gantry_core::ids::{OwnerId, PullRequestId, RepoId, RunId, UserId};
use gantry_core::preexec::PreExecutionError;
use gantry_core::run::{ConcurrencyType, Run, RunColumn, RunFilter, TriggerEvent};
use gantry_core::{Result, Status};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};

const COLUMNS: &str = "id, repo_id, owner_id, run_index, title, workflow_id, trigger_user_id, \
     git_ref, commit_sha, event, is_fork_pull_request, pull_request_id, pull_request_poster_id, \
     need_approval, approved_by, concurrency_group, concurrency_type, status, \
     pre_execution_error, started, stopped, created, updated";

fn row_to_run(r: &PgRow) -> Result<Run> {
    let pre_execution_error = r
        .get::<Option<serde_json::Value>, _>("pre_execution_error")
        .map(serde_json::from_value::<PreExecutionError>)
        .transpose()?;

    Ok(Run {
        id: RunId::new(r.get("id")),
        repo_id: RepoId::new(r.get("repo_id")),
        owner_id: OwnerId::new(r.get("owner_id")),
        index: r.get("run_index"),
        title: r.get("title"),
        workflow_id: r.get("workflow_id"),
        trigger_user_id: UserId::new(r.get("trigger_user_id")),
        git_ref: r.get("git_ref"),
        commit_sha: r.get("commit_sha"),
        event: TriggerEvent::parse(r.get::<&str, _>("event")),
        is_fork_pull_request: r.get("is_fork_pull_request"),
        pull_request_id: r.get::<Option<i64>, _>("pull_request_id").map(PullRequestId::new),
        pull_request_poster_id: r.get::<Option<i64>, _>("pull_request_poster_id").map(UserId::new),
        need_approval: r.get("need_approval"),
        approved_by: r.get::<Option<i64>, _>("approved_by").map(UserId::new),
        concurrency_group: r.get("concurrency_group"),
        concurrency_type: ConcurrencyType::from_i16(r.get("concurrency_type")),
        status: Status::from_i16(r.get("status")),
        pre_execution_error,
        started: r.get("started"),
        stopped: r.get("stopped"),
        created: r.get("created"),
        updated: r.get("updated"),
    })
}

fn pre_execution_error_json(run: &Run) -> Result<Option<serde_json::Value>> {
    Ok(run
        .pre_execution_error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?)
}

pub async fn get(conn: &mut PgConnection, id: RunId) -> Result<Option<Run>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM runs WHERE id = $1"))
        .bind(id.get())
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;

    row.as_ref().map(row_to_run).transpose()
}

/// Insert `run`, filling in its id, timestamps and, when unset, the next
/// index of its repository.
pub async fn insert(conn: &mut PgConnection, run: &mut Run) -> Result<RunId> {
    let row = sqlx::query(
        r#"INSERT INTO runs (repo_id, owner_id, run_index, title, workflow_id, trigger_user_id,
               git_ref, commit_sha, event, is_fork_pull_request, pull_request_id,
               pull_request_poster_id, need_approval, approved_by, concurrency_group,
               concurrency_type, status, pre_execution_error, started, stopped)
           VALUES ($1, $2,
               CASE WHEN $3 > 0 THEN $3
                    ELSE (SELECT COALESCE(MAX(run_index), 0) + 1 FROM runs WHERE repo_id = $1)
               END,
               $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
           RETURNING id, run_index, created, updated"#,
    )
    .bind(run.repo_id.get())
    .bind(run.owner_id.get())
    .bind(run.index)
    .bind(&run.title)
    .bind(&run.workflow_id)
    .bind(run.trigger_user_id.get())
    .bind(&run.git_ref)
    .bind(&run.commit_sha)
    .bind(run.event.as_str())
    .bind(run.is_fork_pull_request)
    .bind(run.pull_request_id.map(|id| id.get()))
    .bind(run.pull_request_poster_id.map(|id| id.get()))
    .bind(run.need_approval)
    .bind(run.approved_by.map(|id| id.get()))
    .bind(&run.concurrency_group)
    .bind(run.concurrency_type.as_i16())
    .bind(run.status.as_i16())
    .bind(pre_execution_error_json(run)?)
    .bind(run.started)
    .bind(run.stopped)
    .fetch_one(conn)
    .await
    .map_err(db_err)?;

    run.id = RunId::new(row.get("id"));
    run.index = row.get("run_index");
    run.created = row.get("created");
    run.updated = row.get("updated");
    Ok(run.id)
}

pub async fn update(conn: &mut PgConnection, run: &Run, columns: &[RunColumn]) -> Result<u64> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE runs SET updated = NOW()");
    for column in columns {
        match column {
            RunColumn::Status => {
                qb.push(", status = ").push_bind(run.status.as_i16());
            }
            RunColumn::Started => {
                qb.push(", started = ").push_bind(run.started);
            }
            RunColumn::Stopped => {
                qb.push(", stopped = ").push_bind(run.stopped);
            }
            RunColumn::PreExecutionError => {
                qb.push(", pre_execution_error = ")
                    .push_bind(pre_execution_error_json(run)?);
            }
            RunColumn::Approval => {
                qb.push(", need_approval = ").push_bind(run.need_approval);
                qb.push(", approved_by = ")
                    .push_bind(run.approved_by.map(|id| id.get()));
            }
        }
    }
    qb.push(" WHERE id = ").push_bind(run.id.get());

    let result = qb.build().execute(conn).await.map_err(db_err)?;
    Ok(result.rows_affected())
}

pub async fn find(conn: &mut PgConnection, filter: &RunFilter) -> Result<Vec<Run>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM runs WHERE TRUE"));
    if let Some(repo_id) = filter.repo_id {
        qb.push(" AND repo_id = ").push_bind(repo_id.get());
    }
    if let Some(group) = &filter.concurrency_group {
        qb.push(" AND concurrency_group = ").push_bind(group.clone());
    }
    if let Some(id) = filter.pull_request_id {
        qb.push(" AND pull_request_id = ").push_bind(id.get());
    }
    if let Some(id) = filter.pull_request_poster_id {
        qb.push(" AND pull_request_poster_id = ").push_bind(id.get());
    }
    if let Some(flag) = filter.need_approval {
        qb.push(" AND need_approval = ").push_bind(flag);
    }
    if !filter.statuses.is_empty() {
        let codes: Vec<i16> = filter.statuses.iter().map(Status::as_i16).collect();
        qb.push(" AND status = ANY(").push_bind(codes).push(")");
    }
    qb.push(" ORDER BY id");

    let rows = qb.build().fetch_all(conn).await.map_err(db_err)?;
    rows.iter().map(row_to_run).collect()
}
