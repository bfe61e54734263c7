//! Queries on the `trust_grants` table.

use super::db_err;
use gantry_core::ids::{RepoId, UserId};
use gantry_core::trust::TrustGrant;
use gantry_core::Result;
use sqlx::{PgConnection, Row};

pub async fn get(
    conn: &mut PgConnection,
    user_id: UserId,
    repo_id: RepoId,
) -> Result<Option<TrustGrant>> {
    let row = sqlx::query(
        "SELECT user_id, repo_id, trusted_with_pull_requests, last_access \
         FROM trust_grants WHERE user_id = $1 AND repo_id = $2",
    )
    .bind(user_id.get())
    .bind(repo_id.get())
    .fetch_optional(conn)
    .await
    .map_err(db_err)?;

    Ok(row.map(|r| TrustGrant {
        user_id: UserId::new(r.get("user_id")),
        repo_id: RepoId::new(r.get("repo_id")),
        trusted_with_pull_requests: r.get("trusted_with_pull_requests"),
        last_access: r.get("last_access"),
    }))
}

pub async fn upsert(conn: &mut PgConnection, grant: &TrustGrant) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO trust_grants (user_id, repo_id, trusted_with_pull_requests, last_access)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (user_id, repo_id) DO UPDATE
           SET trusted_with_pull_requests = EXCLUDED.trusted_with_pull_requests,
               last_access = EXCLUDED.last_access"#,
    )
    .bind(grant.user_id.get())
    .bind(grant.repo_id.get())
    .bind(grant.trusted_with_pull_requests)
    .bind(grant.last_access)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn delete(conn: &mut PgConnection, user_id: UserId, repo_id: RepoId) -> Result<u64> {
    let result = sqlx::query("DELETE FROM trust_grants WHERE user_id = $1 AND repo_id = $2")
        .bind(user_id.get())
        .bind(repo_id.get())
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(result.rows_affected())
}
