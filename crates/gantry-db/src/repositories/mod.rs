//! Query functions per table.
//!
//! Each function runs on a borrowed connection so that callers decide the
//! transaction boundaries.

pub mod job;
pub mod run;
pub mod task;
pub mod trust;

use gantry_core::Error;

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => Error::Conflict(db.message().to_string()),
        _ => Error::Database(e.to_string()),
    }
}
