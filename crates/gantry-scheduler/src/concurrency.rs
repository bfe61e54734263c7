//! Concurrency group assignment at run creation.
//!
//! Queue-behind admission at dispatch time is evaluated by the store, see
//! [`gantry_core::concurrency::is_admitted`].

use crate::runs::kill_run;
use gantry_core::ports::Transaction;
use gantry_core::run::{ConcurrencyType, Run, RunFilter};
use gantry_core::{Result, RunId, Status};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Evaluated `concurrency` declaration of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySpec {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default, rename = "cancel-in-progress")]
    pub cancel_in_progress: Option<bool>,
}

/// Set the concurrency group and discipline of a new run.
pub fn configure_run_concurrency(run: &mut Run, spec: Option<&ConcurrencySpec>) {
    let group = spec
        .and_then(|s| s.group.as_deref())
        .map(str::trim)
        .filter(|g| !g.is_empty());
    match group {
        Some(group) => run.set_concurrency_group(group),
        None => run.set_default_concurrency_group(),
    }

    run.concurrency_type = match spec.and_then(|s| s.cancel_in_progress) {
        None if run.event.cancels_in_progress_by_default() => ConcurrencyType::CancelInProgress,
        None => ConcurrencyType::Unlimited,
        Some(true) => ConcurrencyType::CancelInProgress,
        Some(false) if group.is_some() => ConcurrencyType::QueueBehind,
        Some(false) => ConcurrencyType::Unlimited,
    };
}

/// Cancel the unfinished runs sharing the repository and concurrency group
/// of `run`. Returns the cancelled run ids.
pub async fn cancel_previous_with_concurrency_group(
    tx: &mut dyn Transaction,
    run: &Run,
) -> Result<Vec<RunId>> {
    let filter = RunFilter {
        concurrency_group: Some(run.concurrency_group.clone()),
        ..RunFilter::repo(run.repo_id).not_done()
    };

    let mut cancelled = Vec::new();
    for mut previous in tx.find_runs(&filter).await? {
        if previous.id == run.id {
            continue;
        }
        kill_run(tx, &mut previous, Status::Cancelled).await?;
        cancelled.push(previous.id);
    }

    if !cancelled.is_empty() {
        info!(
            repo_id = %run.repo_id,
            group = %run.concurrency_group,
            count = cancelled.len(),
            "Cancelled previous runs of concurrency group"
        );
    }
    Ok(cancelled)
}
