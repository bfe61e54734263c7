//! Queue-behind admission rule shared by every store adapter.

use crate::run::{ConcurrencyType, Run};

/// Whether `other` keeps the jobs of `candidate` from being picked up.
///
/// Only runs of the same repository and concurrency group block each other.
/// A blocking run is either running, or unfinished and older. The running
/// case lets a rerun of an older run hold back newer ones, which index order
/// alone cannot express.
pub fn blocks(other: &Run, candidate: &Run) -> bool {
    other.id != candidate.id
        && other.repo_id == candidate.repo_id
        && other.concurrency_group == candidate.concurrency_group
        && (other.status.is_running() || (!other.status.is_done() && other.index < candidate.index))
}

/// Whether the jobs of `candidate` may be dispatched given the other runs
/// known to the store.
pub fn is_admitted<'a, I>(candidate: &Run, runs: I) -> bool
where
    I: IntoIterator<Item = &'a Run>,
{
    if candidate.concurrency_group.is_empty()
        || candidate.concurrency_type != ConcurrencyType::QueueBehind
    {
        return true;
    }
    !runs.into_iter().any(|other| blocks(other, candidate))
}
