//! Deduplicating work queue of runs to reconcile.

use gantry_core::RunId;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Queued, not picked up yet.
    Pending,
    /// Being reconciled by a worker.
    Running,
    /// Pushed again while being reconciled; queued again once released.
    RunningDirty,
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<RunId>,
    entries: HashMap<RunId, EntryState>,
}

/// Queue of run ids. Pushing a run that is already pending is a no-op, and
/// a run is handed to at most one worker at a time.
#[derive(Debug, Default)]
pub struct RunQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `run_id`. Returns whether a new entry was queued.
    pub async fn push(&self, run_id: RunId) -> bool {
        let mut state = self.state.lock().await;
        match state.entries.get(&run_id).copied() {
            Some(EntryState::Pending | EntryState::RunningDirty) => false,
            Some(EntryState::Running) => {
                state.entries.insert(run_id, EntryState::RunningDirty);
                false
            }
            None => {
                state.entries.insert(run_id, EntryState::Pending);
                state.order.push_back(run_id);
                drop(state);
                self.notify.notify_one();
                true
            }
        }
    }

    /// Next pending run, waiting until one is pushed. The caller must call
    /// [`RunQueue::release`] once done with it.
    pub async fn pop(&self) -> RunId {
        loop {
            let notified = self.notify.notified();
            if let Some(run_id) = self.try_pop().await {
                return run_id;
            }
            notified.await;
        }
    }

    pub async fn try_pop(&self) -> Option<RunId> {
        let mut state = self.state.lock().await;
        let run_id = state.order.pop_front()?;
        state.entries.insert(run_id, EntryState::Running);
        if !state.order.is_empty() {
            self.notify.notify_one();
        }
        Some(run_id)
    }

    /// Finish work on `run_id`, queueing it again if it was pushed
    /// meanwhile.
    pub async fn release(&self, run_id: RunId) {
        let mut state = self.state.lock().await;
        if state.entries.remove(&run_id) == Some(EntryState::RunningDirty) {
            state.entries.insert(run_id, EntryState::Pending);
            state.order.push_back(run_id);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of runs waiting to be picked up.
    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
