// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! State shared by every component of a single run.

use scenario_relay_metadata::collector::RunHandle;
use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{OnceCell, watch};
use tracing::debug;

/// Correlation ids, in-flight deliveries and recovery bookkeeping for one run.
///
/// Constructed once per run and shared by `Arc`.
#[derive(Debug)]
pub struct RunContext {
    run: OnceCell<RunHandle>,
    completion: watch::Sender<CompletionState>,
    next_delivery: AtomicU64,
    ledger: Mutex<AttemptLedger>,
}

#[derive(Debug, Default)]
struct CompletionState {
    /// Test case ids currently being delivered, keyed by delivery number.
    in_flight: BTreeMap<u64, String>,
    finished: bool,
}

impl RunContext {
    /// Creates a new context.
    ///
    /// `preset_run` is the remote run to reuse, for example when this process
    /// re-runs a scenario of an earlier run. `previous_attempts` are the step
    /// indices that earlier pass already tried to repair.
    pub fn new(
        preset_run: Option<RunHandle>,
        previous_attempts: impl IntoIterator<Item = usize>,
    ) -> Self {
        let (completion, _) = watch::channel(CompletionState::default());
        Self {
            run: OnceCell::new_with(preset_run),
            completion,
            next_delivery: AtomicU64::new(0),
            ledger: Mutex::new(AttemptLedger::new(previous_attempts)),
        }
    }

    /// Returns the remote run, if it has been created.
    pub fn run(&self) -> Option<&RunHandle> {
        self.run.get()
    }

    /// Returns the remote run, creating it with `create` the first time.
    ///
    /// Concurrent callers wait for the first creation instead of creating
    /// runs of their own.
    pub async fn get_or_create_run<F, Fut, E>(&self, create: F) -> Result<&RunHandle, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RunHandle, E>>,
    {
        self.run.get_or_try_init(create).await
    }

    /// Marks a test case as being delivered until the returned guard is dropped.
    pub fn begin_delivery(self: &Arc<Self>, test_case_id: impl Into<String>) -> InFlightGuard {
        let key = self.next_delivery.fetch_add(1, Ordering::Relaxed);
        let test_case_id = test_case_id.into();
        debug!(id = %test_case_id, "delivery started");
        self.completion.send_modify(|state| {
            state.in_flight.insert(key, test_case_id);
        });
        InFlightGuard {
            context: Arc::clone(self),
            key,
        }
    }

    /// Returns the ids of the test cases currently being delivered.
    pub fn in_flight(&self) -> Vec<String> {
        self.completion.borrow().in_flight.values().cloned().collect()
    }

    /// Records that the run, including recovery, is over.
    pub fn mark_finished(&self) {
        self.completion.send_modify(|state| state.finished = true);
    }

    /// Returns true once [`Self::mark_finished`] has been called.
    pub fn is_finished(&self) -> bool {
        self.completion.borrow().finished
    }

    /// Waits until no deliveries are in flight.
    pub async fn wait_for_deliveries(&self) {
        self.wait_until(|state| state.in_flight.is_empty()).await;
    }

    /// Waits until the run is marked finished and no deliveries are in flight.
    pub async fn wait_for_completion(&self) {
        self.wait_until(|state| state.finished && state.in_flight.is_empty())
            .await;
    }

    async fn wait_until(&self, mut done: impl FnMut(&CompletionState) -> bool) {
        let mut receiver = self.completion.subscribe();
        // The sender lives in `self`, so this can't observe a closed channel.
        let _ = receiver.wait_for(|state| done(state)).await;
    }

    /// Locks the ledger of attempted repairs.
    pub fn ledger(&self) -> MutexGuard<'_, AttemptLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a test case in the in-flight set of a [`RunContext`].
#[derive(Debug)]
#[must_use = "the delivery is only tracked while the guard is alive"]
pub struct InFlightGuard {
    context: Arc<RunContext>,
    key: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.context.completion.send_modify(|state| {
            if let Some(id) = state.in_flight.remove(&self.key) {
                debug!(%id, "delivery finished");
            }
        });
    }
}

/// Tracks which failing steps have already been sent for repair.
///
/// Indices attempted by a previous pass of the same run are consumed
/// front-to-back: a failure at the index at the front of the queue is skipped
/// and the index is dropped from the queue. Within this pass a step of a given
/// test case is attempted at most once; other test cases failing at the same
/// index are attempted independently.
#[derive(Clone, Debug, Default)]
pub struct AttemptLedger {
    previous: VecDeque<usize>,
    this_pass: Vec<(String, usize)>,
    attempted: Vec<usize>,
}

impl AttemptLedger {
    /// Creates a ledger seeded with a previous pass's attempts.
    pub fn new(previous: impl IntoIterator<Item = usize>) -> Self {
        Self {
            previous: previous.into_iter().collect(),
            this_pass: Vec::new(),
            attempted: Vec::new(),
        }
    }

    /// Returns true if step `step_index` of `test_case_id` should be attempted,
    /// recording it if so.
    pub fn try_attempt(&mut self, test_case_id: &str, step_index: usize) -> bool {
        if self.previous.front() == Some(&step_index) {
            self.previous.pop_front();
            self.attempted.push(step_index);
            return false;
        }
        let already = self
            .this_pass
            .iter()
            .any(|(id, index)| id == test_case_id && *index == step_index);
        if already {
            return false;
        }
        self.this_pass.push((test_case_id.to_owned(), step_index));
        self.attempted.push(step_index);
        true
    }

    /// Returns every index attempted so far, in order, including those from
    /// previous passes that were consumed. This is the queue handed to the
    /// next pass.
    pub fn attempted(&self) -> &[usize] {
        &self.attempted
    }
}
