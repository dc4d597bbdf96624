// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{RepairCollaborator, RerunCollaborator, ScenarioTarget};
use crate::{
    delivery::DeliveryPipeline, errors::DisplayErrorChain, helpers::plural,
    run_context::RunContext,
};
use scenario_relay_metadata::report::{Report, RootCause, Status};
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

/// Where the orchestrator is in the run lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    /// The run is in progress and root causes are being collected.
    Collecting,
    /// The run finished; nothing has been decided yet.
    RunFinished,
    /// Recorded failures are being examined.
    Analyzing,
    /// Nothing to repair, or repair is disabled.
    NoRepairNeeded,
    /// Repairs are in progress.
    Repairing,
    /// The final verdict is known.
    Done,
}

/// The final verdict of a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunVerdict {
    /// Every test case passed, possibly after repair.
    Passed,
    /// The run failed.
    Failed,
}

impl RunVerdict {
    /// Returns true for [`Self::Passed`].
    pub fn is_success(self) -> bool {
        self == Self::Passed
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => f.write_str("PASSED"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

#[derive(Clone, Debug)]
struct RecordedFailure {
    test_case_id: String,
    step_index: usize,
}

/// Decides which failed test cases to repair once the run is over, and folds
/// repaired results back into the report.
///
/// Only unresolved root causes trigger repair. A test case that failed but
/// whose root cause is marked resolved is left alone.
#[derive(Debug)]
pub struct RecoveryOrchestrator<C> {
    collaborator: C,
    pipeline: Arc<DeliveryPipeline>,
    context: Arc<RunContext>,
    enabled: bool,
    state: RecoveryState,
    failures: Vec<RecordedFailure>,
}

impl<C> RecoveryOrchestrator<C>
where
    C: RepairCollaborator + RerunCollaborator,
{
    /// Creates a new orchestrator. With `enabled` unset, recorded failures are
    /// never repaired.
    pub fn new(
        collaborator: C,
        pipeline: Arc<DeliveryPipeline>,
        context: Arc<RunContext>,
        enabled: bool,
    ) -> Self {
        Self {
            collaborator,
            pipeline,
            context,
            enabled,
            state: RecoveryState::Collecting,
            failures: Vec::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Records the root cause the collector reported for a test case.
    pub fn record_root_cause(&mut self, test_case_id: &str, root_cause: RootCause) {
        if self.state != RecoveryState::Collecting {
            warn!(
                id = test_case_id,
                "root cause arrived after the run finished, ignoring it"
            );
            return;
        }
        if !root_cause.is_unresolved() {
            debug!(id = test_case_id, "root cause is resolved, not repairing");
            return;
        }

        debug!(
            id = test_case_id,
            step = root_cause.failed_step,
            class = %root_cause.fail_class,
            "recorded failure"
        );
        self.failures.push(RecordedFailure {
            test_case_id: test_case_id.to_owned(),
            step_index: root_cause.failed_step,
        });
    }

    /// Processes recorded failures and returns the final verdict.
    ///
    /// `run_succeeded` is the engine's own run-level verdict.
    pub async fn finish(&mut self, report: &mut Report, run_succeeded: bool) -> RunVerdict {
        self.transition(RecoveryState::RunFinished);
        let unchanged = if run_succeeded && report.result.status != Status::Failed {
            RunVerdict::Passed
        } else {
            RunVerdict::Failed
        };

        if self.failures.is_empty() || !self.enabled {
            if !self.failures.is_empty() {
                info!(
                    "recovery is disabled, not repairing {} {}",
                    self.failures.len(),
                    plural::failures_str(self.failures.len())
                );
            }
            self.transition(RecoveryState::NoRepairNeeded);
            self.transition(RecoveryState::Done);
            return unchanged;
        }

        self.transition(RecoveryState::Analyzing);
        let failures = std::mem::take(&mut self.failures);
        info!(
            "attempting to repair {} {}",
            failures.len(),
            plural::failures_str(failures.len())
        );

        self.transition(RecoveryState::Repairing);
        for failure in failures {
            self.repair(report, failure).await;
        }

        let all_recovered = report.test_cases.iter().all(|record| {
            matches!(record.result.status, Status::Passed | Status::FixedByAi)
        });
        if all_recovered {
            report.result.status = Status::Passed;
            report.result.message = None;
        }

        self.transition(RecoveryState::Done);
        if report.result.status == Status::Failed {
            RunVerdict::Failed
        } else {
            RunVerdict::Passed
        }
    }

    fn transition(&mut self, next: RecoveryState) {
        debug!("recovery: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    async fn repair(&self, report: &mut Report, failure: RecordedFailure) {
        let Some(record) = report
            .test_cases
            .iter_mut()
            .find(|record| record.id == failure.test_case_id)
        else {
            warn!(id = %failure.test_case_id, "no test case for recorded failure");
            return;
        };

        let step_index = failure.step_index;
        if !self.context.ledger().try_attempt(&record.id, step_index) {
            info!(
                id = %record.id,
                "step {step_index} was already sent for repair, skipping"
            );
            return;
        }

        let target = ScenarioTarget {
            uri: &record.uri,
            scenario: &record.scenario_name,
        };
        let stats = match self.collaborator.repair(target, step_index).await {
            Ok(stats) => stats,
            Err(error) => {
                warn!(
                    "failed to repair {}: {}",
                    record.scenario_name,
                    DisplayErrorChain::new(&error)
                );
                return;
            }
        };

        let repaired = stats.result.status == Status::Passed;
        record.retrain_stats = Some(stats);
        if repaired {
            record.result.status = Status::FixedByAi;
            if let Some(step) = record.steps.get_mut(step_index) {
                step.result.status = Status::FixedByAi;
            }
            info!("repaired {} at step {step_index}", record.scenario_name);
        }

        if let Some(run) = self.context.run() {
            self.pipeline.modify_test_case(run, record).await;
            if repaired {
                self.pipeline.update_project_analytics(&run.project_id).await;
            }
        }

        let attempted = self.context.ledger().attempted().to_vec();
        let target = ScenarioTarget {
            uri: &record.uri,
            scenario: &record.scenario_name,
        };
        if let Err(error) = self
            .collaborator
            .rerun(target, &attempted, self.context.run())
            .await
        {
            warn!(
                "failed to re-run {}: {}",
                record.scenario_name,
                DisplayErrorChain::new(&error)
            );
        }
    }
}
