// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Automated repair of failed test cases.
//!
//! While the run is in progress, the [`RecoveryOrchestrator`] collects the
//! root causes the collector reports for failed test cases. Once the run is
//! over, it sends each unresolved failure to a [`RepairCollaborator`], folds
//! the outcome back into the report and asks a [`RerunCollaborator`] to re-run
//! the scenario.

mod collaborator;
mod orchestrator;

pub use collaborator::*;
pub use orchestrator::*;
