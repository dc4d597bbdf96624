// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for scenario-relay.
//!
//! The flow of a run is:
//!
//! 1. The [`relay::Relay`] reads events produced by a Gherkin test engine and
//!    feeds them to an [`aggregator::EventAggregator`], which builds a
//!    hierarchical [`Report`](scenario_relay_metadata::report::Report).
//! 2. Each finished test case is handed to the [`delivery::DeliveryPipeline`],
//!    which uploads its artifacts and submits it to the remote collector,
//!    retrying transient failures.
//! 3. Once the run is over, the [`recovery::RecoveryOrchestrator`] tries to
//!    repair failures the collector diagnosed, and the final verdict is
//!    computed.
//!
//! Shared per-run state lives in a [`run_context::RunContext`].

pub mod aggregator;
pub mod config;
pub mod delivery;
pub mod errors;
mod helpers;
pub mod lookup;
pub mod recovery;
pub mod relay;
pub mod run_context;

pub use helpers::plural;
