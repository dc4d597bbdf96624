// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relays the execution events of a Gherkin test run to a remote report
//! collector.
//!
//! The test engine writes newline-delimited JSON events, which
//! `scenario-relay run` reads from a file or standard input. Each finished test
//! case is uploaded along with its artifacts, and failures the collector
//! diagnoses can be repaired automatically once the run is over.
//!
//! The process exits with 0 if the final verdict is PASSED, and 1 otherwise.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
