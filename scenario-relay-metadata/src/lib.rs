// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured access to the data scenario-relay consumes and produces.
//!
//! * [`events`] describes the execution event stream read from the test engine.
//! * [`report`] describes the hierarchical report assembled from those events.
//! * [`collector`] describes the request and response bodies exchanged with the
//!   remote collector.
//!
//! This crate has no runtime behavior; it exists so that other tools can read
//! and write the same formats without depending on the relay itself.

pub mod collector;
pub mod events;
mod exit_codes;
pub mod report;

pub use exit_codes::*;
