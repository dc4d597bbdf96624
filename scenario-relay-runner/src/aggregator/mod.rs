// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns the flat event stream into a hierarchical report.

mod imp;
mod local;
mod params;
mod side_channel;

pub use imp::*;
pub use params::{REDACTED, REDACTED_PREFIXES, TestData, redact};
pub use side_channel::MAX_LOG_ENTRIES;
