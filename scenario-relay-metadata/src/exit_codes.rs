// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `scenario-relay` runs.
///
/// The collector-facing contract only distinguishes success from failure, so
/// every failure mode maps to the same non-zero code. The named constants
/// document which conditions produce it.
pub enum RelayExitCode {}

impl RelayExitCode {
    /// The final verdict (after any recovery) was PASSED.
    pub const OK: i32 = 0;

    /// The final verdict was FAILED.
    pub const RUN_FAILED: i32 = 1;

    /// The collector rejected our credentials or the plan has run out.
    pub const UNAUTHORIZED: i32 = 1;

    /// The event stream broke its ordering contract (for example, a step
    /// finished before its test case started).
    pub const PROTOCOL_VIOLATION: i32 = 1;

    /// A user issue happened while setting up the relay (bad config, unreadable
    /// event stream).
    pub const SETUP_ERROR: i32 = 1;
}
