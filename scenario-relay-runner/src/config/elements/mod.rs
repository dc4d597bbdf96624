// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration elements for scenario-relay.

mod retry_policy;

pub use retry_policy::*;
