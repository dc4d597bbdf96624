// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests for the relay, against an in-process collector and
//! repair engine.

mod delivery;
mod fixtures;
mod relay;
