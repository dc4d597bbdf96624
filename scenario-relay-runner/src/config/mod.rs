// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for scenario-relay.
//!
//! Configuration is layered, lowest priority first:
//!
//! * the default config embedded in the binary ([`RelayConfig::DEFAULT_CONFIG`]),
//! * a TOML file, by default [`RelayConfig::CONFIG_PATH`] (optional),
//! * `SCENARIO_RELAY_*` environment variables,
//! * command-line flags, applied by the caller after loading.

mod elements;
mod imp;

pub use elements::*;
pub use imp::*;
