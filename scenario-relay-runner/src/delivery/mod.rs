// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reliable delivery of test cases and artifacts to the remote collector.
//!
//! The collector is reached through a blocking [`CollectorTransport`]. The
//! [`DeliveryPipeline`] drives it from blocking tasks and layers retries,
//! backoff and bounded artifact concurrency on top.

mod pipeline;
mod transport;

pub use pipeline::*;
pub use transport::*;
