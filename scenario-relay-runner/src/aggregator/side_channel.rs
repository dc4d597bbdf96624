// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Out-of-band telemetry collected while a test case runs.
//!
//! Only one test case, and within it one step, is open at a time. Step-scoped
//! buffers are drained onto the step record when the step finishes; case-scoped
//! buffers are drained onto the test case record when the case finishes.

use indexmap::IndexMap;
use scenario_relay_metadata::report::{RetrainStats, StepRecord, TestCaseRecord};
use tracing::debug;

/// Maximum log and network entries kept per test case.
pub const MAX_LOG_ENTRIES: usize = 1000;

/// The kind of a capped telemetry entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Log,
    Network,
}

/// Where a telemetry entry belongs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    Step,
    Case,
}

#[derive(Debug, Default)]
struct StepBuffers {
    logs: Vec<serde_json::Value>,
    network_logs: Vec<serde_json::Value>,
    aria_snapshot_before: Option<String>,
    aria_snapshot_after: Option<String>,
    trace_file_path: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct SideChannel {
    /// `(test case started id, step index)` of the open step.
    current_step: Option<(String, usize)>,
    step: StepBuffers,
    case_logs: Vec<serde_json::Value>,
    case_network_logs: Vec<serde_json::Value>,
    /// Entries accepted in this test case, across scopes.
    window_entries: usize,
    case_log_text: String,
    pending_retrain: Option<RetrainStats>,
    /// Parameters as written, before template resolution and redaction.
    raw_parameters: IndexMap<String, String>,
}

impl SideChannel {
    pub(crate) fn begin_case(&mut self, raw_parameters: IndexMap<String, String>) {
        self.raw_parameters = raw_parameters;
    }

    pub(crate) fn begin_step(&mut self, started_id: &str, step_index: usize) {
        self.current_step = Some((started_id.to_owned(), step_index));
        self.step = StepBuffers::default();
    }

    pub(crate) fn current_step(&self) -> Option<(&str, usize)> {
        self.current_step
            .as_ref()
            .map(|(started_id, index)| (started_id.as_str(), *index))
    }

    pub(crate) fn raw_parameters(&self) -> &IndexMap<String, String> {
        &self.raw_parameters
    }

    /// Buffers a log or network entry, unless the test case has hit
    /// [`MAX_LOG_ENTRIES`].
    pub(crate) fn push_entry(&mut self, scope: Scope, kind: EntryKind, entry: serde_json::Value) {
        if self.window_entries >= MAX_LOG_ENTRIES {
            debug!(
                ?kind,
                "dropping telemetry entry: limit of {MAX_LOG_ENTRIES} per test case reached"
            );
            return;
        }
        self.window_entries += 1;

        let buffer = match (scope, kind) {
            (Scope::Step, EntryKind::Log) => &mut self.step.logs,
            (Scope::Step, EntryKind::Network) => &mut self.step.network_logs,
            (Scope::Case, EntryKind::Log) => &mut self.case_logs,
            (Scope::Case, EntryKind::Network) => &mut self.case_network_logs,
        };
        buffer.push(entry);
    }

    pub(crate) fn set_snapshot_before(&mut self, snapshot: String) {
        self.step.aria_snapshot_before = Some(snapshot);
    }

    pub(crate) fn set_snapshot_after(&mut self, snapshot: String) {
        self.step.aria_snapshot_after = Some(snapshot);
    }

    pub(crate) fn set_trace_file_path(&mut self, path: String) {
        self.step.trace_file_path = Some(path);
    }

    pub(crate) fn append_case_log(&mut self, text: &str) {
        self.case_log_text.push_str(text);
        if !text.ends_with('\n') {
            self.case_log_text.push('\n');
        }
    }

    pub(crate) fn set_pending_retrain(&mut self, stats: RetrainStats) {
        self.pending_retrain = Some(stats);
    }

    /// Moves the step-scoped buffers onto `step` and closes the open step.
    pub(crate) fn finish_step(&mut self, step: &mut StepRecord) {
        let buffers = std::mem::take(&mut self.step);
        step.logs.extend(buffers.logs);
        step.network_logs.extend(buffers.network_logs);
        if buffers.aria_snapshot_before.is_some() {
            step.aria_snapshot_before = buffers.aria_snapshot_before;
        }
        if buffers.aria_snapshot_after.is_some() {
            step.aria_snapshot_after = buffers.aria_snapshot_after;
        }
        if buffers.trace_file_path.is_some() {
            step.trace_file_path = buffers.trace_file_path;
        }
        self.current_step = None;
    }

    /// Moves the case-scoped buffers onto `record` and resets everything.
    ///
    /// Returns the case log text, if any was captured.
    pub(crate) fn finish_case(&mut self, record: &mut TestCaseRecord) -> Option<String> {
        let this = std::mem::take(self);
        record.logs.extend(this.case_logs);
        record.network_logs.extend(this.case_network_logs);
        if let Some(stats) = this.pending_retrain {
            record.retrain_stats = Some(stats);
        }
        (!this.case_log_text.is_empty()).then_some(this.case_log_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn step_buffers_are_per_step() {
        let mut channel = SideChannel::default();
        channel.begin_step("tcs-1", 0);
        channel.push_entry(Scope::Step, EntryKind::Log, json!({"msg": "first"}));
        channel.set_snapshot_after("- button \"Login\"".to_owned());

        let mut first = StepRecord::default();
        channel.finish_step(&mut first);
        assert_eq!(first.logs, vec![json!({"msg": "first"})]);
        assert_eq!(first.aria_snapshot_after.as_deref(), Some("- button \"Login\""));
        assert_eq!(channel.current_step(), None);

        channel.begin_step("tcs-1", 1);
        let mut second = StepRecord::default();
        channel.finish_step(&mut second);
        assert!(second.logs.is_empty());
        assert_eq!(second.aria_snapshot_after, None);
    }

    #[test]
    fn entries_are_capped_per_case() {
        let mut channel = SideChannel::default();
        for i in 0..MAX_LOG_ENTRIES + 10 {
            let kind = if i % 2 == 0 {
                EntryKind::Log
            } else {
                EntryKind::Network
            };
            channel.push_entry(Scope::Case, kind, json!(i));
        }

        let mut record = TestCaseRecord::default();
        assert_eq!(channel.finish_case(&mut record), None);
        assert_eq!(
            record.logs.len() + record.network_logs.len(),
            MAX_LOG_ENTRIES
        );

        // The window resets for the next test case.
        channel.push_entry(Scope::Case, EntryKind::Log, json!("next"));
        let mut next = TestCaseRecord::default();
        channel.finish_case(&mut next);
        assert_eq!(next.logs, vec![json!("next")]);
    }

    #[test]
    fn case_log_text_is_line_terminated() {
        let mut channel = SideChannel::default();
        channel.append_case_log("opened page");
        channel.append_case_log("clicked\n");
        let mut record = TestCaseRecord::default();
        assert_eq!(
            channel.finish_case(&mut record).as_deref(),
            Some("opened page\nclicked\n")
        );
    }
}
