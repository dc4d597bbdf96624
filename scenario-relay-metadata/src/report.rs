// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Report records assembled from the event stream and shipped to the collector.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// The status of a run, test case, step or command.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Unknown,
    Started,
    Passed,
    Failed,
    Skipped,
    Undefined,
    Ambiguous,
    Pending,
    FixedByAi,
}

impl Status {
    /// Returns the wire representation of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Started => "STARTED",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Undefined => "UNDEFINED",
            Self::Ambiguous => "AMBIGUOUS",
            Self::Pending => "PENDING",
            Self::FixedByAi => "FIXED_BY_AI",
        }
    }

    /// Returns true if this is a terminal status for a step.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unknown | Self::Started)
    }

    /// Returns true for the statuses that fail a test case even though the
    /// engine didn't report them as failures.
    pub fn is_incomplete(self) -> bool {
        matches!(self, Self::Ambiguous | Self::Undefined | Self::Pending)
    }

    /// Returns true if the run-level result may move from `self` to `next`.
    ///
    /// Run results only move forward: UNKNOWN → STARTED → {PASSED, FAILED},
    /// with FAILED also reachable straight from UNKNOWN.
    pub fn can_advance_to(self, next: Status) -> bool {
        match (self, next) {
            (Self::Unknown, Self::Started | Self::Failed) => true,
            (Self::Started, Self::Passed | Self::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status plus timing and an optional message.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub status: Status,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestResult {
    /// A result that hasn't been reported yet.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// A result that started at `start_time`.
    pub fn started(start_time: i64) -> Self {
        Self {
            status: Status::Started,
            start_time: Some(start_time),
            ..Self::default()
        }
    }

    /// A terminal result.
    pub fn finished(
        status: Status,
        start_time: Option<i64>,
        end_time: i64,
        message: Option<String>,
    ) -> Self {
        Self {
            status,
            start_time,
            end_time: Some(end_time),
            message,
        }
    }

    /// Returns true if the status is PASSED or FIXED_BY_AI.
    pub fn is_success(&self) -> bool {
        matches!(self.status, Status::Passed | Status::FixedByAi)
    }
}

/// How a step is classified by its keyword.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum StepKind {
    #[default]
    Unknown,
    Context,
    Action,
    Outcome,
    Conjunction,
}

/// Execution environment metadata.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunEnvironment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// A granular sub-action of a step, reported by the step implementation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub text: String,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub screenshot_id: Option<String>,
    pub result: TestResult,
}

impl CommandRecord {
    /// The command type used for commands synthesized for undefined steps.
    pub const UNDEFINED_STEP_KIND: &'static str = "undefinedStep";
}

/// A single step of a test case.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub keyword: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub text: String,
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
    pub result: TestResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_logs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aria_snapshot_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aria_snapshot_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_file_path: Option<String>,
}

impl StepRecord {
    /// Returns the first failed command, if any.
    pub fn first_failed_command(&self) -> Option<&CommandRecord> {
        self.commands
            .iter()
            .find(|command| command.result.status == Status::Failed)
    }
}

/// The report for a single test case attempt.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseRecord {
    pub id: String,
    pub uri: String,
    pub feature_name: String,
    pub scenario_name: String,
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    pub result: TestResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<RunEnvironment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_logs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_id: Option<String>,
    /// Trace recorded for the whole test case, relative to `trace/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrain_stats: Option<RetrainStats>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub integrations: IndexMap<String, serde_json::Value>,
}

impl TestCaseRecord {
    /// Computes the test case result from its steps.
    ///
    /// The first FAILED step wins with its message verbatim. Otherwise the
    /// first AMBIGUOUS, UNDEFINED or PENDING step fails the test case with a
    /// synthesized message. Otherwise the test case passed.
    pub fn rollup(&self) -> (Status, Option<String>) {
        if let Some(step) = self
            .steps
            .iter()
            .find(|step| step.result.status == Status::Failed)
        {
            return (Status::Failed, step.result.message.clone());
        }
        if let Some(step) = self
            .steps
            .iter()
            .find(|step| step.result.status.is_incomplete())
        {
            return (
                Status::Failed,
                Some(format!("step \"{}\" is {}", step.text, step.result.status)),
            );
        }
        (Status::Passed, None)
    }

    /// Returns the index of the first step that didn't pass.
    pub fn first_failing_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.result.status.is_terminal() && step.result.status != Status::Passed)
    }
}

/// The root report for a run.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub result: TestResult,
    pub test_cases: Vec<TestCaseRecord>,
    #[serde(default)]
    pub env: RunEnvironment,
}

/// Why a step failed, as classified by the collector's failure analysis.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RootCause {
    /// True if the failure is considered resolved.
    pub status: bool,
    #[serde(default)]
    pub analysis: String,
    /// Index of the first failing step.
    pub failed_step: usize,
    #[serde(default)]
    pub fail_class: String,
}

impl RootCause {
    /// Returns true if the failure still needs attention.
    pub fn is_unresolved(&self) -> bool {
        !self.status
    }
}

/// The outcome of an automated repair attempt.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrainStats {
    /// The result of the repaired test case.
    pub result: TestResult,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
    /// Fields the repair engine reports that the relay passes through as-is.
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

/// Accepts either a string or a number for identifiers.
fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        String(String),
        Number(serde_json::Number),
    }

    Ok(Option::<Id>::deserialize(deserializer)?.map(|id| match id {
        Id::String(s) => s,
        Id::Number(n) => n.to_string(),
    }))
}
