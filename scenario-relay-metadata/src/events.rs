// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution events, as emitted by the test-execution engine.
//!
//! Events arrive one per line as externally tagged JSON envelopes, e.g.
//! `{"testCaseStarted": {"id": "...", ...}}`. Events refer to each other by
//! opaque identifier rather than by nesting.

use crate::report::{Status, StepKind};
use serde::{Deserialize, Serialize};

/// A single execution event. Exactly one variant is populated per envelope.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RunEvent {
    /// A feature file failed to parse.
    ParseError(ParseError),

    /// A feature file was parsed into a document.
    #[serde(rename = "gherkinDocument")]
    DocumentParsed(GherkinDocument),

    /// A scenario (or one example row of an outline) was compiled into a pickle.
    #[serde(rename = "pickle")]
    PickleCompiled(Pickle),

    /// A pickle was matched against step definitions, producing a test case.
    #[serde(rename = "testCase")]
    TestCaseCompiled(TestCase),

    /// A test case attempt started.
    TestCaseStarted(TestCaseStarted),

    /// A test step started.
    TestStepStarted(TestStepStarted),

    /// The engine attached an out-of-band payload to the current step.
    #[serde(rename = "attachment")]
    ArtifactAttached(Attachment),

    /// A test step finished.
    TestStepFinished(TestStepFinished),

    /// A test case attempt finished.
    TestCaseFinished(TestCaseFinished),

    /// The run started.
    #[serde(rename = "testRunStarted")]
    RunStarted(TestRunStarted),

    /// The run finished.
    #[serde(rename = "testRunFinished")]
    RunFinished(TestRunFinished),

    /// Metadata about the run, such as its display name.
    Meta(RunMeta),
}

impl RunEvent {
    /// Envelope tags understood by [`RunEvent`].
    pub const KNOWN_TAGS: &'static [&'static str] = &[
        "parseError",
        "gherkinDocument",
        "pickle",
        "testCase",
        "testCaseStarted",
        "testStepStarted",
        "attachment",
        "testStepFinished",
        "testCaseFinished",
        "testRunStarted",
        "testRunFinished",
        "meta",
    ];

    /// Parses a single line of the event stream.
    ///
    /// Returns `Ok(None)` for envelopes whose tag isn't one of
    /// [`Self::KNOWN_TAGS`] (step definitions, hooks, sources and so on), which
    /// the relay has no use for.
    pub fn from_json_line(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let is_known = value
            .as_object()
            .and_then(|map| map.keys().next())
            .is_some_and(|tag| Self::KNOWN_TAGS.contains(&tag.as_str()));
        if !is_known {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }

    /// Returns the envelope tag for this event.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "parseError",
            Self::DocumentParsed(_) => "gherkinDocument",
            Self::PickleCompiled(_) => "pickle",
            Self::TestCaseCompiled(_) => "testCase",
            Self::TestCaseStarted(_) => "testCaseStarted",
            Self::TestStepStarted(_) => "testStepStarted",
            Self::ArtifactAttached(_) => "attachment",
            Self::TestStepFinished(_) => "testStepFinished",
            Self::TestCaseFinished(_) => "testCaseFinished",
            Self::RunStarted(_) => "testRunStarted",
            Self::RunFinished(_) => "testRunFinished",
            Self::Meta(_) => "meta",
        }
    }
}

/// A point in time, as `{seconds, nanos}` since the Unix epoch.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Timestamp {
    /// Whole seconds.
    pub seconds: i64,
    /// Nanosecond remainder.
    pub nanos: i64,
}

impl Timestamp {
    /// Converts this timestamp to milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.seconds * 1000 + self.nanos / 1_000_000
    }
}

/// Payload of [`RunEvent::ParseError`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ParseError {
    /// Human-readable parser message.
    pub message: String,
    /// Where the error occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceReference>,
}

/// A reference to a source file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SourceReference {
    /// The URI of the source, if known.
    #[serde(default)]
    pub uri: Option<String>,
}

/// Payload of [`RunEvent::DocumentParsed`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GherkinDocument {
    /// The URI of the feature file, relative to the working directory.
    pub uri: String,
    /// The parsed feature. Absent for empty files.
    #[serde(default)]
    pub feature: Option<Feature>,
}

/// A feature block.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub children: Vec<FeatureChild>,
}

/// A child of a feature. Exactly one field is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FeatureChild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Background>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,
}

/// A rule block, which groups scenarios under a feature.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<RuleChild>,
}

/// A child of a rule. Exactly one field is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RuleChild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Background>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Background {
    pub id: String,
    #[serde(default)]
    pub steps: Vec<DocumentStep>,
}

/// A scenario or scenario outline.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<DocumentStep>,
    #[serde(default)]
    pub examples: Vec<Examples>,
}

/// A step as written in the feature file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStep {
    pub id: String,
    pub keyword: String,
    #[serde(default)]
    pub keyword_type: Option<StepKind>,
    pub text: String,
}

/// An examples table attached to a scenario outline.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Examples {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub table_header: Option<TableRow>,
    #[serde(default)]
    pub table_body: Vec<TableRow>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TableRow {
    pub id: String,
    #[serde(default)]
    pub cells: Vec<TableCell>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TableCell {
    pub value: String,
}

/// Payload of [`RunEvent::PickleCompiled`].
///
/// `ast_node_ids` holds the scenario id first and, for outlines, the example
/// row id second.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pickle {
    pub id: String,
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub ast_node_ids: Vec<String>,
    #[serde(default)]
    pub steps: Vec<PickleStep>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PickleStep {
    pub id: String,
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: Option<StepKind>,
    #[serde(default)]
    pub ast_node_ids: Vec<String>,
}

/// Payload of [`RunEvent::TestCaseCompiled`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub pickle_id: String,
    #[serde(default)]
    pub test_steps: Vec<TestStep>,
}

/// A test step. Hooks have no `pickle_step_id`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestStep {
    pub id: String,
    #[serde(default)]
    pub pickle_step_id: Option<String>,
}

/// Payload of [`RunEvent::TestCaseStarted`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseStarted {
    pub id: String,
    pub test_case_id: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub attempt: u32,
}

/// Payload of [`RunEvent::TestStepStarted`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestStepStarted {
    pub test_case_started_id: String,
    pub test_step_id: String,
    pub timestamp: Timestamp,
}

/// Payload of [`RunEvent::ArtifactAttached`].
///
/// The meaning of `body` depends on `media_type`; see [`media_types`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub test_case_started_id: Option<String>,
    #[serde(default)]
    pub test_step_id: Option<String>,
    pub body: String,
    pub media_type: String,
    #[serde(default)]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Payload of [`RunEvent::TestStepFinished`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestStepFinished {
    pub test_case_started_id: String,
    pub test_step_id: String,
    pub test_step_result: TestStepResult,
    pub timestamp: Timestamp,
}

/// The engine's verdict on a single step.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TestStepResult {
    pub status: Status,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of [`RunEvent::TestCaseFinished`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseFinished {
    pub test_case_started_id: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub will_be_retried: bool,
}

/// Payload of [`RunEvent::RunStarted`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TestRunStarted {
    pub timestamp: Timestamp,
}

/// Payload of [`RunEvent::RunFinished`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TestRunFinished {
    pub timestamp: Timestamp,
    /// The engine's own run-level success signal.
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of [`RunEvent::Meta`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    #[serde(default)]
    pub run_name: Option<String>,
}

/// Media types that select how an [`Attachment`] body is interpreted.
pub mod media_types {
    /// The body is the artifact storage root for this run.
    pub const ARTIFACT_ROOT: &str = "text/plain";
    /// The body is a [`CommandRecord`](crate::report::CommandRecord).
    pub const COMMAND: &str = "application/json";
    /// The body is a [`RunEnvironment`](crate::report::RunEnvironment).
    pub const ENVIRONMENT: &str = "application/json+env";
    /// The body is the accessibility snapshot taken before the step ran.
    pub const SNAPSHOT_BEFORE: &str = "application/json+snapshot-before";
    /// The body is the accessibility snapshot taken after the step ran.
    pub const SNAPSHOT_AFTER: &str = "application/json+snapshot-after";
    /// The body is a single diagnostic log entry for the step.
    pub const STEP_LOG: &str = "application/json+log";
    /// The body is a single network entry for the step.
    pub const NETWORK: &str = "application/json+network";
    /// The body is `{"traceFilePath": "..."}`.
    pub const TRACE: &str = "application/json+trace";
    /// The body is `{"name": "...", "payload": ...}` from a third-party integration.
    pub const INTEGRATION: &str = "application/json+integration";
    /// The body is [`RetrainStats`](crate::report::RetrainStats) for the test case.
    pub const RETRAIN_STATS: &str = "application/json+retrain";
    /// The body is free-form diagnostic text for the test case log.
    pub const CASE_LOG: &str = "text/x-case-log";
}
