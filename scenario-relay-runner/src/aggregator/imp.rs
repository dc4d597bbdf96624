// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    local::{LocalReportWriter, write_case_log},
    params::{TestData, is_templated, outline_parameters, redact, redact_all},
    side_channel::{EntryKind, Scope, SideChannel},
};
use crate::{
    errors::{AggregateError, DisplayErrorChain, LookupError, LookupKind},
    helpers::now_millis,
    lookup::{LookupTables, StartedCase},
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use scenario_relay_metadata::{
    events::{
        Attachment, ParseError, RunEvent, TestCaseFinished, TestCaseStarted, TestRunFinished,
        TestRunStarted, TestStepFinished, TestStepStarted, media_types,
    },
    report::{
        CommandRecord, Report, RetrainStats, RunEnvironment, Status, StepKind, StepRecord,
        TestCaseRecord, TestResult,
    },
};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

/// Settings for an [`EventAggregator`].
#[derive(Clone, Debug, Default)]
pub struct AggregatorOptions {
    /// If set, finished test cases are written here instead of being delivered.
    pub local_dir: Option<Utf8PathBuf>,
    /// Test data used to resolve `{{name}}` parameters.
    pub test_data_file: Option<Utf8PathBuf>,
}

/// What the caller should do after an event was aggregated.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregatorOutput {
    /// Nothing.
    None,
    /// The run started.
    RunStarted,
    /// The run finished. `success` is the engine's own verdict.
    RunFinished {
        /// Whether the engine reported success.
        success: bool,
    },
    /// A test case finished and should be delivered.
    Deliver(Box<TestCaseRecord>),
    /// A test case finished and was written to this file.
    PersistedLocally(Utf8PathBuf),
}

/// Builds a [`Report`] from execution events.
///
/// Events must be handed over one at a time, in the order they were emitted.
#[derive(Debug)]
pub struct EventAggregator {
    report: Report,
    lookups: LookupTables,
    side_channel: SideChannel,
    local_writer: Option<LocalReportWriter>,
    test_data_file: Option<Utf8PathBuf>,
    artifact_root: Option<Utf8PathBuf>,
    run_name: Option<String>,
    parse_failed: bool,
}

impl EventAggregator {
    /// Creates a new aggregator.
    pub fn new(options: AggregatorOptions) -> Self {
        Self {
            report: Report::default(),
            lookups: LookupTables::new(),
            side_channel: SideChannel::default(),
            local_writer: options.local_dir.map(LocalReportWriter::new),
            test_data_file: options.test_data_file,
            artifact_root: None,
            run_name: None,
            parse_failed: false,
        }
    }

    /// Returns the report built so far.
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Returns the report built so far, for post-run updates.
    pub fn report_mut(&mut self) -> &mut Report {
        &mut self.report
    }

    /// Returns the artifact storage root announced by the engine, if any.
    pub fn artifact_root(&self) -> Option<&Utf8Path> {
        self.artifact_root.as_deref()
    }

    /// Returns the run name announced by the stream, if any.
    pub fn run_name(&self) -> Option<&str> {
        self.run_name.as_deref()
    }

    /// Aggregates a single event.
    ///
    /// Errors are protocol violations and should stop the run.
    pub fn handle(&mut self, event: RunEvent) -> Result<AggregatorOutput, AggregateError> {
        match event {
            RunEvent::ParseError(error) => self.on_parse_error(error)?,
            RunEvent::DocumentParsed(document) => self.lookups.insert_document(document),
            RunEvent::PickleCompiled(pickle) => self.lookups.insert_pickle(pickle),
            RunEvent::TestCaseCompiled(test_case) => self.lookups.insert_test_case(test_case),
            RunEvent::Meta(meta) => {
                if meta.run_name.is_some() {
                    self.run_name = meta.run_name;
                }
            }
            RunEvent::RunStarted(started) => {
                self.on_run_started(started)?;
                return Ok(AggregatorOutput::RunStarted);
            }
            RunEvent::RunFinished(finished) => {
                let success = self.on_run_finished(finished)?;
                return Ok(AggregatorOutput::RunFinished { success });
            }
            // Once a document failed to parse, test case events are meaningless.
            _ if self.parse_failed => {}
            RunEvent::TestCaseStarted(started) => self.on_test_case_started(started)?,
            RunEvent::TestStepStarted(started) => self.on_test_step_started(started)?,
            RunEvent::ArtifactAttached(attachment) => self.on_attachment(attachment),
            RunEvent::TestStepFinished(finished) => self.on_test_step_finished(finished)?,
            RunEvent::TestCaseFinished(finished) => return self.on_test_case_finished(finished),
        }
        Ok(AggregatorOutput::None)
    }

    fn advance_run(&mut self, next: TestResult) -> Result<(), AggregateError> {
        let from = self.report.result.status;
        if !from.can_advance_to(next.status) {
            return Err(AggregateError::InvalidRunTransition {
                from,
                to: next.status,
            });
        }
        self.report.result = next;
        Ok(())
    }

    fn on_parse_error(&mut self, error: ParseError) -> Result<(), AggregateError> {
        let uri = error
            .source
            .as_ref()
            .and_then(|source| source.uri.as_deref())
            .unwrap_or("<unknown>");
        warn!("failed to parse {uri}: {}", error.message);

        // Keep the first parse error's message.
        if !self.parse_failed {
            self.parse_failed = true;
            let start_time = self.report.result.start_time;
            self.advance_run(TestResult::finished(
                Status::Failed,
                start_time,
                now_millis(),
                Some(error.message),
            ))?;
        }
        Ok(())
    }

    fn on_run_started(&mut self, started: TestRunStarted) -> Result<(), AggregateError> {
        if self.parse_failed {
            self.report.result.start_time = Some(started.timestamp.as_millis());
            return Ok(());
        }
        self.advance_run(TestResult::started(started.timestamp.as_millis()))
    }

    fn on_run_finished(&mut self, finished: TestRunFinished) -> Result<bool, AggregateError> {
        let end_time = finished.timestamp.as_millis();
        if self.parse_failed {
            self.report.result.end_time = Some(end_time);
            return Ok(false);
        }

        let status = if finished.success {
            Status::Passed
        } else {
            Status::Failed
        };
        let start_time = self.report.result.start_time;
        self.advance_run(TestResult::finished(
            status,
            start_time,
            end_time,
            finished.message,
        ))?;
        Ok(finished.success)
    }

    fn on_test_case_started(&mut self, started: TestCaseStarted) -> Result<(), AggregateError> {
        let test_case = self.lookups.test_case(&started.test_case_id)?;
        let pickle = self.lookups.pickle(&test_case.pickle_id)?;
        let document = self.lookups.document(&pickle.uri)?;
        let scenario_id = pickle
            .ast_node_ids
            .first()
            .ok_or_else(|| LookupError::new(LookupKind::Scenario, &pickle.id))?;
        let scenario = self.lookups.scenario(scenario_id)?;

        let raw_parameters = outline_parameters(pickle, scenario);
        let mut steps = Vec::with_capacity(pickle.steps.len());
        let mut step_indices = IndexMap::with_capacity(pickle.steps.len());
        for (index, pickle_step) in pickle.steps.iter().enumerate() {
            let (keyword, keyword_type) = match pickle_step.ast_node_ids.first() {
                Some(id) => {
                    let document_step = self.lookups.document_step(id)?;
                    (document_step.keyword.clone(), document_step.keyword_type)
                }
                None => (String::new(), None),
            };
            steps.push(StepRecord {
                keyword,
                kind: keyword_type.or(pickle_step.kind).unwrap_or(StepKind::Unknown),
                text: pickle_step.text.clone(),
                result: TestResult::unknown(),
                ..StepRecord::default()
            });
            step_indices.insert(pickle_step.id.clone(), index);
        }

        let record = TestCaseRecord {
            id: started.id.clone(),
            uri: pickle.uri.clone(),
            feature_name: document
                .feature
                .as_ref()
                .map(|feature| feature.name.clone())
                .unwrap_or_default(),
            scenario_name: pickle.name.clone(),
            parameters: redact_all(&raw_parameters),
            steps,
            result: TestResult::started(started.timestamp.as_millis()),
            ..TestCaseRecord::default()
        };
        debug!(
            id = %record.id,
            attempt = started.attempt,
            "test case started: {}",
            record.scenario_name
        );

        let record_index = self.report.test_cases.len();
        self.report.test_cases.push(record);
        self.lookups.insert_started(
            started.id,
            StartedCase {
                test_case_id: started.test_case_id,
                record_index,
                step_indices,
            },
        );
        self.side_channel.begin_case(raw_parameters);
        Ok(())
    }

    /// Returns the record and step index for a pickle step of a started test
    /// case, or `None` for hook steps.
    fn resolve_step(
        &self,
        test_case_started_id: &str,
        test_step_id: &str,
    ) -> Result<Option<(usize, usize)>, LookupError> {
        let test_step = self.lookups.test_step(test_step_id)?;
        let Some(pickle_step_id) = &test_step.pickle_step_id else {
            return Ok(None);
        };
        let started = self.lookups.started(test_case_started_id)?;
        let step_index = started
            .step_indices
            .get(pickle_step_id)
            .copied()
            .ok_or_else(|| LookupError::new(LookupKind::PickleStep, pickle_step_id))?;
        Ok(Some((started.record_index, step_index)))
    }

    fn on_test_step_started(&mut self, started: TestStepStarted) -> Result<(), AggregateError> {
        let Some((record_index, step_index)) =
            self.resolve_step(&started.test_case_started_id, &started.test_step_id)?
        else {
            return Ok(());
        };

        self.report.test_cases[record_index].steps[step_index].result =
            TestResult::started(started.timestamp.as_millis());
        self.side_channel
            .begin_step(&started.test_case_started_id, step_index);
        Ok(())
    }

    fn on_test_step_finished(&mut self, finished: TestStepFinished) -> Result<(), AggregateError> {
        let Some((record_index, step_index)) =
            self.resolve_step(&finished.test_case_started_id, &finished.test_step_id)?
        else {
            return Ok(());
        };

        let end_time = finished.timestamp.as_millis();
        let step = &mut self.report.test_cases[record_index].steps[step_index];
        if step.result.status != Status::Started {
            return Err(AggregateError::StepNotStarted {
                test_case_started_id: finished.test_case_started_id,
                test_step_id: finished.test_step_id,
            });
        }

        // A failed command overrides whatever the engine reported.
        let (status, message) = match step.first_failed_command() {
            Some(command) => (Status::Failed, command.result.message.clone()),
            None => (
                finished.test_step_result.status,
                finished.test_step_result.message,
            ),
        };

        if status == Status::Undefined
            && !step
                .commands
                .iter()
                .any(|command| command.kind == CommandRecord::UNDEFINED_STEP_KIND)
        {
            step.commands.push(CommandRecord {
                kind: CommandRecord::UNDEFINED_STEP_KIND.to_owned(),
                value: None,
                text: format!("Undefined step: {}", step.text),
                screenshot_id: None,
                result: TestResult::finished(
                    Status::Failed,
                    step.result.start_time,
                    end_time,
                    Some(format!("step \"{}\" has no definition", step.text)),
                ),
            });
        }

        step.result = TestResult::finished(status, step.result.start_time, end_time, message);
        self.side_channel.finish_step(step);
        self.resolve_templated_parameters(record_index);
        Ok(())
    }

    /// Re-resolves `{{name}}` parameters against the test data file, which
    /// steps may have written since the test case started.
    fn resolve_templated_parameters(&mut self, record_index: usize) {
        let raw = self.side_channel.raw_parameters();
        if !raw.values().any(|value| is_templated(value)) {
            return;
        }
        let Some(path) = &self.test_data_file else {
            return;
        };
        let data = match TestData::load(path) {
            Ok(data) => data,
            Err(error) => {
                warn!(
                    "skipping parameter resolution: {}",
                    DisplayErrorChain::new(&error)
                );
                return;
            }
        };

        self.report.test_cases[record_index].parameters = raw
            .iter()
            .map(|(name, value)| (name.clone(), redact(&data.resolve(value)).into_owned()))
            .collect();
    }

    fn on_test_case_finished(
        &mut self,
        finished: TestCaseFinished,
    ) -> Result<AggregatorOutput, AggregateError> {
        let started = self
            .lookups
            .remove_started(&finished.test_case_started_id)?;
        let record = &mut self.report.test_cases[started.record_index];

        let (status, message) = record.rollup();
        record.result = TestResult::finished(
            status,
            record.result.start_time,
            finished.timestamp.as_millis(),
            message,
        );

        if let Some(text) = self.side_channel.finish_case(record) {
            match &self.artifact_root {
                Some(root) => match write_case_log(root, &record.id, &text) {
                    Ok(_) => record.log_file_id = Some(record.id.clone()),
                    Err(error) => warn!(
                        "failed to write case log for {}: {}",
                        record.id,
                        DisplayErrorChain::new(&error)
                    ),
                },
                None => debug!(id = %record.id, "no artifact root, dropping case log"),
            }
        }

        info!(
            id = %record.id,
            retried = finished.will_be_retried,
            "{} {}",
            record.scenario_name,
            record.result.status,
        );

        match &mut self.local_writer {
            Some(writer) => {
                let path = writer.write(record)?;
                Ok(AggregatorOutput::PersistedLocally(path))
            }
            None => Ok(AggregatorOutput::Deliver(Box::new(record.clone()))),
        }
    }

    fn on_attachment(&mut self, attachment: Attachment) {
        let media_type = attachment.media_type.as_str();
        match media_type {
            media_types::ARTIFACT_ROOT => {
                self.artifact_root = Some(Utf8PathBuf::from(attachment.body.replace('\\', "/")));
            }
            media_types::ENVIRONMENT => {
                let Some(env) = parse_body::<RunEnvironment>(&attachment) else {
                    return;
                };
                if let Some(record_index) = self.attachment_case(&attachment) {
                    self.report.test_cases[record_index].env = Some(env.clone());
                }
                self.report.env = env;
            }
            media_types::CASE_LOG => self.side_channel.append_case_log(&attachment.body),
            media_types::RETRAIN_STATS => {
                if let Some(stats) = parse_body::<RetrainStats>(&attachment) {
                    self.side_channel.set_pending_retrain(stats);
                }
            }
            media_types::INTEGRATION => {
                let Some(record_index) = self.attachment_case(&attachment) else {
                    return;
                };
                if let Some(integration) = parse_body::<IntegrationAttachment>(&attachment) {
                    self.report.test_cases[record_index]
                        .integrations
                        .insert(integration.name, integration.payload);
                }
            }
            media_types::STEP_LOG | media_types::NETWORK => {
                let kind = if media_type == media_types::STEP_LOG {
                    EntryKind::Log
                } else {
                    EntryKind::Network
                };
                let scope = match self.attachment_step(&attachment) {
                    AttachmentTarget::Step(..) => Scope::Step,
                    AttachmentTarget::Case(_) => Scope::Case,
                    AttachmentTarget::Hook | AttachmentTarget::Detached => return,
                };
                if let Some(entry) = parse_body::<serde_json::Value>(&attachment) {
                    self.side_channel.push_entry(scope, kind, entry);
                }
            }
            media_types::TRACE => match self.attachment_step(&attachment) {
                AttachmentTarget::Step(record_index, step_index) => {
                    self.on_step_attachment(record_index, step_index, &attachment);
                }
                AttachmentTarget::Case(record_index) => {
                    if let Some(trace) = parse_body::<TraceAttachment>(&attachment) {
                        self.report.test_cases[record_index].trace_file_id =
                            Some(trace.trace_file_path);
                    }
                }
                AttachmentTarget::Hook | AttachmentTarget::Detached => {}
            },
            media_types::COMMAND | media_types::SNAPSHOT_BEFORE | media_types::SNAPSHOT_AFTER => {
                let AttachmentTarget::Step(record_index, step_index) =
                    self.attachment_step(&attachment)
                else {
                    return;
                };
                self.on_step_attachment(record_index, step_index, &attachment);
            }
            other => debug!("ignoring attachment with media type {other}"),
        }
    }

    fn on_step_attachment(&mut self, record_index: usize, step_index: usize, attachment: &Attachment) {
        match attachment.media_type.as_str() {
            media_types::COMMAND => {
                if let Some(command) = parse_body::<CommandRecord>(attachment) {
                    self.report.test_cases[record_index].steps[step_index]
                        .commands
                        .push(command);
                }
            }
            media_types::SNAPSHOT_BEFORE => {
                if let Some(snapshot) = snapshot_text(attachment) {
                    self.side_channel.set_snapshot_before(snapshot);
                }
            }
            media_types::SNAPSHOT_AFTER => {
                if let Some(snapshot) = snapshot_text(attachment) {
                    self.side_channel.set_snapshot_after(snapshot);
                }
            }
            media_types::TRACE => {
                if let Some(trace) = parse_body::<TraceAttachment>(attachment) {
                    self.side_channel.set_trace_file_path(trace.trace_file_path);
                }
            }
            _ => {}
        }
    }

    /// Returns the record index of the test case an attachment belongs to.
    fn attachment_case(&self, attachment: &Attachment) -> Option<usize> {
        let started_id = attachment.test_case_started_id.as_deref()?;
        self.lookups
            .started(started_id)
            .ok()
            .map(|started| started.record_index)
    }

    fn attachment_step(&self, attachment: &Attachment) -> AttachmentTarget {
        let Some(record_index) = self.attachment_case(attachment) else {
            debug!(
                media_type = %attachment.media_type,
                "ignoring attachment outside of a running test case"
            );
            return AttachmentTarget::Detached;
        };
        let (Some(started_id), Some(test_step_id)) = (
            attachment.test_case_started_id.as_deref(),
            attachment.test_step_id.as_deref(),
        ) else {
            return AttachmentTarget::Case(record_index);
        };
        match self.resolve_step(started_id, test_step_id) {
            Ok(Some((record_index, step_index))) => {
                if self.side_channel.current_step() != Some((started_id, step_index)) {
                    debug!(test_step_id, "attachment for a step that isn't running");
                }
                AttachmentTarget::Step(record_index, step_index)
            }
            Ok(None) => AttachmentTarget::Hook,
            Err(error) => {
                debug!("ignoring attachment: {error}");
                AttachmentTarget::Detached
            }
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum AttachmentTarget {
    Step(usize, usize),
    Case(usize),
    Hook,
    Detached,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceAttachment {
    trace_file_path: String,
}

#[derive(Deserialize)]
struct IntegrationAttachment {
    name: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn parse_body<T: DeserializeOwned>(attachment: &Attachment) -> Option<T> {
    match serde_json::from_str(&attachment.body) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(
                media_type = %attachment.media_type,
                "ignoring malformed attachment: {error}"
            );
            None
        }
    }
}

/// Snapshots arrive either as a JSON string or as a JSON document.
fn snapshot_text(attachment: &Attachment) -> Option<String> {
    parse_body::<serde_json::Value>(attachment).map(|value| match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}
