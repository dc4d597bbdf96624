// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use http::StatusCode;
use scenario_relay_metadata::{
    collector::RunHandle,
    report::{RetrainStats, Status, TestResult},
};
use scenario_relay_runner::{
    config::RelayConfig,
    delivery::{CollectorTransport, Headers},
    errors::{CollaboratorError, TransportError},
    recovery::{RepairCollaborator, RerunCollaborator, ScenarioTarget},
};
use serde_json::{Value, json};
use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

/// A collector that accepts everything unless told otherwise, and records
/// every call it sees.
#[derive(Debug, Default)]
pub(crate) struct FakeCollector {
    /// Number of test case submissions to fail with a 502 before accepting.
    failing_submissions: usize,
    /// Endpoints (by URL suffix) that answer 401.
    unauthorized: Vec<&'static str>,
    /// Time each artifact upload takes.
    put_delay: Duration,
    posts: Mutex<Vec<(String, Value)>>,
    puts: Mutex<Vec<String>>,
    submissions: AtomicUsize,
    active_puts: AtomicUsize,
    peak_puts: AtomicUsize,
}

impl FakeCollector {
    pub(crate) fn with_failing_submissions(mut self, count: usize) -> Self {
        self.failing_submissions = count;
        self
    }

    pub(crate) fn with_unauthorized(mut self, suffix: &'static str) -> Self {
        self.unauthorized.push(suffix);
        self
    }

    pub(crate) fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    /// Returns the request bodies posted to endpoints ending with `suffix`.
    pub(crate) fn posts_to(&self, suffix: &str) -> Vec<Value> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.ends_with(suffix))
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }

    pub(crate) fn submission_attempts(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub(crate) fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub(crate) fn peak_puts(&self) -> usize {
        self.peak_puts.load(Ordering::SeqCst)
    }

    fn respond(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        if url.ends_with("/create") {
            return Ok(json!({"status": true, "run": {"_id": "run-1", "projectId": "proj-1"}}));
        }
        if url.ends_with("/generateuploadurls") {
            let urls: serde_json::Map<_, _> = body["fileUris"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(|uri| (uri.to_owned(), json!(format!("https://uploads.test/{uri}"))))
                .collect();
            return Ok(json!({"status": true, "uploadUrls": urls}));
        }
        if url.ends_with("/createNewTestCase") {
            let attempt = self.submissions.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failing_submissions {
                return Err(TransportError::Status {
                    status: StatusCode::BAD_GATEWAY,
                    body: Some("<!DOCTYPE html><html>bad gateway</html>".to_owned()),
                });
            }
            return Ok(submission_response(&body["testProgressReport"]));
        }
        Ok(json!({"status": true}))
    }
}

/// Accepts the test case and, if it failed, reports an unresolved root cause
/// at its first failing step.
fn submission_response(record: &Value) -> Value {
    if record["result"]["status"] != "FAILED" {
        return json!({"status": true});
    }
    let failed_step = record["steps"]
        .as_array()
        .and_then(|steps| {
            steps
                .iter()
                .position(|step| step["result"]["status"] != "PASSED")
        })
        .unwrap_or(0);
    json!({
        "status": true,
        "rootCause": {
            "status": false,
            "failedStep": failed_step,
            "failClass": "LOCATOR",
            "analysis": "the element moved",
        },
    })
}

impl CollectorTransport for FakeCollector {
    fn post_json(&self, url: &str, _headers: &Headers, body: &Value) -> Result<Value, TransportError> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_owned(), body.clone()));
        if self.unauthorized.iter().any(|suffix| url.ends_with(suffix)) {
            return Err(TransportError::Status {
                status: StatusCode::UNAUTHORIZED,
                body: None,
            });
        }
        self.respond(url, body)
    }

    fn put_bytes(&self, url: &str, _bytes: &[u8]) -> Result<(), TransportError> {
        let active = self.active_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_puts.fetch_max(active, Ordering::SeqCst);
        thread::sleep(self.put_delay);
        self.puts.lock().unwrap().push(url.to_owned());
        self.active_puts.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A repair engine whose repairs all end with `outcome`.
#[derive(Debug)]
pub(crate) struct FakeCollaborator {
    outcome: Status,
    pub(crate) repairs: Mutex<Vec<(String, usize)>>,
    pub(crate) reruns: Mutex<Vec<(String, Vec<usize>, Option<RunHandle>)>>,
}

impl FakeCollaborator {
    pub(crate) fn new(outcome: Status) -> Self {
        Self {
            outcome,
            repairs: Mutex::new(Vec::new()),
            reruns: Mutex::new(Vec::new()),
        }
    }
}

impl RepairCollaborator for &FakeCollaborator {
    async fn repair(
        &self,
        target: ScenarioTarget<'_>,
        step_index: usize,
    ) -> Result<RetrainStats, CollaboratorError> {
        self.repairs
            .lock()
            .unwrap()
            .push((target.scenario.to_owned(), step_index));
        Ok(RetrainStats {
            result: TestResult {
                status: self.outcome,
                ..TestResult::default()
            },
            total_steps: step_index + 1,
            ..RetrainStats::default()
        })
    }
}

impl RerunCollaborator for &FakeCollaborator {
    async fn rerun(
        &self,
        target: ScenarioTarget<'_>,
        attempted: &[usize],
        run: Option<&RunHandle>,
    ) -> Result<(), CollaboratorError> {
        self.reruns.lock().unwrap().push((
            target.scenario.to_owned(),
            attempted.to_vec(),
            run.cloned(),
        ));
        Ok(())
    }
}

/// The default config, pointed at nothing real.
pub(crate) fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default_config();
    config.collector.base_url = "https://collector.test/api".to_owned();
    config.collector.analytics_url = "https://analytics.test".to_owned();
    config.report.test_data_file = "does-not-exist/data.json".into();
    config
}

/// How a step of a scripted scenario ends.
#[derive(Copy, Clone, Debug)]
pub(crate) enum StepOutcome {
    Pass,
    /// The engine reports the step as passed, but one of its commands failed
    /// with this message.
    CommandFails(&'static str),
    Undefined,
}

/// Builds a newline-delimited event stream.
#[derive(Debug, Default)]
pub(crate) struct EventScript {
    lines: Vec<Value>,
    clock: i64,
    scenarios: usize,
}

impl EventScript {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, line: Value) -> &mut Self {
        self.lines.push(line);
        self
    }

    fn tick(&mut self) -> Value {
        self.clock += 1;
        json!({"seconds": self.clock, "nanos": 0})
    }

    pub(crate) fn meta(&mut self, run_name: &str) -> &mut Self {
        self.push(json!({"meta": {"runName": run_name}}))
    }

    pub(crate) fn parse_error(&mut self, uri: &str, message: &str) -> &mut Self {
        self.push(json!({"parseError": {"message": message, "source": {"uri": uri}}}))
    }

    pub(crate) fn run_started(&mut self) -> &mut Self {
        let timestamp = self.tick();
        self.push(json!({"testRunStarted": {"timestamp": timestamp}}))
    }

    pub(crate) fn run_finished(&mut self, success: bool) -> &mut Self {
        let timestamp = self.tick();
        self.push(json!({"testRunFinished": {"timestamp": timestamp, "success": success}}))
    }

    /// Compiles a scenario in its own feature file. Returns the test case id.
    pub(crate) fn compile(&mut self, name: &str, step_count: usize) -> String {
        let n = self.scenarios;
        self.scenarios += 1;
        let uri = format!("features/f{n}.feature");

        let document_steps: Vec<_> = (0..step_count)
            .map(|i| {
                json!({
                    "id": format!("s{n}-ds{i}"),
                    "keyword": if i == 0 { "Given " } else { "Then " },
                    "keywordType": if i == 0 { "Context" } else { "Outcome" },
                    "text": format!("step {i} of {name}"),
                })
            })
            .collect();
        let pickle_steps: Vec<_> = (0..step_count)
            .map(|i| {
                json!({
                    "id": format!("s{n}-ps{i}"),
                    "text": format!("step {i} of {name}"),
                    "astNodeIds": [format!("s{n}-ds{i}")],
                })
            })
            .collect();
        let mut test_steps = vec![json!({"id": format!("s{n}-before")})];
        test_steps.extend((0..step_count).map(|i| {
            json!({"id": format!("s{n}-ts{i}"), "pickleStepId": format!("s{n}-ps{i}")})
        }));

        self.push(json!({"gherkinDocument": {
            "uri": uri,
            "feature": {
                "name": format!("Feature {n}"),
                "children": [{"scenario": {"id": format!("s{n}-sc"), "name": name, "steps": document_steps}}],
            },
        }}));
        self.push(json!({"pickle": {
            "id": format!("s{n}-p"),
            "uri": uri,
            "name": name,
            "astNodeIds": [format!("s{n}-sc")],
            "steps": pickle_steps,
        }}));
        self.push(json!({"testCase": {
            "id": format!("s{n}-tc"),
            "pickleId": format!("s{n}-p"),
            "testSteps": test_steps,
        }}));
        format!("s{n}")
    }

    /// Executes a compiled scenario, hook first, with the given step outcomes.
    pub(crate) fn execute(&mut self, scenario: &str, outcomes: &[StepOutcome]) -> &mut Self {
        let started_id = format!("{scenario}-run");
        let timestamp = self.tick();
        self.push(json!({"testCaseStarted": {
            "id": started_id,
            "testCaseId": format!("{scenario}-tc"),
            "timestamp": timestamp,
            "attempt": 0,
        }}));

        self.step(&started_id, &format!("{scenario}-before"), "PASSED", None);
        for (i, outcome) in outcomes.iter().enumerate() {
            let step_id = format!("{scenario}-ts{i}");
            match outcome {
                StepOutcome::Pass => self.step(&started_id, &step_id, "PASSED", None),
                StepOutcome::Undefined => self.step(&started_id, &step_id, "UNDEFINED", None),
                StepOutcome::CommandFails(message) => {
                    let command = json!({
                        "type": "click",
                        "text": "click the login button",
                        "result": {"status": "FAILED", "message": message},
                    });
                    self.step(&started_id, &step_id, "PASSED", Some(command))
                }
            };
        }

        let timestamp = self.tick();
        self.push(json!({"testCaseFinished": {
            "testCaseStartedId": started_id,
            "timestamp": timestamp,
            "willBeRetried": false,
        }}))
    }

    fn step(
        &mut self,
        started_id: &str,
        step_id: &str,
        status: &str,
        command: Option<Value>,
    ) -> &mut Self {
        let timestamp = self.tick();
        self.push(json!({"testStepStarted": {
            "testCaseStartedId": started_id,
            "testStepId": step_id,
            "timestamp": timestamp,
        }}));
        if let Some(command) = command {
            self.push(json!({"attachment": {
                "testCaseStartedId": started_id,
                "testStepId": step_id,
                "mediaType": "application/json",
                "body": command.to_string(),
            }}));
        }
        let timestamp = self.tick();
        self.push(json!({"testStepFinished": {
            "testCaseStartedId": started_id,
            "testStepId": step_id,
            "testStepResult": {"status": status},
            "timestamp": timestamp,
        }}))
    }

    /// Renders the script as newline-delimited JSON.
    pub(crate) fn to_ndjson(&self) -> String {
        self.lines
            .iter()
            .map(|line| format!("{line}\n"))
            .collect()
    }
}
