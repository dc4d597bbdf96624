// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::{
    EventScript, FakeCollaborator, FakeCollector, StepOutcome::*, test_config,
};
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use scenario_relay_metadata::report::Status;
use scenario_relay_runner::{
    config::RelayConfig,
    errors::{RelayError, UnauthorizedError},
    recovery::RunVerdict,
    relay::{Relay, spawn_event_reader},
};
use std::{io::Cursor, sync::Arc};

async fn relay_script<'a>(
    script: &EventScript,
    config: &RelayConfig,
    collector: &Arc<FakeCollector>,
    collaborator: &'a FakeCollaborator,
) -> (Relay<&'a FakeCollaborator>, Result<RunVerdict, RelayError>) {
    let mut relay = Relay::new(config, collector.clone(), collaborator);
    let (events, reader) = spawn_event_reader(Cursor::new(script.to_ndjson().into_bytes()), 8);
    let verdict = relay.run(events).await;
    reader
        .await
        .expect("reader task completed")
        .expect("event stream is well-formed");
    (relay, verdict)
}

#[tokio::test]
async fn well_formed_run_delivers_every_test_case() -> Result<()> {
    let mut script = EventScript::new();
    script.meta("nightly");
    let scenarios: Vec<_> = (0..3)
        .map(|i| script.compile(&format!("scenario {i}"), 4))
        .collect();
    script.run_started();
    for scenario in &scenarios {
        script.execute(scenario, &[Pass, Pass, Pass, Pass]);
    }
    script.run_finished(true);

    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (relay, verdict) = relay_script(&script, &test_config(), &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Passed);
    let report = relay.report();
    assert_eq!(report.result.status, Status::Passed);
    assert_eq!(report.test_cases.len(), 3);
    for record in &report.test_cases {
        assert_eq!(record.steps.len(), 4, "hooks aren't steps");
        assert_eq!(record.result.status, Status::Passed);
    }

    let creates = collector.posts_to("/cucumber-runs/create");
    assert_eq!(creates.len(), 1, "the run is created once");
    assert_eq!(creates[0]["name"], "nightly");

    let submissions = collector.posts_to("/createNewTestCase");
    assert_eq!(submissions.len(), 3);
    for submission in &submissions {
        assert_eq!(submission["runId"], "run-1");
        assert_eq!(
            submission["testProgressReport"]["steps"]
                .as_array()
                .map(Vec::len),
            Some(4)
        );
    }
    assert_eq!(collector.posts_to("/uploadCompletion").len(), 1);
    assert!(relay.context().is_finished());
    assert!(relay.context().in_flight().is_empty());
    assert!(collaborator.repairs.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_command_fails_the_run() -> Result<()> {
    let mut script = EventScript::new();
    let first = script.compile("open the dashboard", 2);
    let second = script.compile("log in", 3);
    script.run_started();
    script.execute(&first, &[Pass, Pass]);
    script.execute(&second, &[Pass, CommandFails("element not found"), Pass]);
    script.run_finished(false);

    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (relay, verdict) = relay_script(&script, &test_config(), &collector, &collaborator).await;

    // Recovery is disabled by default.
    assert_eq!(verdict?, RunVerdict::Failed);
    let report = relay.report();
    assert_eq!(report.result.status, Status::Failed);
    assert_eq!(report.test_cases[0].result.status, Status::Passed);
    let failed = &report.test_cases[1];
    assert_eq!(failed.result.status, Status::Failed);
    assert_eq!(failed.result.message.as_deref(), Some("element not found"));
    assert_eq!(failed.steps[1].result.status, Status::Failed);
    assert!(collaborator.repairs.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn incomplete_step_message_is_synthesized() -> Result<()> {
    let mut script = EventScript::new();
    let scenario = script.compile("search", 2);
    script.run_started();
    script.execute(&scenario, &[Pass, Undefined]);
    script.run_finished(false);

    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (relay, verdict) = relay_script(&script, &test_config(), &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Failed);
    assert_eq!(
        relay.report().test_cases[0].result.message.as_deref(),
        Some("step \"step 1 of search\" is UNDEFINED")
    );
    Ok(())
}

#[tokio::test]
async fn parse_error_fails_the_run() -> Result<()> {
    let mut script = EventScript::new();
    script.parse_error(
        "features/broken.feature",
        "(3:5): unexpected token 'Scenari'",
    );
    script.run_started();
    script.run_finished(true);

    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (relay, verdict) = relay_script(&script, &test_config(), &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Failed);
    let report = relay.report();
    assert_eq!(report.result.status, Status::Failed);
    let message = report.result.message.as_deref().unwrap_or_default();
    assert!(message.contains("unexpected token"), "message: {message}");
    assert!(report.test_cases.is_empty());
    assert_eq!(collector.post_count(), 0, "nothing to deliver");
    Ok(())
}

#[tokio::test]
async fn repaired_failure_passes_the_run() -> Result<()> {
    let mut script = EventScript::new();
    let passing = script.compile("open the dashboard", 1);
    let failing = script.compile("log in", 3);
    script.run_started();
    script.execute(&passing, &[Pass]);
    script.execute(&failing, &[Pass, CommandFails("element not found"), Pass]);
    script.run_finished(false);

    let mut config = test_config();
    config.recovery.enabled = true;
    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (relay, verdict) = relay_script(&script, &config, &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Passed);
    let report = relay.report();
    assert_eq!(report.result.status, Status::Passed);
    let repaired = &report.test_cases[1];
    assert_eq!(repaired.result.status, Status::FixedByAi);
    assert_eq!(repaired.steps[1].result.status, Status::FixedByAi);
    assert!(repaired.retrain_stats.is_some());

    assert_eq!(
        *collaborator.repairs.lock().unwrap(),
        vec![("log in".to_owned(), 1)]
    );
    let reruns = collaborator.reruns.lock().unwrap();
    assert_eq!(reruns.len(), 1);
    assert_eq!(reruns[0].1, vec![1]);
    assert_eq!(reruns[0].2.as_ref().map(|run| run.id.as_str()), Some("run-1"));

    let modified = collector.posts_to("/modifyTestCase");
    assert_eq!(modified.len(), 1);
    assert_eq!(
        modified[0]["testProgressReport"]["result"]["status"],
        "FIXED_BY_AI"
    );
    assert_eq!(collector.posts_to("/updateAIRecoveryCount").len(), 1);
    Ok(())
}

#[tokio::test]
async fn unsuccessful_repair_keeps_the_failure() -> Result<()> {
    let mut script = EventScript::new();
    let failing = script.compile("log in", 2);
    script.run_started();
    script.execute(&failing, &[CommandFails("element not found"), Pass]);
    script.run_finished(false);

    let mut config = test_config();
    config.recovery.enabled = true;
    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Failed);
    let (relay, verdict) = relay_script(&script, &config, &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Failed);
    assert_eq!(relay.report().test_cases[0].result.status, Status::Failed);
    assert_eq!(collaborator.repairs.lock().unwrap().len(), 1);
    assert_eq!(collector.posts_to("/modifyTestCase").len(), 1);
    assert!(collector.posts_to("/updateAIRecoveryCount").is_empty());
    Ok(())
}

#[tokio::test]
async fn previously_attempted_step_is_not_repaired_again() -> Result<()> {
    let mut script = EventScript::new();
    let failing = script.compile("log in", 3);
    script.run_started();
    script.execute(&failing, &[Pass, CommandFails("element not found"), Pass]);
    script.run_finished(false);

    let mut config = test_config();
    config.recovery.enabled = true;
    config.recovery.attempted_steps = vec![1];
    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (relay, verdict) = relay_script(&script, &config, &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Failed);
    assert!(collaborator.repairs.lock().unwrap().is_empty());
    assert!(collaborator.reruns.lock().unwrap().is_empty());
    assert_eq!(relay.context().ledger().attempted(), &[1]);
    Ok(())
}

#[tokio::test]
async fn preset_run_is_reused() -> Result<()> {
    let mut script = EventScript::new();
    let scenario = script.compile("log in", 1);
    script.run_started();
    script.execute(&scenario, &[Pass]);
    script.run_finished(true);

    let mut config = test_config();
    config.collector.run_id = Some("run-7".to_owned());
    config.collector.project_id = Some("proj-7".to_owned());
    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (_, verdict) = relay_script(&script, &config, &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Passed);
    assert!(collector.posts_to("/cucumber-runs/create").is_empty());
    let submissions = collector.posts_to("/createNewTestCase");
    assert_eq!(submissions[0]["runId"], "run-7");
    assert_eq!(submissions[0]["projectId"], "proj-7");
    Ok(())
}

#[tokio::test]
async fn unauthorized_submission_aborts_the_run() {
    let mut script = EventScript::new();
    let scenario = script.compile("log in", 1);
    script.run_started();
    script.execute(&scenario, &[Pass]);
    script.run_finished(true);

    let collector = Arc::new(FakeCollector::default().with_unauthorized("/createNewTestCase"));
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (_, verdict) = relay_script(&script, &test_config(), &collector, &collaborator).await;

    let error = verdict.unwrap_err();
    assert!(
        matches!(
            error,
            RelayError::Unauthorized(UnauthorizedError { endpoint: "/cucumber-runs/createNewTestCase" })
        ),
        "unexpected error: {error:?}"
    );
    assert!(collector.posts_to("/uploadCompletion").is_empty());
}

#[tokio::test]
async fn unauthorized_run_creation_aborts_the_run() {
    let mut script = EventScript::new();
    let scenario = script.compile("log in", 1);
    script.run_started();
    script.execute(&scenario, &[Pass]);
    script.run_finished(true);

    let collector = Arc::new(FakeCollector::default().with_unauthorized("/cucumber-runs/create"));
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (_, verdict) = relay_script(&script, &test_config(), &collector, &collaborator).await;

    assert!(
        matches!(verdict, Err(RelayError::Unauthorized(_))),
        "unexpected result: {verdict:?}"
    );
    assert!(collector.posts_to("/createNewTestCase").is_empty());
}

#[tokio::test]
async fn disabled_upload_touches_nothing() -> Result<()> {
    let mut script = EventScript::new();
    let scenario = script.compile("log in", 2);
    script.run_started();
    script.execute(&scenario, &[Pass, CommandFails("element not found")]);
    script.run_finished(false);

    let mut config = test_config();
    config.collector.upload_reports = false;
    config.collector.status_uuid = Some("status-1".to_owned());
    config.recovery.enabled = true;
    let collector = Arc::new(FakeCollector::default());
    let collaborator = FakeCollaborator::new(Status::Passed);
    let (relay, verdict) = relay_script(&script, &config, &collector, &collaborator).await;

    assert_eq!(verdict?, RunVerdict::Failed);
    assert_eq!(collector.post_count(), 0);
    // Without a collector there is no root cause, so nothing is repaired.
    assert!(collaborator.repairs.lock().unwrap().is_empty());
    assert_eq!(relay.report().test_cases.len(), 1);
    Ok(())
}
