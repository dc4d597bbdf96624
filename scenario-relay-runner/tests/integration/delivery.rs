// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::{FakeCollector, test_config};
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use scenario_relay_metadata::{
    collector::RunHandle,
    report::{CommandRecord, Status, StepRecord, TestCaseRecord, TestResult},
};
use scenario_relay_runner::{
    config::{RelayConfig, RetryPolicy},
    delivery::DeliveryPipeline,
};
use std::{sync::Arc, time::Duration};
use test_case::test_case;

fn run() -> RunHandle {
    RunHandle {
        id: "run-1".to_owned(),
        project_id: "proj-1".to_owned(),
    }
}

fn pipeline(collector: &Arc<FakeCollector>, config: RelayConfig) -> DeliveryPipeline {
    DeliveryPipeline::new(collector.clone(), config.collector, config.delivery)
}

/// A failed test case whose only step took `screenshots` screenshots.
fn record(screenshots: usize) -> TestCaseRecord {
    let commands = (0..screenshots)
        .map(|i| CommandRecord {
            kind: "click".to_owned(),
            value: None,
            text: format!("click {i}"),
            screenshot_id: Some(i.to_string()),
            result: TestResult {
                status: Status::Passed,
                ..TestResult::default()
            },
        })
        .collect();
    TestCaseRecord {
        id: "tcs-1".to_owned(),
        scenario_name: "log in".to_owned(),
        steps: vec![StepRecord {
            text: "I log in".to_owned(),
            commands,
            ..StepRecord::default()
        }],
        ..TestCaseRecord::default()
    }
}

// The default policy retries twice, after 1s and then 2s.
#[test_case(0, Some(1), Duration::ZERO ; "first attempt succeeds")]
#[test_case(2, Some(3), Duration::from_secs(3) ; "last retry succeeds")]
#[test_case(3, None, Duration::from_secs(3) ; "retries exhausted")]
#[tokio::test(start_paused = true)]
async fn submission_retry_bound(
    failures: usize,
    expected_attempts: Option<usize>,
    expected_elapsed: Duration,
) -> Result<()> {
    let collector = Arc::new(FakeCollector::default().with_failing_submissions(failures));
    let config = test_config();
    assert_eq!(
        config.delivery.submit_retries,
        RetryPolicy::exponential(2, Duration::from_secs(1))
    );
    let pipeline = pipeline(&collector, config);

    let start = tokio::time::Instant::now();
    let response = pipeline.upload_test_case(&record(0), &run(), None, None).await?;
    let elapsed = start.elapsed();

    assert_eq!(response.is_some(), expected_attempts.is_some());
    assert_eq!(collector.submission_attempts(), expected_attempts.unwrap_or(3));
    assert_eq!(elapsed, expected_elapsed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn artifact_uploads_respect_concurrency() -> Result<()> {
    const LIMIT: usize = 3;
    const SCREENSHOTS: usize = 10;

    let dir = camino_tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("screenshots"))?;
    for i in 0..SCREENSHOTS {
        std::fs::write(dir.path().join(format!("screenshots/{i}.png")), [0u8; 16])?;
    }

    let collector = Arc::new(FakeCollector::default().with_put_delay(Duration::from_millis(25)));
    let mut config = test_config();
    config.delivery.artifact_concurrency = LIMIT;
    let pipeline = pipeline(&collector, config);

    pipeline
        .upload_test_case(&record(SCREENSHOTS), &run(), Some(dir.path()), None)
        .await?;

    let mut puts = collector.puts();
    puts.sort();
    assert_eq!(puts.len(), SCREENSHOTS);
    assert!(puts[0].starts_with("https://uploads.test/screenshots/"));
    let peak = collector.peak_puts();
    assert!(
        (1..=LIMIT).contains(&peak),
        "peak concurrency {peak} outside 1..={LIMIT}"
    );
    Ok(())
}

#[tokio::test]
async fn missing_artifacts_are_skipped() -> Result<()> {
    let dir = camino_tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("screenshots"))?;
    std::fs::write(dir.path().join("screenshots/1.png"), b"png")?;

    let collector = Arc::new(FakeCollector::default());
    let pipeline = pipeline(&collector, test_config());
    let response = pipeline
        .upload_test_case(&record(3), &run(), Some(dir.path()), None)
        .await?;

    assert!(response.is_some());
    assert_eq!(collector.puts(), vec!["https://uploads.test/screenshots/1.png"]);
    assert_eq!(collector.posts_to("/createNewTestCase").len(), 1);
    Ok(())
}
