// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::CollectorTransport;
use crate::{
    config::{CollectorConfig, DeliveryConfig},
    errors::{DeliveryError, DisplayErrorChain, TransportError, UnauthorizedError},
    helpers::{join_url, plural, report_link, sanitize_error_body},
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use futures::{StreamExt, stream};
use itertools::Itertools;
use scenario_relay_metadata::{
    collector::{
        Ack, AnalyticsEvent, CreateRunRequest, CreateRunResponse, CreateTestCaseRequest,
        FinishTestCaseResponse, ModifyTestCaseRequest, PresignRequest, PresignResponse,
        ProjectAnalyticsRequest, RunHandle, RunMode, StatusBody, StatusRequest,
        UploadCompletionRequest,
    },
    report::{RunEnvironment, Status, TestCaseRecord},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{borrow::Cow, io, sync::Arc};
use tracing::{debug, error, info, warn};

/// Collector endpoints, relative to the configured base URL.
mod endpoints {
    pub(super) const CREATE_RUN: &str = "/cucumber-runs/create";
    pub(super) const PRESIGN: &str = "/cucumber-runs/generateuploadurls";
    pub(super) const CREATE_TEST_CASE: &str = "/cucumber-runs/createNewTestCase";
    pub(super) const MODIFY_TEST_CASE: &str = "/cucumber-runs/modifyTestCase";
    pub(super) const UPLOAD_COMPLETION: &str = "/cucumber-runs/uploadCompletion";
    pub(super) const PROJECT_ANALYTICS: &str = "/project/updateAIRecoveryCount";
    pub(super) const STATUS: &str = "/scenarios/status";
    /// Relative to the analytics URL.
    pub(super) const ANALYTICS_EVENT: &str = "/event";
}

/// Header identifying this client to the collector.
pub const SOURCE_HEADER: &str = "x-source";
/// Value of [`SOURCE_HEADER`].
pub const SOURCE: &str = "scenario-relay";

const PROJECT_HEADER: &str = "x-project-id";
const DEFAULT_RUN_NAME: &str = "TEST";

/// Uploads test cases and their artifacts to the collector.
///
/// When report upload is disabled, every operation returns a placeholder
/// without touching the transport.
#[derive(Clone, Debug)]
pub struct DeliveryPipeline {
    transport: DebugIgnore<Arc<dyn CollectorTransport>>,
    collector: CollectorConfig,
    delivery: DeliveryConfig,
}

impl DeliveryPipeline {
    /// Creates a new pipeline.
    pub fn new(
        transport: Arc<dyn CollectorTransport>,
        collector: CollectorConfig,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            transport: DebugIgnore(transport),
            collector,
            delivery,
        }
    }

    /// Returns true if network operations are performed.
    pub fn is_enabled(&self) -> bool {
        self.collector.upload_reports
    }

    /// The run handle used when delivery is disabled.
    pub fn placeholder_run() -> RunHandle {
        RunHandle {
            id: "local-run".to_owned(),
            project_id: "local-project".to_owned(),
        }
    }

    /// Creates a run on the collector.
    pub async fn create_run(
        &self,
        name: Option<&str>,
        env: &RunEnvironment,
    ) -> Result<RunHandle, DeliveryError> {
        if !self.is_enabled() {
            info!("report upload is disabled, not creating a remote run");
            return Ok(Self::placeholder_run());
        }

        let request = CreateRunRequest {
            name: name.unwrap_or(DEFAULT_RUN_NAME),
            branch: &self.collector.branch,
            video_id: self.collector.video_id.as_deref(),
            browser: &self.collector.browser,
            mode: self.collector.mode,
            env,
        };
        let response: CreateRunResponse = self
            .call(endpoints::CREATE_RUN, self.run_api(endpoints::CREATE_RUN), &request, None)
            .await?;
        let run = response.run.ok_or(DeliveryError::Rejected {
            endpoint: endpoints::CREATE_RUN,
        })?;
        info!(run_id = %run.id, project_id = %run.project_id, "created remote run");
        Ok(run)
    }

    /// Uploads a finished test case along with the artifacts it references.
    ///
    /// Submission failures retry the whole upload according to the
    /// `submit-retries` policy. Once that is exhausted the failure is logged
    /// and `Ok(None)` is returned. Only an authorization failure is an error.
    pub async fn upload_test_case(
        &self,
        record: &TestCaseRecord,
        run: &RunHandle,
        artifact_root: Option<&Utf8Path>,
        rerun_id: Option<&str>,
    ) -> Result<Option<FinishTestCaseResponse>, UnauthorizedError> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let mut backoff = self.delivery.submit_retries.backoff();
        let mut attempt = 1;
        loop {
            let error = match self
                .try_upload_test_case(record, run, artifact_root, rerun_id)
                .await
            {
                Ok(response) => return Ok(Some(response)),
                Err(DeliveryError::Unauthorized(error)) => return Err(error),
                Err(error) => error,
            };

            let Some(delay) = backoff.next() else {
                error!(
                    "giving up on test case {} after {attempt} attempts: {}",
                    record.id,
                    describe(&error)
                );
                return Ok(None);
            };
            warn!(
                "attempt {attempt} to upload test case {} failed, retrying in {delay:?}: {}",
                record.id,
                describe(&error)
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn try_upload_test_case(
        &self,
        record: &TestCaseRecord,
        run: &RunHandle,
        artifact_root: Option<&Utf8Path>,
        rerun_id: Option<&str>,
    ) -> Result<FinishTestCaseResponse, DeliveryError> {
        let uris = artifact_uris(record);
        if !uris.is_empty() {
            match artifact_root {
                Some(root) => self.upload_artifacts(run, root, &uris).await?,
                None => debug!(
                    id = %record.id,
                    "no artifact root announced, skipping {} {}",
                    uris.len(),
                    plural::artifacts_str(uris.len())
                ),
            }
        }

        let record = self.submitted_record(record);
        let rerun_id = rerun_correlation(&run.id, rerun_id, self.collector.retry_id.as_deref());
        let request = CreateTestCaseRequest {
            run_id: &run.id,
            project_id: &run.project_id,
            test_progress_report: &record,
            browser: &self.collector.browser,
            mode: self.collector.mode,
            rerun_id: rerun_id.as_deref(),
            video_id: self.collector.video_id.as_deref(),
        };
        let response: FinishTestCaseResponse = self
            .call(
                endpoints::CREATE_TEST_CASE,
                self.run_api(endpoints::CREATE_TEST_CASE),
                &request,
                None,
            )
            .await?;

        self.send_analytics_event(&run.project_id).await;
        self.log_report_link(run, record.result.status);
        Ok(response)
    }

    /// Requests upload targets for `uris` and uploads the files that exist.
    ///
    /// Anything short of an authorization failure only costs artifacts.
    async fn upload_artifacts(
        &self,
        run: &RunHandle,
        root: &Utf8Path,
        uris: &[String],
    ) -> Result<(), UnauthorizedError> {
        let request = PresignRequest {
            file_uris: uris,
            run_id: &run.id,
        };
        let upload_urls = match self
            .call::<_, PresignResponse>(
                endpoints::PRESIGN,
                self.run_api(endpoints::PRESIGN),
                &request,
                None,
            )
            .await
        {
            Ok(response) => response.upload_urls,
            Err(DeliveryError::Unauthorized(error)) => return Err(error),
            Err(error) => {
                warn!("skipping artifact upload: {}", describe(&error));
                return Ok(());
            }
        };

        let uploads: Vec<_> = uris
            .iter()
            .filter_map(|uri| {
                let url = upload_urls.get(uri)?;
                Some(self.upload_artifact(root.join(uri), url.clone()))
            })
            .collect();
        let results: Vec<bool> = stream::iter(uploads)
            .buffer_unordered(self.delivery.artifact_concurrency.max(1))
            .collect()
            .await;
        let uploaded = results.into_iter().filter(|uploaded| *uploaded).count();
        debug!(
            "uploaded {uploaded} of {} {}",
            uris.len(),
            plural::artifacts_str(uris.len())
        );
        Ok(())
    }

    /// Returns true if the artifact was uploaded.
    async fn upload_artifact(&self, path: Utf8PathBuf, url: String) -> bool {
        let bytes: Arc<[u8]> = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes.into(),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("artifact {path} doesn't exist, skipping");
                return false;
            }
            Err(error) => {
                warn!(
                    "{}",
                    DisplayErrorChain::new(DeliveryError::ReadArtifact { path, error })
                );
                return false;
            }
        };

        let url: Arc<str> = url.into();
        for attempt in 1..=self.delivery.artifact_retries.max(1) {
            let transport = Arc::clone(&self.transport.0);
            let (url, bytes) = (Arc::clone(&url), Arc::clone(&bytes));
            match tokio::task::spawn_blocking(move || transport.put_bytes(&url, &bytes)).await {
                Ok(Ok(())) => return true,
                Ok(Err(error)) => debug!(
                    attempt,
                    "failed to upload {path}: {}",
                    DisplayErrorChain::new(&error)
                ),
                Err(error) => debug!(attempt, "upload task for {path} didn't complete: {error}"),
            }
        }

        warn!("failed to upload artifact {path}, skipping it");
        false
    }

    /// Replaces an already-submitted test case, typically after a repair.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn modify_test_case(&self, run: &RunHandle, record: &TestCaseRecord) {
        if !self.is_enabled() {
            return;
        }

        let request = ModifyTestCaseRequest {
            run_id: &run.id,
            project_id: &run.project_id,
            test_progress_report: record,
        };
        match self
            .call::<_, Ack>(
                endpoints::MODIFY_TEST_CASE,
                self.run_api(endpoints::MODIFY_TEST_CASE),
                &request,
                None,
            )
            .await
        {
            Ok(_) => self.log_report_link(run, record.result.status),
            Err(error) => warn!(
                "failed to modify test case {}: {}",
                record.id,
                describe(&error)
            ),
        }
    }

    /// Tells the collector that every test case of the run was uploaded.
    pub async fn upload_complete(&self, run: &RunHandle) {
        if !self.is_enabled() {
            return;
        }

        let request = UploadCompletionRequest {
            run_id: &run.id,
            project_id: &run.project_id,
            browser: &self.collector.browser,
            mode: self.collector.mode,
        };
        if let Err(error) = self
            .call::<_, Ack>(
                endpoints::UPLOAD_COMPLETION,
                self.run_api(endpoints::UPLOAD_COMPLETION),
                &request,
                None,
            )
            .await
        {
            warn!("failed to mark run as complete: {}", describe(&error));
            return;
        }
        self.send_analytics_event(&run.project_id).await;
    }

    /// Bumps the project's automated-recovery counter. Best effort.
    pub async fn update_project_analytics(&self, project_id: &str) {
        if !self.is_enabled() {
            return;
        }

        let request = ProjectAnalyticsRequest { project_id };
        if let Err(error) = self
            .post(
                endpoints::PROJECT_ANALYTICS,
                self.run_api(endpoints::PROJECT_ANALYTICS),
                &request,
                None,
            )
            .await
        {
            warn!("failed to update project analytics: {}", describe(&error));
        }
    }

    /// Sends a run status heartbeat. Skipped without a status correlation id;
    /// failures are ignored.
    pub async fn create_status(&self, status: &str) {
        if !self.is_enabled() {
            return;
        }
        let Some(uuid) = &self.collector.status_uuid else {
            return;
        };

        let request = StatusRequest {
            status: StatusBody { status },
            uuid,
        };
        if let Err(error) = self
            .post(endpoints::STATUS, self.run_api(endpoints::STATUS), &request, None)
            .await
        {
            debug!("ignoring failed status heartbeat: {}", describe(&error));
        }
    }

    async fn send_analytics_event(&self, project_id: &str) {
        let request = AnalyticsEvent {
            event: AnalyticsEvent::UPLOAD_REPORT,
        };
        let url = join_url(&self.collector.analytics_url, endpoints::ANALYTICS_EVENT);
        if let Err(error) = self
            .post(
                endpoints::ANALYTICS_EVENT,
                url,
                &request,
                Some((PROJECT_HEADER, project_id.to_owned())),
            )
            .await
        {
            debug!("ignoring failed analytics event: {}", describe(&error));
        }
    }

    fn run_api(&self, endpoint: &str) -> String {
        join_url(&self.collector.base_url, endpoint)
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![(SOURCE_HEADER, SOURCE.to_owned())];
        if let Some(token) = &self.collector.token {
            headers.push(("authorization", format!("Bearer {}", token.expose())));
        }
        headers
    }

    /// In `executions` mode the collector identifies test cases by video id.
    fn submitted_record<'a>(&self, record: &'a TestCaseRecord) -> Cow<'a, TestCaseRecord> {
        match (self.collector.mode, &self.collector.video_id) {
            (RunMode::Executions, Some(video_id)) => Cow::Owned(TestCaseRecord {
                id: video_id.clone(),
                ..record.clone()
            }),
            _ => Cow::Borrowed(record),
        }
    }

    fn log_report_link(&self, run: &RunHandle, status: Status) {
        info!(
            "{status}: report at {}",
            report_link(&self.collector.link_base, &run.project_id, &run.id)
        );
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        endpoint: &'static str,
        url: String,
        body: &T,
        extra_header: Option<(&'static str, String)>,
    ) -> Result<serde_json::Value, DeliveryError> {
        let body = serde_json::to_value(body).map_err(|error| DeliveryError::Transport {
            endpoint,
            error: TransportError::InvalidJson { error },
        })?;
        let mut headers = self.headers();
        headers.extend(extra_header);

        let transport = Arc::clone(&self.transport.0);
        tokio::task::spawn_blocking(move || transport.post_json(&url, &headers, &body))
            .await
            .map_err(|error| DeliveryError::TaskJoin { endpoint, error })?
            .map_err(|error| DeliveryError::from_transport(endpoint, error))
    }

    /// Posts `body` and checks the response's `status` flag.
    async fn call<T, R>(
        &self,
        endpoint: &'static str,
        url: String,
        body: &T,
        extra_header: Option<(&'static str, String)>,
    ) -> Result<R, DeliveryError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned + Acknowledged,
    {
        let value = self.post(endpoint, url, body, extra_header).await?;
        let response: R = serde_json::from_value(value)
            .map_err(|error| DeliveryError::UnexpectedBody { endpoint, error })?;
        if !response.acknowledged() {
            return Err(DeliveryError::Rejected { endpoint });
        }
        Ok(response)
    }
}

/// A collector response carrying a `status` flag.
trait Acknowledged {
    fn acknowledged(&self) -> bool;
}

macro_rules! impl_acknowledged {
    ($($ty:ty),* $(,)?) => {
        $(impl Acknowledged for $ty {
            fn acknowledged(&self) -> bool {
                self.status
            }
        })*
    };
}

impl_acknowledged!(Ack, CreateRunResponse, PresignResponse, FinishTestCaseResponse);

/// Returns the artifact URIs referenced by `record`, relative to the artifact
/// root, without duplicates.
pub fn artifact_uris(record: &TestCaseRecord) -> Vec<String> {
    let step_artifacts = record.steps.iter().flat_map(|step| {
        let screenshots = step
            .commands
            .iter()
            .filter_map(|command| command.screenshot_id.as_deref())
            .map(|id| format!("screenshots/{id}.png"));
        let trace = step
            .trace_file_path
            .as_deref()
            .map(|path| format!("trace/{path}"));
        screenshots.chain(trace)
    });
    let case_trace = record
        .trace_file_id
        .as_deref()
        .map(|id| format!("trace/{id}"));
    let case_log = record
        .log_file_id
        .as_deref()
        .map(|id| format!("editorLogs/testCaseLog_{id}.log"));

    step_artifacts
        .chain(case_trace)
        .chain(case_log)
        .unique()
        .collect()
}

/// Computes the re-run correlation id sent with a test case.
fn rerun_correlation(run_id: &str, rerun_id: Option<&str>, configured: Option<&str>) -> Option<String> {
    match rerun_id {
        Some(rerun_id) if rerun_id.contains(run_id) => Some(rerun_id.to_owned()),
        Some(rerun_id) => Some(format!("{run_id}{rerun_id}")),
        None => configured.map(str::to_owned),
    }
}

fn describe(error: &DeliveryError) -> String {
    match error {
        DeliveryError::Transport {
            endpoint,
            error: TransportError::Status { status, body },
        } => format!(
            "collector call `{endpoint}` failed with {status}: {}",
            sanitize_error_body(*status, body.as_deref())
        ),
        other => DisplayErrorChain::new(other).to_string(),
    }
}
