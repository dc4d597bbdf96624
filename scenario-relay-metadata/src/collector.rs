// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request and response bodies for the remote collector API.
//!
//! Every response carries a `status` flag; a response is only considered
//! successful if the HTTP status is 200 and this flag is true.

use crate::report::{RootCause, RunEnvironment, TestCaseRecord};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Identifies a run on the collector.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunHandle {
    #[serde(alias = "_id")]
    pub id: String,
    pub project_id: String,
}

/// How the run was launched, as reported to the collector.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Local,
    Cloud,
    Executions,
}

/// Body of `POST /cucumber-runs/create`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest<'a> {
    pub name: &'a str,
    pub branch: &'a str,
    #[serde(rename = "video_id", skip_serializing_if = "Option::is_none")]
    pub video_id: Option<&'a str>,
    pub browser: &'a str,
    pub mode: RunMode,
    pub env: &'a RunEnvironment,
}

/// Response to `POST /cucumber-runs/create`.
#[derive(Clone, Debug, Deserialize)]
pub struct CreateRunResponse {
    pub status: bool,
    #[serde(default)]
    pub run: Option<RunHandle>,
}

/// Body of `POST /cucumber-runs/generateuploadurls`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest<'a> {
    pub file_uris: &'a [String],
    pub run_id: &'a str,
}

/// Response to `POST /cucumber-runs/generateuploadurls`: artifact URI → upload URL.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub status: bool,
    #[serde(default)]
    pub upload_urls: IndexMap<String, String>,
}

/// Body of `POST /cucumber-runs/createNewTestCase`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestCaseRequest<'a> {
    pub run_id: &'a str,
    pub project_id: &'a str,
    pub test_progress_report: &'a TestCaseRecord,
    pub browser: &'a str,
    pub mode: RunMode,
    pub rerun_id: Option<&'a str>,
    #[serde(rename = "video_id", skip_serializing_if = "Option::is_none")]
    pub video_id: Option<&'a str>,
}

/// Response to `POST /cucumber-runs/createNewTestCase`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinishTestCaseResponse {
    pub status: bool,
    #[serde(default)]
    pub root_cause: Option<RootCause>,
    #[serde(default)]
    pub report: Option<TestCaseRecord>,
}

/// Body of `POST /cucumber-runs/modifyTestCase`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyTestCaseRequest<'a> {
    pub run_id: &'a str,
    pub project_id: &'a str,
    pub test_progress_report: &'a TestCaseRecord,
}

/// Body of `POST /cucumber-runs/uploadCompletion`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompletionRequest<'a> {
    pub run_id: &'a str,
    pub project_id: &'a str,
    pub browser: &'a str,
    pub mode: RunMode,
}

/// Body of `POST /project/updateAIRecoveryCount`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectAnalyticsRequest<'a> {
    pub project_id: &'a str,
}

/// Body of `POST /scenarios/status`.
#[derive(Clone, Debug, Serialize)]
pub struct StatusRequest<'a> {
    pub status: StatusBody<'a>,
    pub uuid: &'a str,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusBody<'a> {
    pub status: &'a str,
}

/// Body of `POST <analytics>/event`.
#[derive(Clone, Debug, Serialize)]
pub struct AnalyticsEvent<'a> {
    pub event: &'a str,
}

impl AnalyticsEvent<'_> {
    /// Emitted whenever report data is uploaded.
    pub const UPLOAD_REPORT: &'static str = "upload_report";
}

/// Generic acknowledgement returned by endpoints with no other payload.
#[derive(Clone, Debug, Deserialize)]
pub struct Ack {
    pub status: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn finish_response_with_root_cause() {
        let body = indoc! {r#"
            {
                "status": true,
                "rootCause": {
                    "status": false,
                    "analysis": "locator changed",
                    "failedStep": 2,
                    "failClass": "locator"
                }
            }
        "#};
        let response: FinishTestCaseResponse = serde_json::from_str(body).unwrap();
        let root_cause = response.root_cause.unwrap();
        assert!(root_cause.is_unresolved());
        assert_eq!(root_cause.failed_step, 2);
        assert_eq!(response.report, None);
    }

    #[test]
    fn run_handle_accepts_mongo_style_id() {
        let handle: RunHandle =
            serde_json::from_str(r#"{"_id":"run-1","projectId":"proj-1"}"#).unwrap();
        assert_eq!(
            handle,
            RunHandle {
                id: "run-1".to_owned(),
                project_id: "proj-1".to_owned(),
            }
        );
    }

    #[test]
    fn create_run_request_shape() {
        let env = RunEnvironment {
            name: Some("staging".to_owned()),
            base_url: Some("https://staging.example.com".to_owned()),
        };
        let request = CreateRunRequest {
            name: "nightly",
            branch: "main",
            video_id: None,
            browser: "chromium",
            mode: RunMode::Cloud,
            env: &env,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "name": "nightly",
                "branch": "main",
                "browser": "chromium",
                "mode": "cloud",
                "env": {"name": "staging", "baseUrl": "https://staging.example.com"},
            })
        );
    }
}
