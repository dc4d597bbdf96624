// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for scenario-relay-runner.

use http::StatusCode;

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "test case" if `count` is 1, otherwise "test cases".
    pub fn test_cases_str(count: usize) -> &'static str {
        if count == 1 { "test case" } else { "test cases" }
    }

    /// Returns "artifact" if `count` is 1, otherwise "artifacts".
    pub fn artifacts_str(count: usize) -> &'static str {
        if count == 1 { "artifact" } else { "artifacts" }
    }

    /// Returns "failure" if `count` is 1, otherwise "failures".
    pub fn failures_str(count: usize) -> &'static str {
        if count == 1 { "failure" } else { "failures" }
    }
}

/// Milliseconds since the Unix epoch, for results the engine didn't timestamp.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Collapses a collector error body into something fit for a log line.
///
/// HTML error pages (typically from a proxy in front of the collector) become
/// a one-line note, JSON bodies are pretty-printed, and anything else is
/// trimmed.
pub(crate) fn sanitize_error_body(status: StatusCode, body: Option<&str>) -> String {
    let Some(body) = body.map(str::trim).filter(|body| !body.is_empty()) else {
        return format!("no response body (status: {status})");
    };

    if body.contains("<!DOCTYPE html") || body.starts_with("<html") {
        return format!(
            "[HTML_ERROR_PAGE] status={} - likely a proxy timeout or gateway error",
            status.as_u16()
        );
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && (value.is_object() || value.is_array())
        && let Ok(pretty) = serde_json::to_string_pretty(&value)
    {
        return pretty;
    }

    body.to_owned()
}

/// Returns the link to a run's report on the collector's web UI.
pub(crate) fn report_link(link_base: &str, project_id: &str, run_id: &str) -> String {
    format!(
        "{}/{project_id}/run-report/{run_id}",
        link_base.trim_end_matches('/')
    )
}

/// Joins a base URL and an endpoint path, ignoring a trailing slash on the base.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use test_case::test_case;

    #[test]
    fn sanitize_html_page() {
        let body = indoc! {r#"
            <!DOCTYPE html>
            <html><head><title>502 Bad Gateway</title></head><body>...</body></html>
        "#};
        assert_eq!(
            sanitize_error_body(StatusCode::BAD_GATEWAY, Some(body)),
            "[HTML_ERROR_PAGE] status=502 - likely a proxy timeout or gateway error"
        );
    }

    #[test]
    fn sanitize_json_body() {
        assert_eq!(
            sanitize_error_body(StatusCode::BAD_REQUEST, Some(r#"{"error":"bad run id"}"#)),
            "{\n  \"error\": \"bad run id\"\n}"
        );
    }

    #[test_case(Some("  rate limited \n"), "rate limited" ; "plain text")]
    #[test_case(Some("   "), "no response body (status: 500 Internal Server Error)" ; "blank")]
    #[test_case(None, "no response body (status: 500 Internal Server Error)" ; "missing")]
    fn sanitize_other_bodies(body: Option<&str>, expected: &str) {
        assert_eq!(
            sanitize_error_body(StatusCode::INTERNAL_SERVER_ERROR, body),
            expected
        );
    }

    #[test]
    fn report_link_trims_slash() {
        assert_eq!(
            report_link("https://app.example.com/", "proj", "run"),
            "https://app.example.com/proj/run-report/run"
        );
    }
}
