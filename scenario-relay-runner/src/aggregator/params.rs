// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenario parameters: outline resolution, test data templates and redaction.

use crate::errors::TestDataError;
use camino::Utf8Path;
use indexmap::IndexMap;
use regex::{Captures, Regex};
use scenario_relay_metadata::events::{Pickle, Scenario};
use serde::Deserialize;
use std::{borrow::Cow, sync::LazyLock};

/// Placeholder that replaces the variable part of a redacted value.
pub const REDACTED: &str = "****";

/// Value prefixes whose remainder is never stored.
pub const REDACTED_PREFIXES: &[&str] = &["secret:", "totp:", "mask:"];

/// Redacts a parameter value.
///
/// `secret:`, `totp:` and `mask:` values keep their prefix and have the rest
/// replaced with [`REDACTED`]. Other values are returned unchanged. Redacting
/// an already redacted value yields the same value.
pub fn redact(value: &str) -> Cow<'_, str> {
    match REDACTED_PREFIXES
        .iter()
        .find(|prefix| value.starts_with(**prefix))
    {
        Some(prefix) => Cow::Owned(format!("{prefix}{REDACTED}")),
        None => Cow::Borrowed(value),
    }
}

/// Redacts every value of a parameter map.
pub fn redact_all(parameters: &IndexMap<String, String>) -> IndexMap<String, String> {
    parameters
        .iter()
        .map(|(name, value)| (name.clone(), redact(value).into_owned()))
        .collect()
}

/// Resolves the example-table parameters of an outline pickle.
///
/// The pickle's first AST node id names the scenario; the second, if present,
/// names the example row it was compiled from. Plain scenarios have no
/// parameters.
pub fn outline_parameters(pickle: &Pickle, scenario: &Scenario) -> IndexMap<String, String> {
    let Some(row_id) = pickle.ast_node_ids.get(1) else {
        return IndexMap::new();
    };

    for examples in &scenario.examples {
        let Some(row) = examples.table_body.iter().find(|row| &row.id == row_id) else {
            continue;
        };
        let Some(header) = &examples.table_header else {
            continue;
        };
        return header
            .cells
            .iter()
            .zip(&row.cells)
            .map(|(name, value)| (name.value.clone(), value.value.clone()))
            .collect();
    }

    IndexMap::new()
}

static TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template regex is valid")
});

/// Returns true if `value` references test data.
pub fn is_templated(value: &str) -> bool {
    TEMPLATE_RE.is_match(value)
}

/// Test data used to resolve `{{name}}` parameter templates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestData {
    values: IndexMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TestDataFile {
    Map(IndexMap<String, serde_json::Value>),
    Entries(Vec<TestDataEntry>),
}

#[derive(Deserialize)]
struct TestDataEntry {
    key: String,
    value: serde_json::Value,
}

impl TestData {
    /// Reads test data from a JSON file.
    ///
    /// The file is either an object of name → value, or an array of
    /// `{"key": ..., "value": ...}` entries.
    pub fn load(path: &Utf8Path) -> Result<Self, TestDataError> {
        let contents = std::fs::read_to_string(path).map_err(|error| TestDataError::Read {
            path: path.to_owned(),
            error,
        })?;
        Self::from_json(&contents).map_err(|error| TestDataError::Parse {
            path: path.to_owned(),
            error,
        })
    }

    /// Parses test data from JSON text.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let entries: Vec<(String, serde_json::Value)> = match serde_json::from_str(contents)? {
            TestDataFile::Map(map) => map.into_iter().collect(),
            TestDataFile::Entries(entries) => entries
                .into_iter()
                .map(|entry| (entry.key, entry.value))
                .collect(),
        };
        let values = entries
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();
        Ok(Self { values })
    }

    /// Replaces every `{{name}}` in `value` with the matching test data entry.
    /// Unknown names are left as they are.
    pub fn resolve<'a>(&self, value: &'a str) -> Cow<'a, str> {
        TEMPLATE_RE.replace_all(value, |caps: &Captures<'_>| {
            self.values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;
    use test_strategy::proptest;

    #[test_case("secret:hunter2", "secret:****" ; "secret")]
    #[test_case("totp:JBSWY3DPEHPK3PXP", "totp:****" ; "totp")]
    #[test_case("mask:4111-1111", "mask:****" ; "mask")]
    #[test_case("secret:", "secret:****" ; "empty secret")]
    #[test_case("plain value", "plain value" ; "plain")]
    #[test_case("my secret: x", "my secret: x" ; "prefix not at start")]
    fn redact_values(input: &str, expected: &str) {
        assert_eq!(redact(input), expected);
    }

    #[proptest(cases = 64)]
    fn redaction_hides_secret_and_is_idempotent(
        #[strategy(prop::sample::select(REDACTED_PREFIXES))] prefix: &'static str,
        secret: String,
    ) {
        let redacted = redact(&format!("{prefix}{secret}")).into_owned();
        prop_assert_eq!(&redacted, &format!("{prefix}{REDACTED}"));
        prop_assert_eq!(redact(&redacted).into_owned(), redacted);
    }

    #[proptest(cases = 64)]
    fn redaction_leaves_other_values_alone(
        #[filter(!REDACTED_PREFIXES.iter().any(|prefix| #value.starts_with(prefix)))] value: String,
    ) {
        prop_assert_eq!(redact(&value), value.as_str());
    }

    #[test]
    fn outline_row_parameters() {
        let scenario: Scenario = serde_json::from_str(indoc! {r#"
            {
                "id": "sc-1",
                "name": "login as <user>",
                "steps": [],
                "examples": [{
                    "id": "ex-1",
                    "name": "",
                    "tableHeader": {"id": "h", "cells": [{"value": "user"}, {"value": "password"}]},
                    "tableBody": [
                        {"id": "row-1", "cells": [{"value": "alice"}, {"value": "secret:a"}]},
                        {"id": "row-2", "cells": [{"value": "bob"}, {"value": "secret:b"}]}
                    ]
                }]
            }
        "#})
        .unwrap();
        let pickle = Pickle {
            id: "p-2".to_owned(),
            uri: "a.feature".to_owned(),
            name: "login as bob".to_owned(),
            ast_node_ids: vec!["sc-1".to_owned(), "row-2".to_owned()],
            steps: vec![],
        };

        let parameters = outline_parameters(&pickle, &scenario);
        assert_eq!(
            parameters.iter().collect::<Vec<_>>(),
            vec![
                (&"user".to_owned(), &"bob".to_owned()),
                (&"password".to_owned(), &"secret:b".to_owned())
            ]
        );
        assert_eq!(redact_all(&parameters)["password"], "secret:****");

        let plain = Pickle {
            ast_node_ids: vec!["sc-1".to_owned()],
            ..pickle
        };
        assert!(outline_parameters(&plain, &scenario).is_empty());
    }

    #[test]
    fn test_data_shapes() {
        let map = TestData::from_json(r#"{"user": "alice", "pin": 1234}"#).unwrap();
        let entries =
            TestData::from_json(r#"[{"key": "user", "value": "alice"}, {"key": "pin", "value": 1234}]"#)
                .unwrap();
        assert_eq!(map, entries);
        assert_eq!(map.resolve("{{user}}/{{ pin }}"), "alice/1234");
        assert_eq!(map.resolve("{{missing}}"), "{{missing}}");
        assert!(is_templated("{{user}}"));
        assert!(!is_templated("user"));
    }

    #[test]
    fn test_data_load_errors() {
        let dir = camino_tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            TestData::load(&missing),
            Err(TestDataError::Read { .. })
        ));

        let malformed = dir.path().join("data.json");
        std::fs::write(&malformed, "{not json").unwrap();
        assert!(matches!(
            TestData::load(&malformed),
            Err(TestDataError::Parse { .. })
        ));
    }
}
