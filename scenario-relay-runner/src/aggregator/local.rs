// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Files written by the aggregator: local test case reports and case logs.

use crate::errors::AggregateError;
use atomicwrites::{AllowOverwrite, AtomicFile};
use camino::{Utf8Path, Utf8PathBuf};
use scenario_relay_metadata::report::TestCaseRecord;
use std::io::Write;

/// Writes finished test cases to a directory instead of uploading them.
///
/// Files are named `<n>_<scenario name>.json`, with `n` counting up from 1.
#[derive(Debug)]
pub(crate) struct LocalReportWriter {
    dir: Utf8PathBuf,
    written: usize,
}

impl LocalReportWriter {
    pub(crate) fn new(dir: Utf8PathBuf) -> Self {
        Self { dir, written: 0 }
    }

    pub(crate) fn write(&mut self, record: &TestCaseRecord) -> Result<Utf8PathBuf, AggregateError> {
        std::fs::create_dir_all(&self.dir).map_err(|error| AggregateError::LocalPersist {
            path: self.dir.clone(),
            error: atomicwrites::Error::Internal(error),
        })?;

        self.written += 1;
        let path = self.dir.join(format!(
            "{}_{}.json",
            self.written,
            sanitize_file_name(&record.scenario_name)
        ));

        AtomicFile::new(&path, AllowOverwrite)
            .write(|file| {
                serde_json::to_writer_pretty(file, record)?;
                Ok::<_, std::io::Error>(())
            })
            .map_err(|error| AggregateError::LocalPersist {
                path: path.clone(),
                error,
            })?;

        Ok(path)
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Returns the path of the case log for test case `id` under `artifact_root`.
pub(crate) fn case_log_path(artifact_root: &Utf8Path, id: &str) -> Utf8PathBuf {
    artifact_root
        .join("editorLogs")
        .join(format!("testCaseLog_{id}.log"))
}

/// Writes captured case log text next to the other artifacts.
pub(crate) fn write_case_log(
    artifact_root: &Utf8Path,
    id: &str,
    text: &str,
) -> Result<Utf8PathBuf, atomicwrites::Error<std::io::Error>> {
    let path = case_log_path(artifact_root, id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(atomicwrites::Error::Internal)?;
    }
    AtomicFile::new(&path, AllowOverwrite).write(|file| file.write_all(text.as_bytes()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use pretty_assertions::assert_eq;

    #[test]
    fn writes_numbered_files() {
        let dir = tempdir().unwrap();
        let mut writer = LocalReportWriter::new(dir.path().join("reports"));

        let first = TestCaseRecord {
            scenario_name: "login/logout".to_owned(),
            ..TestCaseRecord::default()
        };
        let second = TestCaseRecord {
            scenario_name: "checkout".to_owned(),
            ..TestCaseRecord::default()
        };

        let first_path = writer.write(&first).unwrap();
        let second_path = writer.write(&second).unwrap();
        assert_eq!(first_path.file_name(), Some("1_login_logout.json"));
        assert_eq!(second_path.file_name(), Some("2_checkout.json"));

        let read_back: TestCaseRecord =
            serde_json::from_str(&std::fs::read_to_string(&first_path).unwrap()).unwrap();
        assert_eq!(read_back, first);
    }

    #[test]
    fn case_log_lands_under_editor_logs() {
        let dir = tempdir().unwrap();
        let path = write_case_log(dir.path(), "tcs-1", "hello\n").unwrap();
        assert_eq!(path, dir.path().join("editorLogs/testCaseLog_tcs-1.log"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }
}
